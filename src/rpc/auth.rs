//! Placement and verification of the DCERPC auth trailer on data PDUs.
//!
//! The trailer layout forces an awkward construction order: the signature is
//! computed over the serialized PDU (header, body, padding, and the trailer
//! header itself) but is also carried inside that same PDU as the trailer's
//! `auth_value`. So PDUs are serialized with the length fields patched first
//! and the signature appended last, and verification splits the received
//! buffer along the same seams.

use msrpc_pdu::pdu::{
    set_auth_len, set_frag_len, AuthenticationLevel, PacketFlags, PacketType, PduHeader, SecurityProvider,
    SecurityTrailer, PDU_HEADER_SIZE,
};
use msrpc_pdu::{Decode, Encode, EncodeExt};

use crate::gensec::Mechanism;
use crate::{Error, Result};

/// The sealed region is padded to this alignment before the trailer.
pub(crate) const AUTH_PAD_ALIGNMENT: usize = 16;

/// One connection's negotiated security state: the `(auth_type, auth_level,
/// auth_context_id)` triple plus the live mechanism context. Frozen once the
/// connection is fully bound.
#[derive(Debug)]
pub struct AuthContext {
    pub security_type: SecurityProvider,
    pub level: AuthenticationLevel,
    pub context_id: u32,
    /// Whether `PFC_SUPPORT_HEADER_SIGN` was negotiated: signatures then
    /// also cover the PDU header and the trailer header.
    pub sign_header: bool,
    pub mech: Box<dyn Mechanism>,
}

impl AuthContext {
    pub fn is_established(&self) -> bool {
        self.mech.is_established()
    }

    /// Trailer bytes added to every protected data PDU.
    pub fn trailer_overhead(&self) -> usize {
        SecurityTrailer::HEADER_SIZE + self.mech.signature_size()
    }

    /// Whether data PDUs on this connection carry per-packet trailers.
    pub fn protects_packets(&self) -> bool {
        self.level.is_signed()
    }

    pub(crate) fn empty_trailer(&self, pad_length: u8) -> SecurityTrailer {
        SecurityTrailer {
            security_type: self.security_type,
            level: self.level,
            pad_length,
            context_id: self.context_id,
            auth_value: Vec::new(),
        }
    }

    /// Builds the trailer for a bind-family PDU carrying a raw mechanism
    /// token instead of a packet signature.
    pub(crate) fn token_trailer(&self, token: Vec<u8>) -> SecurityTrailer {
        SecurityTrailer {
            security_type: self.security_type,
            level: self.level,
            pad_length: 0,
            context_id: self.context_id,
            auth_value: token,
        }
    }
}

/// Usable stub bytes per data PDU for the given negotiated fragment size.
///
/// Authenticated levels reserve the trailer and signature and round down to
/// the padding alignment so every non-final fragment seals a whole number of
/// blocks.
pub(crate) fn data_chunk_size(max_frag: u16, body_header_len: usize, auth: Option<&AuthContext>) -> Result<usize> {
    let space = usize::from(max_frag)
        .checked_sub(PDU_HEADER_SIZE + body_header_len)
        .unwrap_or_default();

    let chunk = match auth {
        Some(auth) if auth.protects_packets() => {
            space.saturating_sub(auth.trailer_overhead()) / AUTH_PAD_ALIGNMENT * AUTH_PAD_ALIGNMENT
        }
        _ => space,
    };

    if chunk < AUTH_PAD_ALIGNMENT {
        return Err(Error::InvalidParameter(format!(
            "negotiated fragment size {} leaves no room for stub data",
            max_frag
        )));
    }

    Ok(chunk)
}

/// Splits a stub into `(first, last, chunk)` fragments. A zero-length stub
/// still produces one (empty) fragment.
pub(crate) fn split_stub(stub: &[u8], chunk_size: usize) -> Vec<(bool, bool, &[u8])> {
    if stub.is_empty() {
        return vec![(true, true, stub)];
    }

    let count = stub.len().div_ceil(chunk_size);

    stub.chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| (index == 0, index == count - 1, chunk))
        .collect()
}

/// Serializes one data PDU (REQUEST or RESPONSE), appending and signing the
/// auth trailer when the connection's auth level asks for it.
///
/// `body_header` is the fixed part of the body (the request/response header
/// without stub data), already serialized.
pub(crate) fn build_data_pdu(
    packet_type: PacketType,
    packet_flags: PacketFlags,
    call_id: u32,
    body_header: &[u8],
    stub_chunk: &[u8],
    mut auth: Option<&mut AuthContext>,
) -> Result<Vec<u8>> {
    let auth = auth.as_deref_mut().filter(|auth| auth.protects_packets());

    let mut header = PduHeader::new(packet_type, packet_flags, 0, call_id);
    if let Some(auth) = auth.as_ref() {
        if auth.sign_header {
            header.packet_flags |= PacketFlags::PfcSupportHeaderSign;
        }
    }

    let mut pdu = header.encode_to_vec()?;
    pdu.extend_from_slice(body_header);
    pdu.extend_from_slice(stub_chunk);

    let Some(auth) = auth else {
        let frag_len = pdu.len().try_into()?;
        set_frag_len(&mut pdu, frag_len)?;

        return Ok(pdu);
    };

    let pad_length = (AUTH_PAD_ALIGNMENT - stub_chunk.len() % AUTH_PAD_ALIGNMENT) % AUTH_PAD_ALIGNMENT;
    pdu.extend(std::iter::repeat_n(0u8, pad_length));

    let trailer = auth.empty_trailer(pad_length.try_into()?);
    trailer.encode(&mut pdu)?;

    let signature_size = auth.mech.signature_size();
    let frag_len = (pdu.len() + signature_size).try_into()?;
    set_frag_len(&mut pdu, frag_len)?;
    set_auth_len(&mut pdu, signature_size.try_into()?)?;

    let body_start = PDU_HEADER_SIZE + body_header.len();
    let trailer_start = pdu.len() - SecurityTrailer::HEADER_SIZE;

    let (head, rest) = pdu.split_at_mut(body_start);
    let (data, trailer_header) = rest.split_at_mut(trailer_start - body_start);

    let (sign_head, sign_trailer): (&[u8], &[u8]) = if auth.sign_header {
        (head, trailer_header)
    } else {
        (&[], &[])
    };

    let signature = if auth.level.is_sealed() {
        auth.mech.seal(sign_head, data, sign_trailer)?
    } else {
        auth.mech.sign(sign_head, data, sign_trailer)?
    };

    if signature.len() != signature_size {
        return Err(Error::Protocol(format!(
            "mechanism produced a {}-byte signature, announced {}",
            signature.len(),
            signature_size
        )));
    }

    pdu.extend_from_slice(&signature);

    Ok(pdu)
}

/// Verifies and (at the privacy level) decrypts one received data PDU,
/// returning the plaintext stub with the auth padding stripped.
///
/// `body_header_len` is the size of the fixed body part for this packet
/// type. Authentication failures come back as [Error::AccessDenied]; length
/// inconsistencies are protocol errors.
pub(crate) fn unprotect_data_pdu(
    raw: &[u8],
    header: &PduHeader,
    body_header_len: usize,
    auth: &mut AuthContext,
) -> Result<Vec<u8>> {
    let frag_len = usize::from(header.frag_len);
    let body_start = PDU_HEADER_SIZE + body_header_len;

    if header.auth_len == 0 {
        return Err(Error::AccessDenied(String::from(
            "the PDU carries no auth trailer on an authenticated connection",
        )));
    }

    let trailer_total = SecurityTrailer::HEADER_SIZE + usize::from(header.auth_len);
    let trailer_start = frag_len
        .checked_sub(trailer_total)
        .filter(|trailer_start| *trailer_start >= body_start)
        .ok_or(msrpc_pdu::Error::TrailerLengthMismatch {
            stub: frag_len.saturating_sub(body_start),
            trailer: trailer_total,
        })?;

    let trailer = SecurityTrailer::decode(&raw[trailer_start..])?;
    if trailer.security_type != auth.security_type || trailer.level != auth.level {
        return Err(Error::AccessDenied(format!(
            "auth trailer ({:?}, {:?}) does not match the negotiated security state",
            trailer.security_type, trailer.level
        )));
    }

    let head = &raw[..body_start];
    let mut data = raw[body_start..trailer_start].to_vec();
    let trailer_header = &raw[trailer_start..trailer_start + SecurityTrailer::HEADER_SIZE];
    let signature = &raw[trailer_start + SecurityTrailer::HEADER_SIZE..frag_len];

    let (sign_head, sign_trailer): (&[u8], &[u8]) = if auth.sign_header {
        (head, trailer_header)
    } else {
        (&[], &[])
    };

    if auth.level.is_sealed() {
        auth.mech.unseal(sign_head, &mut data, sign_trailer, signature)?;
    } else {
        auth.mech.verify(sign_head, &data, sign_trailer, signature)?;
    }

    let pad_length = usize::from(trailer.pad_length);
    if pad_length > data.len() {
        return Err(Error::Protocol(format!(
            "auth_pad_length {} exceeds the {}-byte stub",
            pad_length,
            data.len()
        )));
    }
    data.truncate(data.len() - pad_length);

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gensec::{AuthIdentity, GensecConfig, Mechanism, Role};
    use crate::ntlmssp::{NtlmConfig, Ntlmssp};
    use msrpc_pdu::pdu::PacketType;

    fn established_auth_pair(level: AuthenticationLevel) -> (AuthContext, AuthContext) {
        let client_config = GensecConfig {
            identity: Some(AuthIdentity::new("user", "D", "pw")),
            ntlm: NtlmConfig::new(String::from("WKS")),
            ..Default::default()
        };
        let server_config = GensecConfig {
            server_identities: vec![AuthIdentity::new("user", "D", "pw")],
            ..Default::default()
        };

        let mut client = Ntlmssp::new(Role::Client, &client_config).unwrap();
        let mut server = Ntlmssp::new(Role::Server, &server_config).unwrap();

        let negotiate = client.update(&[]).unwrap();
        let challenge = server.update(negotiate.token()).unwrap();
        let authenticate = client.update(challenge.token()).unwrap();
        server.update(authenticate.token()).unwrap();

        let make = |mech: Ntlmssp| AuthContext {
            security_type: SecurityProvider::Winnt,
            level,
            context_id: 0,
            sign_header: true,
            mech: Box::new(mech),
        };

        (make(client), make(server))
    }

    fn request_header(stub_len: u32) -> Vec<u8> {
        let request = msrpc_pdu::request::Request {
            alloc_hint: stub_len,
            context_id: 0,
            opnum: 5,
            obj: None,
            stub_data: Vec::new(),
        };

        request.encode_to_vec().unwrap()
    }

    #[test]
    fn sealed_pdu_round_trip() {
        let (mut client, mut server) = established_auth_pair(AuthenticationLevel::PktPrivacy);

        let stub = vec![0x5a; 100];
        let pdu = build_data_pdu(
            PacketType::Request,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            3,
            &request_header(100),
            &stub,
            Some(&mut client),
        )
        .unwrap();

        // The stub must not appear in the clear.
        assert!(!pdu.windows(stub.len()).any(|window| window == stub));

        let header = PduHeader::decode(&pdu as &[u8]).unwrap();
        assert_eq!(usize::from(header.frag_len), pdu.len());

        let recovered = unprotect_data_pdu(&pdu, &header, 8, &mut server).unwrap();
        assert_eq!(recovered, stub);
    }

    #[test]
    fn tampered_stub_is_access_denied() {
        let (mut client, mut server) = established_auth_pair(AuthenticationLevel::PktPrivacy);

        let stub = vec![0x11; 64];
        let mut pdu = build_data_pdu(
            PacketType::Request,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            4,
            &request_header(64),
            &stub,
            Some(&mut client),
        )
        .unwrap();

        // Flip one bit inside the sealed stub region.
        pdu[PDU_HEADER_SIZE + 8] ^= 0x01;

        let header = PduHeader::decode(&pdu as &[u8]).unwrap();
        assert!(matches!(
            unprotect_data_pdu(&pdu, &header, 8, &mut server),
            Err(Error::AccessDenied(_))
        ));
    }

    #[test]
    fn integrity_level_signs_without_encrypting() {
        let (mut client, mut server) = established_auth_pair(AuthenticationLevel::PktIntegrity);

        let stub = b"plaintext but signed".to_vec();
        let pdu = build_data_pdu(
            PacketType::Request,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            5,
            &request_header(stub.len() as u32),
            &stub,
            Some(&mut client),
        )
        .unwrap();

        assert!(pdu.windows(stub.len()).any(|window| window == stub));

        let header = PduHeader::decode(&pdu as &[u8]).unwrap();
        assert_eq!(unprotect_data_pdu(&pdu, &header, 8, &mut server).unwrap(), stub);
    }

    #[test]
    fn announced_trailer_must_fit_the_stub() {
        let (mut client, mut server) = established_auth_pair(AuthenticationLevel::PktIntegrity);

        let pdu = build_data_pdu(
            PacketType::Request,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            6,
            &request_header(4),
            &[1, 2, 3, 4],
            Some(&mut client),
        )
        .unwrap();

        let mut header = PduHeader::decode(&pdu as &[u8]).unwrap();
        // Announce a trailer bigger than the whole PDU.
        header.auth_len = header.frag_len;

        assert!(matches!(
            unprotect_data_pdu(&pdu, &header, 8, &mut server),
            Err(Error::Pdu(msrpc_pdu::Error::TrailerLengthMismatch { .. }))
        ));
    }

    #[test]
    fn chunk_size_is_a_multiple_of_the_pad_alignment() {
        let (client, _) = established_auth_pair(AuthenticationLevel::PktPrivacy);

        let chunk = data_chunk_size(4096, 8, Some(&client)).unwrap();
        assert_eq!(chunk % AUTH_PAD_ALIGNMENT, 0);
        assert!(chunk <= 4096 - PDU_HEADER_SIZE - 8 - client.trailer_overhead());
    }

    #[test]
    fn split_stub_reproduces_the_original() {
        let stub: Vec<u8> = (0..50_000u32).map(|value| value as u8).collect();
        let fragments = split_stub(&stub, 4064);

        assert_eq!(fragments.len(), stub.len().div_ceil(4064));
        assert!(fragments[0].0);
        assert!(fragments[fragments.len() - 1].1);
        assert!(fragments[..fragments.len() - 1].iter().all(|(_, last, _)| !last));

        let reassembled: Vec<u8> = fragments.iter().flat_map(|(_, _, chunk)| chunk.iter().copied()).collect();
        assert_eq!(reassembled, stub);
    }

    #[test]
    fn empty_stub_still_produces_one_fragment() {
        let fragments = split_stub(&[], 4096);

        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].0 && fragments[0].1);
        assert!(fragments[0].2.is_empty());
    }
}
