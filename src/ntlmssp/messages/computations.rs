use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, WriteBytesExt};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{compute_hmac_md5, compute_md4, compute_md5, HASH_SIZE};
use crate::gensec::AuthIdentity;
use crate::ntlmssp::messages::av_pair::{AvPair, MsvAvFlags, AV_PAIR_EOL, AV_PAIR_FLAGS, AV_PAIR_TIMESTAMP};
use crate::ntlmssp::{CHALLENGE_SIZE, MESSAGE_INTEGRITY_CHECK_SIZE, SESSION_KEY_SIZE};
use crate::utils::string_to_utf16;
use crate::{Error, Result};

/// Number of 100ns intervals between 1601-01-01 and the Unix epoch.
const WINDOWS_EPOCH_OFFSET_SECONDS: u64 = 11_644_473_600;

const NT_V2_RESPONSE_BASE_SIZE: usize = 28;

pub(crate) fn generate_challenge() -> Result<[u8; CHALLENGE_SIZE]> {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut challenge);

    Ok(challenge)
}

pub(crate) fn generate_session_key() -> Result<[u8; SESSION_KEY_SIZE]> {
    let mut session_key = [0u8; SESSION_KEY_SIZE];
    OsRng.fill_bytes(&mut session_key);

    Ok(session_key)
}

pub(crate) fn now_file_time_timestamp() -> u64 {
    let since_unix_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    (since_unix_epoch.as_secs() + WINDOWS_EPOCH_OFFSET_SECONDS) * 10_000_000
        + u64::from(since_unix_epoch.subsec_nanos() / 100)
}

pub(crate) fn get_challenge_target_info(timestamp: u64) -> Result<Vec<u8>> {
    // Windows requires the domain/computer name fields to be present but does
    // not care what they contain.
    let av_pairs = vec![
        AvPair::NbDomainName(Vec::new()),
        AvPair::NbComputerName(Vec::new()),
        AvPair::DnsDomainName(Vec::new()),
        AvPair::DnsComputerName(Vec::new()),
        AvPair::Timestamp(timestamp),
        AvPair::EOL,
    ];

    AvPair::list_to_buffer(&av_pairs)
}

pub(crate) fn get_authenticate_target_info(target_info: &[u8]) -> Result<Vec<u8>> {
    let mut av_pairs = AvPair::buffer_to_av_pairs(target_info)?;

    av_pairs.retain(|av_pair| av_pair.as_u16() != AV_PAIR_EOL);

    // The MIC is always present in the AUTHENTICATE messages we produce.
    av_pairs.push(AvPair::Flags(MsvAvFlags::MESSAGE_INTEGRITY_CHECK.bits()));

    let mut authenticate_target_info = AvPair::list_to_buffer(&av_pairs)?;

    // AvEOL ([0x00; 4]) + reserved ([0x00; 4])
    authenticate_target_info.write_u64::<LittleEndian>(0x00)?;

    Ok(authenticate_target_info)
}

pub(crate) fn get_av_flags(av_pairs: &[AvPair]) -> MsvAvFlags {
    if let Some(AvPair::Flags(value)) = av_pairs.iter().find(|av_pair| av_pair.as_u16() == AV_PAIR_FLAGS) {
        MsvAvFlags::from_bits(*value).unwrap_or_else(MsvAvFlags::empty)
    } else {
        MsvAvFlags::empty()
    }
}

pub(crate) fn get_challenge_timestamp(target_info: &[u8]) -> Result<u64> {
    let av_pairs = AvPair::buffer_to_av_pairs(target_info)?;

    if let Some(AvPair::Timestamp(value)) = av_pairs.iter().find(|av_pair| av_pair.as_u16() == AV_PAIR_TIMESTAMP) {
        Ok(*value)
    } else {
        Ok(now_file_time_timestamp())
    }
}

pub(crate) fn generate_signing_key(exported_session_key: &[u8], sign_magic: &[u8]) -> [u8; HASH_SIZE] {
    let mut value = exported_session_key.to_vec();
    value.extend_from_slice(sign_magic);

    compute_md5(value.as_ref())
}

pub(crate) fn compute_message_integrity_check(
    negotiate_message: &[u8],
    challenge_message: &[u8],
    authenticate_message: &[u8],
    exported_session_key: &[u8],
) -> Result<[u8; MESSAGE_INTEGRITY_CHECK_SIZE]> {
    let mut message_integrity_check = negotiate_message.to_vec();
    message_integrity_check.extend_from_slice(challenge_message);
    message_integrity_check.extend_from_slice(authenticate_message);

    Ok(compute_hmac_md5(exported_session_key, message_integrity_check.as_ref())?)
}

pub(crate) fn compute_ntlm_v2_hash(identity: &AuthIdentity) -> Result<[u8; HASH_SIZE]> {
    if identity.username.is_empty() {
        return Err(Error::InvalidParameter(String::from("got an empty identity")));
    }

    let nt_hash = compute_md4(&string_to_utf16(&identity.password));

    let mut user_uppercase_with_domain = string_to_utf16(identity.username.to_uppercase().as_str());
    user_uppercase_with_domain.extend_from_slice(&string_to_utf16(&identity.domain));

    Ok(compute_hmac_md5(&nt_hash, &user_uppercase_with_domain)?)
}

pub(crate) fn compute_ntlm_v2_response(
    client_challenge: &[u8],
    server_challenge: &[u8],
    target_info: &[u8],
    ntlm_v2_hash: &[u8],
    timestamp: u64,
) -> Result<(Vec<u8>, [u8; HASH_SIZE])> {
    let mut ntlm_v2_temp = Vec::with_capacity(NT_V2_RESPONSE_BASE_SIZE);
    ntlm_v2_temp.write_u8(1)?; // RespType 1 byte
    ntlm_v2_temp.write_u8(1)?; // HighRespType 1 byte
    ntlm_v2_temp.write_u16::<LittleEndian>(0)?; // Reserved1 2 bytes
    ntlm_v2_temp.write_u32::<LittleEndian>(0)?; // Reserved2 4 bytes
    ntlm_v2_temp.write_u64::<LittleEndian>(timestamp)?; // Timestamp 8 bytes
    ntlm_v2_temp.extend(client_challenge); // ClientChallenge 8 bytes
    ntlm_v2_temp.write_u32::<LittleEndian>(0)?; // Reserved3 4 bytes
    ntlm_v2_temp.extend(target_info); // TargetInfo

    let mut nt_proof_input = server_challenge.to_vec();
    nt_proof_input.extend(ntlm_v2_temp.as_slice());
    let nt_proof = compute_hmac_md5(ntlm_v2_hash, nt_proof_input.as_ref())?;

    let mut nt_challenge_response = nt_proof.to_vec();
    nt_challenge_response.append(ntlm_v2_temp.as_mut());

    let key_exchange_key = compute_hmac_md5(ntlm_v2_hash, nt_proof.as_ref())?;

    Ok((nt_challenge_response, key_exchange_key))
}

/// Recomputes the NTLMv2 proof for an incoming `NtChallengeResponse` and
/// returns it together with the key-exchange key.
pub(crate) fn verify_ntlm_v2_response(
    nt_challenge_response: &[u8],
    server_challenge: &[u8],
    ntlm_v2_hash: &[u8],
) -> Result<[u8; HASH_SIZE]> {
    if nt_challenge_response.len() < HASH_SIZE + NT_V2_RESPONSE_BASE_SIZE {
        return Err(Error::InvalidParameter(String::from(
            "NtChallengeResponse is too short for an NTLMv2 response",
        )));
    }

    let (nt_proof, temp) = nt_challenge_response.split_at(HASH_SIZE);

    let mut nt_proof_input = server_challenge.to_vec();
    nt_proof_input.extend_from_slice(temp);
    let expected_proof = compute_hmac_md5(ntlm_v2_hash, &nt_proof_input)?;

    if nt_proof != expected_proof {
        return Err(Error::LogonFailure(String::from(
            "NTLMv2 proof does not match the supplied credentials",
        )));
    }

    Ok(compute_hmac_md5(ntlm_v2_hash, nt_proof)?)
}

/// Extracts the target-info blob back out of an incoming NTLMv2 response
/// (everything after the fixed part of the `temp` blob).
pub(crate) fn response_target_info(nt_challenge_response: &[u8]) -> Result<&[u8]> {
    nt_challenge_response
        .get(HASH_SIZE + NT_V2_RESPONSE_BASE_SIZE..)
        .ok_or_else(|| Error::InvalidParameter(String::from("NtChallengeResponse carries no target info")))
}
