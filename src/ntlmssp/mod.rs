//! NTLMSSP authentication mechanism: the NEGOTIATE → CHALLENGE →
//! AUTHENTICATE token exchange (NTLMv2 only) and the derived RC4/HMAC-MD5
//! packet protection used for DCERPC integrity and privacy levels.
//!
//! # MSDN
//!
//! * [[MS-NLMP]: NT LAN Manager (NTLM) Authentication Protocol](https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-nlmp/b38c36ed-2804-4868-a9ff-8dd3182128e4)

mod config;
mod messages;

use bitflags::bitflags;
use oid::ObjectIdentifier;

pub use config::NtlmConfig;

use crate::crypto::{compute_hmac_md5, Rc4, HASH_SIZE};
use crate::gensec::{AuthIdentity, GensecConfig, MechUpdate, Mechanism, Role, SecurityProvider};
use crate::{Error, Result};

pub const PKG_NAME: &str = "NTLM";
pub const NTLM_VERSION_SIZE: usize = 8;
pub const DEFAULT_NTLM_VERSION: [u8; NTLM_VERSION_SIZE] = [0x0a, 0x00, 0x63, 0x45, 0x00, 0x00, 0x00, 0x0f];

pub const ENCRYPTED_RANDOM_SESSION_KEY_SIZE: usize = 16;
pub const SIGNATURE_SIZE: usize = SIGNATURE_VERSION_SIZE + SIGNATURE_CHECKSUM_SIZE + SIGNATURE_SEQ_NUM_SIZE;

const CHALLENGE_SIZE: usize = 8;
const SESSION_KEY_SIZE: usize = 16;
const MESSAGE_INTEGRITY_CHECK_SIZE: usize = 16;
const LM_CHALLENGE_RESPONSE_SIZE: usize = HASH_SIZE + CHALLENGE_SIZE;
/// Byte offset of the MIC inside an AUTHENTICATE message.
const MIC_OFFSET: usize = 72;

const SIGNATURE_VERSION_SIZE: usize = 4;
const SIGNATURE_SEQ_NUM_SIZE: usize = 4;
const SIGNATURE_CHECKSUM_SIZE: usize = 8;
const MESSAGES_VERSION: u32 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum NtlmState {
    Initial,
    Challenge,
    Authenticate,
    Final,
}

/// One NTLMSSP context, playing either the client or the server role of the
/// three-message handshake.
#[derive(Debug)]
pub struct Ntlmssp {
    config: NtlmConfig,
    role: Role,
    state: NtlmState,
    flags: NegotiateFlags,
    version: [u8; NTLM_VERSION_SIZE],

    identity: Option<AuthIdentity>,
    server_identities: Vec<AuthIdentity>,

    negotiate_message: Option<Vec<u8>>,
    challenge_message: Option<Vec<u8>>,
    server_challenge: [u8; CHALLENGE_SIZE],
    challenge_target_info: Vec<u8>,
    challenge_timestamp: u64,

    session_key: Option<[u8; SESSION_KEY_SIZE]>,

    send_signing_key: [u8; HASH_SIZE],
    recv_signing_key: [u8; HASH_SIZE],
    send_sealing_key: Option<Rc4>,
    recv_sealing_key: Option<Rc4>,

    // Client contexts count client-to-server packets in our_seq_number;
    // server contexts count server-to-client packets there.
    our_seq_number: u32,
    remote_seq_number: u32,
}

impl Ntlmssp {
    pub fn new(role: Role, config: &GensecConfig) -> Result<Self> {
        if role == Role::Client && config.identity.is_none() {
            return Err(Error::InvalidParameter(String::from(
                "an NTLMSSP client must be given credentials",
            )));
        }

        Ok(Self {
            config: config.ntlm.clone(),
            role,
            state: NtlmState::Initial,
            flags: NegotiateFlags::empty(),
            version: DEFAULT_NTLM_VERSION,

            identity: config.identity.clone(),
            server_identities: config.server_identities.clone(),

            negotiate_message: None,
            challenge_message: None,
            server_challenge: [0u8; CHALLENGE_SIZE],
            challenge_target_info: Vec::new(),
            challenge_timestamp: 0,

            session_key: None,

            send_signing_key: [0u8; HASH_SIZE],
            recv_signing_key: [0u8; HASH_SIZE],
            send_sealing_key: None,
            recv_sealing_key: None,

            our_seq_number: 0,
            remote_seq_number: 0,
        })
    }

    /// The identity that authenticated on this context (server side: the
    /// entry resolved from the credential table).
    pub fn authenticated_identity(&self) -> Option<&AuthIdentity> {
        self.identity.as_ref()
    }

    fn sealing_key_material<'a>(&self, session_key: &'a [u8]) -> Result<&'a [u8]> {
        if self.flags.contains(NegotiateFlags::NTLM_SSP_NEGOTIATE128) {
            Ok(session_key)
        } else if !self.config.compat_weak_keys {
            Err(Error::InvalidParameter(String::from(
                "the peer negotiated a weakened session key, which is disabled",
            )))
        } else if self.flags.contains(NegotiateFlags::NTLM_SSP_NEGOTIATE56) {
            Ok(&session_key[..7])
        } else {
            Ok(&session_key[..5])
        }
    }

    /// (Re-)derives the transport keys from the session key and rewinds the
    /// sequence numbers. Called when the handshake completes and again after
    /// a detached MIC exchange, so that packet protection starts fresh.
    fn reset_cipher_state(&mut self) -> Result<()> {
        use crate::ntlmssp::messages::computations::generate_signing_key;
        use crate::ntlmssp::messages::{CLIENT_SEAL_MAGIC, CLIENT_SIGN_MAGIC, SERVER_SEAL_MAGIC, SERVER_SIGN_MAGIC};

        let session_key = self.session_key.ok_or_else(|| {
            Error::OutOfSequence(String::from(
                "the session key is not established, cannot derive transport keys",
            ))
        })?;
        let seal_material = self.sealing_key_material(&session_key)?.to_vec();

        match self.role {
            Role::Client => {
                self.send_signing_key = generate_signing_key(&session_key, CLIENT_SIGN_MAGIC);
                self.recv_signing_key = generate_signing_key(&session_key, SERVER_SIGN_MAGIC);
                self.send_sealing_key = Some(Rc4::new(&generate_signing_key(&seal_material, CLIENT_SEAL_MAGIC)));
                self.recv_sealing_key = Some(Rc4::new(&generate_signing_key(&seal_material, SERVER_SEAL_MAGIC)));
            }
            Role::Server => {
                self.send_signing_key = generate_signing_key(&session_key, SERVER_SIGN_MAGIC);
                self.recv_signing_key = generate_signing_key(&session_key, CLIENT_SIGN_MAGIC);
                self.send_sealing_key = Some(Rc4::new(&generate_signing_key(&seal_material, SERVER_SEAL_MAGIC)));
                self.recv_sealing_key = Some(Rc4::new(&generate_signing_key(&seal_material, CLIENT_SEAL_MAGIC)));
            }
        }

        self.our_seq_number = 0;
        self.remote_seq_number = 0;

        Ok(())
    }

    fn ensure_transport_keys(&mut self) -> Result<()> {
        if self.send_sealing_key.is_none() {
            self.reset_cipher_state()?;
        }

        Ok(())
    }

    fn our_seq_num(&mut self) -> u32 {
        let seq_num = self.our_seq_number;
        self.our_seq_number = self.our_seq_number.wrapping_add(1);

        seq_num
    }

    fn remote_seq_num(&mut self) -> u32 {
        let seq_num = self.remote_seq_number;
        self.remote_seq_number = self.remote_seq_number.wrapping_add(1);

        seq_num
    }

    fn send_checksum(&mut self, digest: &[u8; HASH_SIZE]) -> Result<Vec<u8>> {
        let rc4 = self
            .send_sealing_key
            .as_mut()
            .ok_or_else(|| Error::OutOfSequence(String::from("transport keys are not derived")))?;

        Ok(rc4.process(&digest[0..SIGNATURE_CHECKSUM_SIZE]))
    }

    fn recv_checksum(&mut self, digest: &[u8; HASH_SIZE]) -> Result<Vec<u8>> {
        let rc4 = self
            .recv_sealing_key
            .as_mut()
            .ok_or_else(|| Error::OutOfSequence(String::from("transport keys are not derived")))?;

        Ok(rc4.process(&digest[0..SIGNATURE_CHECKSUM_SIZE]))
    }
}

impl Mechanism for Ntlmssp {
    fn auth_type(&self) -> SecurityProvider {
        SecurityProvider::Winnt
    }

    fn oid(&self) -> ObjectIdentifier {
        picky::oids::ntlm_ssp()
    }

    fn magic(&self, token: &[u8]) -> bool {
        token.len() >= messages::NTLM_SIGNATURE.len() && token[..8] == *messages::NTLM_SIGNATURE
    }

    #[instrument(level = "debug", fields(role = ?self.role, state = ?self.state), skip_all)]
    fn update(&mut self, input: &[u8]) -> Result<MechUpdate> {
        match (self.role, self.state) {
            (Role::Client, NtlmState::Initial) => {
                let token = messages::client::write_negotiate(self)?;
                self.state = NtlmState::Challenge;

                Ok(MechUpdate::MoreProcessing(token))
            }
            (Role::Client, NtlmState::Challenge) => {
                messages::client::read_challenge(self, input)?;
                let token = messages::client::write_authenticate(self)?;
                self.state = NtlmState::Final;

                Ok(MechUpdate::Done(token))
            }
            (Role::Server, NtlmState::Initial) => {
                messages::server::read_negotiate(self, input)?;
                let token = messages::server::write_challenge(self)?;
                self.state = NtlmState::Authenticate;

                Ok(MechUpdate::MoreProcessing(token))
            }
            (Role::Server, NtlmState::Authenticate) => {
                messages::server::read_authenticate(self, input)?;
                self.state = NtlmState::Final;

                Ok(MechUpdate::Done(Vec::new()))
            }
            (role, state) => Err(Error::OutOfSequence(format!(
                "got an NTLMSSP token as {:?} in state {:?}",
                role, state
            ))),
        }
    }

    fn is_established(&self) -> bool {
        self.state == NtlmState::Final && self.session_key.is_some()
    }

    fn session_key(&self) -> Result<Vec<u8>> {
        self.session_key
            .map(|key| key.to_vec())
            .ok_or_else(|| Error::OutOfSequence(String::from("the session key is not established")))
    }

    fn signature_size(&self) -> usize {
        SIGNATURE_SIZE
    }

    fn supports_integrity(&self) -> bool {
        true
    }

    fn sign(&mut self, header: &[u8], data: &[u8], trailer: &[u8]) -> Result<Vec<u8>> {
        self.ensure_transport_keys()?;

        let sequence_number = self.our_seq_num();
        let digest = compute_digest(&self.send_signing_key, sequence_number, &[header, data, trailer])?;
        let checksum = self.send_checksum(&digest)?;

        Ok(compute_signature(&checksum, sequence_number).to_vec())
    }

    fn verify(&mut self, header: &[u8], data: &[u8], trailer: &[u8], signature: &[u8]) -> Result<()> {
        self.ensure_transport_keys()?;

        let sequence_number = self.remote_seq_num();
        let digest = compute_digest(&self.recv_signing_key, sequence_number, &[header, data, trailer])?;
        let checksum = self.recv_checksum(&digest)?;

        if signature != compute_signature(&checksum, sequence_number) {
            return Err(Error::AccessDenied(String::from("packet signature verification failed")));
        }

        Ok(())
    }

    fn seal(&mut self, header: &[u8], data: &mut [u8], trailer: &[u8]) -> Result<Vec<u8>> {
        self.ensure_transport_keys()?;

        let sequence_number = self.our_seq_num();
        let digest = compute_digest(&self.send_signing_key, sequence_number, &[header, &*data, trailer])?;

        let rc4 = self
            .send_sealing_key
            .as_mut()
            .ok_or_else(|| Error::OutOfSequence(String::from("transport keys are not derived")))?;
        let encrypted = rc4.process(data);
        data.copy_from_slice(&encrypted);

        let checksum = self.send_checksum(&digest)?;

        Ok(compute_signature(&checksum, sequence_number).to_vec())
    }

    fn unseal(&mut self, header: &[u8], data: &mut [u8], trailer: &[u8], signature: &[u8]) -> Result<()> {
        self.ensure_transport_keys()?;

        let sequence_number = self.remote_seq_num();

        let rc4 = self
            .recv_sealing_key
            .as_mut()
            .ok_or_else(|| Error::OutOfSequence(String::from("transport keys are not derived")))?;
        let decrypted = rc4.process(data);
        data.copy_from_slice(&decrypted);

        let digest = compute_digest(&self.recv_signing_key, sequence_number, &[header, &*data, trailer])?;
        let checksum = self.recv_checksum(&digest)?;

        if signature != compute_signature(&checksum, sequence_number) {
            return Err(Error::AccessDenied(String::from("packet signature verification failed")));
        }

        Ok(())
    }

    fn generate_mic(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_transport_keys()?;

        let sequence_number = self.our_seq_num();
        let digest = compute_digest(&self.send_signing_key, sequence_number, &[data])?;
        let checksum = self.send_checksum(&digest)?;
        let mic = compute_signature(&checksum, sequence_number).to_vec();

        // The MIC exchange must not advance the packet keystream.
        self.reset_cipher_state()?;

        Ok(Some(mic))
    }

    fn verify_mic(&mut self, data: &[u8], mic: &[u8]) -> Result<()> {
        self.ensure_transport_keys()?;

        let sequence_number = self.remote_seq_num();
        let digest = compute_digest(&self.recv_signing_key, sequence_number, &[data])?;
        let checksum = self.recv_checksum(&digest)?;

        let matches = mic == compute_signature(&checksum, sequence_number);

        self.reset_cipher_state()?;

        if !matches {
            return Err(Error::AccessDenied(String::from("MIC verification failed")));
        }

        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    struct NegotiateFlags: u32 {
        /// W-bit: requests 56-bit encryption
        const NTLM_SSP_NEGOTIATE56 = 0x8000_0000;

        /// V-bit: requests explicit key exchange
        const NTLM_SSP_NEGOTIATE_KEY_EXCH = 0x4000_0000;

        /// U-bit: requests an 128 bit session key
        const NTLM_SSP_NEGOTIATE128 = 0x2000_0000;

        const NTLM_SSP_NEGOTIATE_RESERVED1 = 0x1000_0000;
        const NTLM_SSP_NEGOTIATE_RESERVED2 = 0x0800_0000;
        const NTLM_SSP_NEGOTIATE_RESERVED3 = 0x0400_0000;

        const NTLM_SSP_NEGOTIATE_VERSION = 0x0200_0000;

        const NTLM_SSP_NEGOTIATE_RESERVED4 = 0x0100_0000;

        /// S-bit
        const NTLM_SSP_NEGOTIATE_TARGET_INFO = 0x0080_0000;

        const NTLM_SSP_NEGOTIATE_REQUEST_NON_NT_SESSION_KEY = 0x0040_0000;

        const NTLM_SSP_NEGOTIATE_RESERVED5 = 0x0020_0000;

        const NTLM_SSP_NEGOTIATE_IDENTIFY = 0x0010_0000;

        /// P-bit: NTLMv2 session security
        const NTLM_SSP_NEGOTIATE_EXTENDED_SESSION_SECURITY = 0x0008_0000;

        const NTLM_SSP_NEGOTIATE_RESERVED6 = 0x0004_0000;

        const NTLM_SSP_NEGOTIATE_TARGET_TYPE_SERVER = 0x0002_0000;
        const NTLM_SSP_NEGOTIATE_TARGET_TYPE_DOMAIN = 0x0001_0000;

        /// M-bit: requests a signature block
        const NTLM_SSP_NEGOTIATE_ALWAYS_SIGN = 0x0000_8000;

        const NTLM_SSP_NEGOTIATE_RESERVED7 = 0x0000_4000;

        const NTLM_SSP_NEGOTIATE_WORKSTATION_SUPPLIED = 0x0000_2000;
        const NTLM_SSP_NEGOTIATE_DOMAIN_SUPPLIED = 0x0000_1000;

        const NTLM_SSP_NEGOTIATE_ANONYMOUS = 0x0000_0800;

        const NTLM_SSP_NEGOTIATE_RESERVED8 = 0x0000_0400;

        /// H-bit: NTLMv1 session security, deprecated and not supported by us
        const NTLM_SSP_NEGOTIATE_NTLM = 0x0000_0200;

        const NTLM_SSP_NEGOTIATE_RESERVED9 = 0x0000_0100;

        /// G-bit: LM session security, deprecated and not supported by us
        const NTLM_SSP_NEGOTIATE_LM_KEY = 0x0000_0080;

        const NTLM_SSP_NEGOTIATE_DATAGRAM = 0x0000_0040;

        /// E-bit: session key negotiation with message confidentiality
        const NTLM_SSP_NEGOTIATE_SEAL = 0x0000_0020;

        /// D-bit
        const NTLM_SSP_NEGOTIATE_SIGN = 0x0000_0010;

        const NTLM_SSP_NEGOTIATE_SIGN_RESERVED10 = 0x0000_0008;

        /// C-bit
        const NTLM_SSP_NEGOTIATE_REQUEST_TARGET = 0x0000_0004;

        /// B-bit
        const NTLM_SSP_NEGOTIATE_OEM = 0x0000_0002;

        /// A-bit
        const NTLM_SSP_NEGOTIATE_UNICODE = 0x0000_0001;
    }
}

fn compute_digest(key: &[u8], seq_num: u32, parts: &[&[u8]]) -> Result<[u8; HASH_SIZE]> {
    let mut digest_data = Vec::with_capacity(
        SIGNATURE_SEQ_NUM_SIZE + parts.iter().map(|part| part.len()).sum::<usize>(),
    );
    digest_data.extend_from_slice(&seq_num.to_le_bytes());
    for part in parts {
        digest_data.extend_from_slice(part);
    }

    Ok(compute_hmac_md5(key, &digest_data)?)
}

fn compute_signature(checksum: &[u8], seq_num: u32) -> [u8; SIGNATURE_SIZE] {
    let mut signature = [0x00; SIGNATURE_SIZE];
    signature[..SIGNATURE_VERSION_SIZE].clone_from_slice(&MESSAGES_VERSION.to_le_bytes());
    signature[SIGNATURE_VERSION_SIZE..SIGNATURE_VERSION_SIZE + SIGNATURE_CHECKSUM_SIZE].clone_from_slice(checksum);
    signature[SIGNATURE_VERSION_SIZE + SIGNATURE_CHECKSUM_SIZE..].clone_from_slice(&seq_num.to_le_bytes());

    signature
}
