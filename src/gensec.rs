//! Generic security facade: one capability table over the supported
//! authentication mechanisms so the connection engines never special-case
//! NTLMSSP, SPNEGO, Kerberos, or Schannel.
//!
//! The registry is an explicit object constructed at startup and passed by
//! reference into the engines; nothing in here is a process-wide static.

use std::fmt::Debug;
use std::sync::Arc;

use oid::ObjectIdentifier;

pub use msrpc_pdu::pdu::{AuthenticationLevel, SecurityProvider};

use crate::{Error, Result};

/// Plain-text credential triple used by NTLMSSP (and any mechanism that
/// authenticates with a shared secret).
#[derive(Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    pub username: String,
    pub domain: String,
    pub password: String,
}

impl AuthIdentity {
    pub fn new(username: impl Into<String>, domain: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            password: password.into(),
        }
    }
}

impl Debug for AuthIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthIdentity")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("password", &"********")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Outcome of one token-exchange step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechUpdate {
    /// The exchange continues; send this token to the peer.
    MoreProcessing(Vec<u8>),
    /// The exchange finished on this side. A non-empty token still has to be
    /// delivered to the peer (e.g. the NTLMSSP AUTHENTICATE message).
    Done(Vec<u8>),
}

impl MechUpdate {
    pub fn token(&self) -> &[u8] {
        match self {
            MechUpdate::MoreProcessing(token) | MechUpdate::Done(token) => token,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, MechUpdate::Done(_))
    }
}

/// One authentication mechanism instance bound to a single connection.
///
/// Buffer convention for the packet operations: `header` and `trailer` are
/// the parts of the PDU that participate in the checksum but are never
/// encrypted (the common header plus body header, and the security trailer
/// header); `data` is the stub plus auth padding, encrypted in place at the
/// privacy level. Implementations keep a strictly increasing sequence number
/// per direction, so sign/seal must be called exactly once per packet, in
/// wire order.
pub trait Mechanism: Debug + Send {
    fn auth_type(&self) -> SecurityProvider;

    fn oid(&self) -> ObjectIdentifier;

    /// Probes whether a raw (non-negotiated) token belongs to this
    /// mechanism. Used by SPNEGO's fallback path.
    fn magic(&self, token: &[u8]) -> bool;

    /// Performs one step of the token exchange.
    fn update(&mut self, input: &[u8]) -> Result<MechUpdate>;

    fn is_established(&self) -> bool;

    fn session_key(&self) -> Result<Vec<u8>>;

    /// Size of the per-packet signature this mechanism appends as the
    /// trailer's `auth_value`.
    fn signature_size(&self) -> usize;

    /// Whether the mechanism can sign arbitrary data once established
    /// ("new SPNEGO": required for mechListMIC).
    fn supports_integrity(&self) -> bool;

    /// Signs `header || data || trailer` and returns the signature.
    fn sign(&mut self, header: &[u8], data: &[u8], trailer: &[u8]) -> Result<Vec<u8>>;

    /// Verifies a signature produced by the peer's [Mechanism::sign].
    fn verify(&mut self, header: &[u8], data: &[u8], trailer: &[u8], signature: &[u8]) -> Result<()>;

    /// Signs like [Mechanism::sign] and encrypts `data` in place.
    fn seal(&mut self, header: &[u8], data: &mut [u8], trailer: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts `data` in place and verifies the signature.
    fn unseal(&mut self, header: &[u8], data: &mut [u8], trailer: &[u8], signature: &[u8]) -> Result<()>;

    /// Convenience framing for callers outside the PDU path:
    /// `signature || sealed data`.
    fn wrap(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        let signature = self.seal(&[], &mut buf, &[])?;

        let mut out = signature;
        out.extend_from_slice(&buf);

        Ok(out)
    }

    fn unwrap(&mut self, blob: &[u8]) -> Result<Vec<u8>> {
        let signature_size = self.signature_size();
        if blob.len() < signature_size {
            return Err(Error::InvalidParameter(format!(
                "wrapped blob is shorter than a signature: {} < {}",
                blob.len(),
                signature_size
            )));
        }

        let (signature, sealed) = blob.split_at(signature_size);
        let mut data = sealed.to_vec();
        self.unseal(&[], &mut data, &[], signature)?;

        Ok(data)
    }

    /// Produces a detached MIC over `data`, outside the packet sequence
    /// (used for the SPNEGO mechListMIC). Returns `None` when the mechanism
    /// has no integrity primitive.
    fn generate_mic(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Verifies a peer MIC produced by [Mechanism::generate_mic].
    fn verify_mic(&mut self, data: &[u8], mic: &[u8]) -> Result<()>;
}

/// Everything a mechanism factory may need to start a context.
#[derive(Debug, Clone, Default)]
pub struct GensecConfig {
    /// Client-side credentials.
    pub identity: Option<AuthIdentity>,
    /// Server-side credential table used to resolve the authenticating user.
    pub server_identities: Vec<AuthIdentity>,
    /// Target service name the client authenticates to (e.g. `host/name`).
    pub target_name: Option<String>,
    pub ntlm: crate::ntlmssp::NtlmConfig,
    pub spnego: crate::spnego::SpnegoConfig,
}

type MechFactory = dyn Fn(&GensecRegistry, Role, &GensecConfig) -> Result<Box<dyn Mechanism>> + Send + Sync;

/// One row of the capability table.
pub struct MechanismEntry {
    pub auth_type: SecurityProvider,
    pub oid: ObjectIdentifier,
    /// Whether SPNEGO may offer this mechanism in its mechTypes list.
    /// SPNEGO itself is registered with `negotiable: false`.
    pub negotiable: bool,
    pub factory: Box<MechFactory>,
}

impl Debug for MechanismEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MechanismEntry")
            .field("auth_type", &self.auth_type)
            .field("negotiable", &self.negotiable)
            .finish_non_exhaustive()
    }
}

/// The process-wide mechanism table. Construct once, share via [Arc].
#[derive(Debug, Default)]
pub struct GensecRegistry {
    entries: Vec<MechanismEntry>,
}

impl GensecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in mechanisms: NTLMSSP and SPNEGO wrapping
    /// every negotiable entry. Kerberos/Schannel providers are registered by
    /// collaborators through [GensecRegistry::register_mechanism].
    pub fn with_default_mechanisms() -> Arc<Self> {
        let mut registry = Self::new();

        registry.register_mechanism(MechanismEntry {
            auth_type: SecurityProvider::Winnt,
            oid: picky::oids::ntlm_ssp(),
            negotiable: true,
            factory: Box::new(|_, role, config| {
                Ok(Box::new(crate::ntlmssp::Ntlmssp::new(role, config)?) as Box<dyn Mechanism>)
            }),
        });

        registry.register_mechanism(MechanismEntry {
            auth_type: SecurityProvider::GssNegotiate,
            oid: picky::oids::spnego(),
            negotiable: false,
            factory: Box::new(|registry, role, config| {
                let candidates = registry.start_negotiable(role, config)?;

                Ok(Box::new(crate::spnego::Spnego::new(role, candidates, config.spnego.clone())?) as Box<dyn Mechanism>)
            }),
        });

        Arc::new(registry)
    }

    pub fn register_mechanism(&mut self, entry: MechanismEntry) {
        self.entries.push(entry);
    }

    fn entry(&self, auth_type: SecurityProvider) -> Result<&MechanismEntry> {
        self.entries
            .iter()
            .find(|entry| entry.auth_type == auth_type)
            .ok_or_else(|| Error::NoSuchMechanism(format!("{:?}", auth_type)))
    }

    /// Starts one mechanism context through the capability table.
    pub fn start(&self, auth_type: SecurityProvider, role: Role, config: &GensecConfig) -> Result<Box<dyn Mechanism>> {
        let entry = self.entry(auth_type)?;

        (entry.factory)(self, role, config)
    }

    /// Instantiates every negotiable mechanism, in registration (priority)
    /// order. This is the candidate list SPNEGO negotiates over.
    fn start_negotiable(&self, role: Role, config: &GensecConfig) -> Result<Vec<Box<dyn Mechanism>>> {
        let candidates = self
            .entries
            .iter()
            .filter(|entry| entry.negotiable)
            .map(|entry| (entry.factory)(self, role, config))
            .collect::<Result<Vec<_>>>()?;

        if candidates.is_empty() {
            return Err(Error::NoSuchMechanism(String::from(
                "no negotiable mechanisms registered for SPNEGO",
            )));
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_auth_type_is_reported() {
        let registry = GensecRegistry::with_default_mechanisms();

        let err = registry
            .start(SecurityProvider::GssSchannel, Role::Client, &GensecConfig::default())
            .unwrap_err();

        assert!(matches!(err, Error::NoSuchMechanism(_)));
    }

    #[test]
    fn default_registry_starts_ntlmssp() {
        let registry = GensecRegistry::with_default_mechanisms();
        let config = GensecConfig {
            identity: Some(AuthIdentity::new("user", "WORKGROUP", "secret")),
            ..Default::default()
        };

        let mech = registry.start(SecurityProvider::Winnt, Role::Client, &config).unwrap();
        assert_eq!(mech.auth_type(), SecurityProvider::Winnt);
        assert!(!mech.is_established());
    }
}
