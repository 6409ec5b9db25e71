use thiserror::Error;

/// Numeric DCERPC fault statuses surfaced to callers alongside
/// [Error::Fault].
pub use msrpc_pdu::pdu::fault_status;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pdu(#[from] msrpc_pdu::Error),

    #[error(transparent)]
    Asn1(#[from] picky_asn1_der::Asn1DerError),

    #[error(transparent)]
    IntConversion(#[from] std::num::TryFromIntError),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unexpected message in the current state: {0}")]
    OutOfSequence(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("logon failure for {0}")]
    LogonFailure(String),

    #[error("no security mechanism registered for {0}")]
    NoSuchMechanism(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("the connection was disconnected")]
    Disconnected,

    #[error("the request timed out")]
    Timeout,

    #[error("RPC fault 0x{status:08x}")]
    Fault { status: u32 },

    #[error("bind rejected by the server: reason {reason}")]
    BindRejected { reason: u16 },

    #[error("presentation context rejected: result {result}, reason {reason}")]
    ContextRejected { result: u16, reason: u16 },
}

impl Error {
    /// The numeric DCERPC fault status a server puts on the wire when this
    /// error aborts request processing.
    pub fn fault_status(&self) -> u32 {
        match self {
            Error::AccessDenied(_) | Error::LogonFailure(_) => fault_status::ACCESS_DENIED,
            Error::Fault { status } => *status,
            _ => fault_status::NCA_S_PROTO_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
