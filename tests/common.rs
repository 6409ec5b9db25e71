use std::sync::Arc;

use uuid::{uuid, Uuid};

use msrpc::gensec::{AuthIdentity, GensecConfig, GensecRegistry};
use msrpc::pdu::bind::SyntaxId;
use msrpc::rpc::{
    AssocGroupTable, EndpointRegistry, InterfaceDispatch, LoopbackTransport, RegisteredInterface, ServerAuth,
    ServerConnection, Transport,
};
use msrpc::{Error, Result};

pub const ECHO_UUID: Uuid = uuid!("b9785960-524f-11df-8b6d-83dcded72085");

pub const ECHO_INTERFACE: SyntaxId = SyntaxId {
    uuid: ECHO_UUID,
    version: 1,
    version_minor: 0,
};

pub const UNREGISTERED_INTERFACE: SyntaxId = SyntaxId {
    uuid: uuid!("12345678-1234-abcd-ef00-0123456789ab"),
    version: 1,
    version_minor: 0,
};

/// Fault status a test dispatch failure carries.
pub const ECHO_FAULT_STATUS: u32 = 0x1c01_0fff;

/// Opnum 0 echoes the stub, opnum 1 reverses it, opnum 2 always faults.
pub struct EchoInterface;

impl InterfaceDispatch for EchoInterface {
    fn op_count(&self) -> u16 {
        6
    }

    fn call(&self, opnum: u16, stub: &[u8]) -> std::result::Result<Vec<u8>, u32> {
        match opnum {
            0 | 5 => Ok(stub.to_vec()),
            1 => Ok(stub.iter().rev().copied().collect()),
            2 => Err(ECHO_FAULT_STATUS),
            _ => Ok(Vec::new()),
        }
    }
}

/// Routes engine traces into the test output. `MSRPC_LOG_LEVEL` selects the
/// verbosity, e.g. `MSRPC_LOG_LEVEL=msrpc=debug`.
pub fn setup_logger() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_env("MSRPC_LOG_LEVEL"))
        .try_init();
}

pub fn test_registry() -> Arc<EndpointRegistry> {
    let mut registry = EndpointRegistry::new("49668");
    registry.register_interface(RegisteredInterface {
        uuid: ECHO_UUID,
        version: 1,
        version_minor: 0,
        name: "echo",
        dispatch: Arc::new(EchoInterface),
    });

    Arc::new(registry)
}

pub fn test_identity() -> AuthIdentity {
    AuthIdentity::new("testuser", "CONTOSO", "Password1!")
}

pub fn client_gensec_config() -> GensecConfig {
    GensecConfig {
        identity: Some(test_identity()),
        ..Default::default()
    }
}

pub fn server_gensec_config() -> GensecConfig {
    GensecConfig {
        server_identities: vec![test_identity()],
        ..Default::default()
    }
}

pub fn plain_server() -> ServerConnection {
    ServerConnection::new(test_registry(), AssocGroupTable::new())
}

pub fn authenticated_server(registry: Arc<GensecRegistry>) -> ServerConnection {
    ServerConnection::new(test_registry(), AssocGroupTable::new()).with_auth_provider(ServerAuth {
        registry,
        config: server_gensec_config(),
    })
}

/// Counts and optionally corrupts PDUs on their way to the server.
pub struct InstrumentedTransport {
    inner: LoopbackTransport,
    pub sent_requests: usize,
    /// One-based index of the REQUEST PDU whose stub gets one bit flipped.
    pub tamper_request: Option<usize>,
}

impl InstrumentedTransport {
    pub fn new(server: ServerConnection) -> Self {
        Self {
            inner: LoopbackTransport::new(server),
            sent_requests: 0,
            tamper_request: None,
        }
    }
}

const PACKET_TYPE_REQUEST: u8 = 0;

impl Transport for InstrumentedTransport {
    fn send(&mut self, pdu: &[u8]) -> Result<()> {
        if pdu.len() > 2 && pdu[2] == PACKET_TYPE_REQUEST {
            self.sent_requests += 1;

            if self.tamper_request == Some(self.sent_requests) {
                let mut tampered = pdu.to_vec();
                // Flip one bit inside the stub region, after the 16-byte
                // header and the 8-byte request header.
                tampered[16 + 8 + 2] ^= 0x01;

                return self.inner.send(&tampered);
            }
        }

        self.inner.send(pdu)
    }

    fn recv_pdu(&mut self) -> Result<Vec<u8>> {
        self.inner.recv_pdu()
    }

    fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown()
    }
}

/// Asserts the error is a fault with the expected status.
pub fn assert_fault(result: Result<Vec<u8>>, expected: u32) {
    match result {
        Err(Error::Fault { status }) => assert_eq!(status, expected, "unexpected fault status"),
        other => panic!("expected a fault with status {:#010x}, got {:?}", expected, other.map(|reply| reply.len())),
    }
}
