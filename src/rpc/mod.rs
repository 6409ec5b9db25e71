pub mod auth;
pub mod client;
pub mod server;
pub mod transport;

pub use auth::AuthContext;
pub use client::{ClientAuth, ClientConfig, RpcClient};
pub use server::{
    AssocGroupHandle, AssocGroupTable, EndpointRegistry, InterfaceDispatch, RegisteredInterface, ServerAuth,
    ServerConnection, MAX_TOTAL_REASSEMBLED_SIZE,
};
pub use transport::{LoopbackTransport, TcpTransport, Transport};
