#![doc = include_str!("../README.md")]

#[macro_use]
extern crate tracing;

pub mod gensec;
pub mod ntlmssp;
pub mod rpc;
pub mod spnego;

pub(crate) mod crypto;
pub(crate) mod utils;

mod error;

pub use error::{fault_status, Error, Result};
pub use msrpc_pdu as pdu;
