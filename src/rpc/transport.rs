//! The byte transport underneath a DCERPC connection.
//!
//! The engines never talk to sockets directly: they hand fully framed PDUs
//! to a [Transport] and read back complete fragments. Framing on the read
//! side peeks the common header for `frag_length` and then reads exactly
//! that many bytes, so a slow peer never leaves a half-parsed PDU in the
//! engine.

use std::collections::VecDeque;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use msrpc_pdu::pdu::{frag_len_hint, PDU_HEADER_SIZE};

use crate::rpc::server::ServerConnection;
use crate::{Error, Result};

pub trait Transport {
    /// Ships one serialized PDU.
    fn send(&mut self, pdu: &[u8]) -> Result<()>;

    /// Reads exactly one PDU fragment.
    fn recv_pdu(&mut self) -> Result<Vec<u8>>;

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    fn shutdown(&mut self) -> Result<()>;
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr)?,
        })
    }
}

fn map_read_err(err: std::io::Error) -> Error {
    match err.kind() {
        IoErrorKind::WouldBlock | IoErrorKind::TimedOut => Error::Timeout,
        IoErrorKind::UnexpectedEof | IoErrorKind::ConnectionReset | IoErrorKind::ConnectionAborted => {
            Error::Disconnected
        }
        _ => Error::Io(err),
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, pdu: &[u8]) -> Result<()> {
        self.stream.write_all(pdu)?;
        self.stream.flush()?;

        Ok(())
    }

    fn recv_pdu(&mut self) -> Result<Vec<u8>> {
        let mut pdu = vec![0u8; PDU_HEADER_SIZE];
        self.stream.read_exact(&mut pdu).map_err(map_read_err)?;

        let frag_len = usize::from(
            frag_len_hint(&pdu).ok_or_else(|| Error::Protocol(String::from("short PDU header")))?,
        );
        if frag_len < PDU_HEADER_SIZE {
            return Err(Error::Protocol(format!("announced frag_length {} is impossible", frag_len)));
        }

        pdu.resize(frag_len, 0);
        self.stream.read_exact(&mut pdu[PDU_HEADER_SIZE..]).map_err(map_read_err)?;

        Ok(pdu)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;

        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)?;

        Ok(())
    }
}

/// An in-process transport that feeds every sent PDU straight into a
/// [ServerConnection] and queues the replies for `recv_pdu`. This is how the
/// engine is exercised end-to-end without a socket.
pub struct LoopbackTransport {
    server: ServerConnection,
    inbox: VecDeque<Vec<u8>>,
    /// When set, outbound PDUs are dropped instead of delivered. Lets tests
    /// exercise the timeout paths.
    pub drop_sends: bool,
}

impl LoopbackTransport {
    pub fn new(server: ServerConnection) -> Self {
        Self {
            server,
            inbox: VecDeque::new(),
            drop_sends: false,
        }
    }

    pub fn server(&mut self) -> &mut ServerConnection {
        &mut self.server
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, pdu: &[u8]) -> Result<()> {
        if self.drop_sends {
            return Ok(());
        }

        let replies = self.server.process_pdu(pdu)?;
        self.inbox.extend(replies);

        Ok(())
    }

    fn recv_pdu(&mut self) -> Result<Vec<u8>> {
        // An empty inbox means the peer will never answer; surface that the
        // same way a socket read timeout would.
        self.inbox.pop_front().ok_or(Error::Timeout)
    }

    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
