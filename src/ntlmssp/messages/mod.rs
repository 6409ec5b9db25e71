pub(crate) mod av_pair;
pub(crate) mod client;
pub(crate) mod computations;
pub(crate) mod server;

use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Error, Result};

pub(crate) const NTLM_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

pub(crate) const CLIENT_SIGN_MAGIC: &[u8] = b"session key to client-to-server signing key magic constant\0";
pub(crate) const SERVER_SIGN_MAGIC: &[u8] = b"session key to server-to-client signing key magic constant\0";
pub(crate) const CLIENT_SEAL_MAGIC: &[u8] = b"session key to client-to-server sealing key magic constant\0";
pub(crate) const SERVER_SEAL_MAGIC: &[u8] = b"session key to server-to-client sealing key magic constant\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum MessageTypes {
    Negotiate = 1,
    Challenge = 2,
    Authenticate = 3,
}

/// Reads and checks the eight-byte signature plus the message type that
/// prefix every NTLMSSP message.
pub(crate) fn check_signature(mut reader: impl io::Read, expected: MessageTypes) -> Result<()> {
    let mut signature = [0u8; 8];
    reader.read_exact(&mut signature)?;

    if signature != *NTLM_SIGNATURE {
        return Err(Error::InvalidParameter(String::from(
            "NTLMSSP signature is missing or malformed",
        )));
    }

    let message_type = reader.read_u32::<LittleEndian>()?;
    if message_type != expected as u32 {
        return Err(Error::InvalidParameter(format!(
            "unexpected NTLMSSP message type: expected {}, got {}",
            expected as u32, message_type
        )));
    }

    Ok(())
}

/// A `length`/`max-length`/`offset` payload descriptor, the addressing
/// scheme every variable field of an NTLMSSP message uses.
#[derive(Debug, Clone, Default)]
pub(crate) struct MessageFields {
    pub buffer: Vec<u8>,
    pub buffer_offset: u32,
}

impl MessageFields {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_buffer(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            buffer_offset: 0,
        }
    }

    pub(crate) fn write_to(&self, mut buffer: impl io::Write) -> io::Result<()> {
        let len = self.buffer.len() as u16;
        buffer.write_u16::<LittleEndian>(len)?; // Len
        buffer.write_u16::<LittleEndian>(len)?; // MaxLen
        buffer.write_u32::<LittleEndian>(self.buffer_offset)?;

        Ok(())
    }

    pub(crate) fn write_buffer_to(&self, mut buffer: impl io::Write) -> io::Result<()> {
        buffer.write_all(&self.buffer)
    }
}

/// Descriptor as read from the wire, before the payload is extracted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldDescriptor {
    pub length: u16,
    pub offset: u32,
}

impl FieldDescriptor {
    pub(crate) fn read(mut reader: impl io::Read) -> io::Result<Self> {
        let length = reader.read_u16::<LittleEndian>()?;
        let _max_length = reader.read_u16::<LittleEndian>()?;
        let offset = reader.read_u32::<LittleEndian>()?;

        Ok(Self { length, offset })
    }

    pub(crate) fn extract<'a>(&self, message: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        let end = start + usize::from(self.length);

        message.get(start..end).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "NTLMSSP payload field [{}..{}] lies outside the {}-byte message",
                start,
                end,
                message.len()
            ))
        })
    }
}
