//! Wire codec for the connection-oriented DCE/RPC protocol (C706 + MS-RPCE
//! extensions): the 16-byte common header, the bind family, request/response
//! PDUs, faults, and the security trailer appended to authenticated PDUs.
//!
//! The codec is endianness-aware only to the extent the engine needs it:
//! everything is emitted little-endian (`drep[0] & 1 == 1`), and inbound
//! big-endian data representations are rejected during header validation.

#[macro_use]
mod macros;

pub mod bind;
pub mod pdu;
pub mod request;

mod error;

pub use error::{Error, Result};

use std::io::{ErrorKind as IoErrorKind, Read, Write};

use uuid::Uuid;

pub trait Encode {
    fn encode(&self, writer: impl Write) -> Result<()>;
}

pub trait EncodeExt: Encode {
    fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();

        self.encode(&mut buf)?;

        Ok(buf)
    }
}

impl<T: Encode> EncodeExt for T {}

pub trait Decode: Sized {
    fn decode(reader: impl Read) -> Result<Self>;
}

impl Encode for Uuid {
    fn encode(&self, writer: impl Write) -> Result<()> {
        write_buf(&self.to_bytes_le(), writer)?;

        Ok(())
    }
}

impl Decode for Uuid {
    fn decode(reader: impl Read) -> Result<Self> {
        let mut uuid_buf = [0; 16];
        read_buf(reader, &mut uuid_buf)?;

        Ok(Uuid::from_slice_le(&uuid_buf)?)
    }
}

pub fn write_padding<const ALIGNMENT: usize>(buf_len: usize, writer: impl Write) -> Result<usize> {
    let padding_len = (ALIGNMENT - (buf_len % ALIGNMENT)) % ALIGNMENT;
    let padding_buf = vec![0; padding_len];

    write_buf(&padding_buf, writer)?;

    Ok(padding_len)
}

pub fn read_padding<const ALIGNMENT: usize>(buf_len: usize, reader: impl Read) -> Result<()> {
    let padding_len = (ALIGNMENT - (buf_len % ALIGNMENT)) % ALIGNMENT;
    let mut padding_buf = vec![0; padding_len];

    read_buf(reader, &mut padding_buf)?;

    Ok(())
}

pub fn read_to_end(mut reader: impl Read) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;

    Ok(buf)
}

pub fn write_buf(mut data: &[u8], mut writer: impl Write) -> Result<()> {
    while !data.is_empty() {
        let bytes_written = writer.write(data)?;
        data = &data[bytes_written..];

        if bytes_written == 0 {
            return Err(Error::Io(IoErrorKind::WriteZero.into()));
        }
    }

    Ok(())
}

pub fn read_buf(mut reader: impl Read, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        let bytes_read = reader.read(buf)?;
        buf = &mut buf[bytes_read..];

        if bytes_read == 0 {
            return Err(Error::Io(IoErrorKind::UnexpectedEof.into()));
        }
    }

    Ok(())
}

pub fn read_vec(len: usize, reader: impl Read) -> Result<Vec<u8>> {
    let mut buf = vec![0; len];

    read_buf(reader, &mut buf)?;

    Ok(buf)
}
