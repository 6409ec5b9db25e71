use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::bind::{AlterContext, AlterContextResponse, Auth3, Bind, BindAck, BindNak};
use crate::request::{Request, Response};
use crate::{read_to_end, read_vec, write_buf, Decode, Encode, Error, Result};

/// Protocol version carried in every common header.
pub const RPC_VERSION_MAJOR: u8 = 5;
pub const RPC_VERSION_MINOR: u8 = 0;

/// Size of the serialized common header.
pub const PDU_HEADER_SIZE: usize = 16;

/// Byte offsets of the patchable length fields inside a serialized PDU.
const FRAG_LEN_OFFSET: usize = 8;
const AUTH_LEN_OFFSET: usize = 10;

/// Connection-oriented fault/reject status codes (C706 appendix E and
/// MS-RPCE 2.2.1.5) surfaced by the engines.
pub mod fault_status {
    /// Operation number out of range for the bound interface.
    pub const NCA_S_OP_RNG_ERROR: u32 = 0x1c01_0002;
    /// Presentation context id does not identify a bound interface.
    pub const NCA_S_UNKNOWN_IF: u32 = 0x1c01_0003;
    /// Protocol-level violation; the connection is no longer usable.
    pub const NCA_S_PROTO_ERROR: u32 = 0x1c01_000b;
    /// Server ran out of memory while processing the call.
    pub const NCA_S_FAULT_REMOTE_NO_MEMORY: u32 = 0x1c01_0014;
    /// Presentation context mismatch on alter-context.
    pub const NCA_S_FAULT_CONTEXT_MISMATCH: u32 = 0x1c00_001a;
    /// Authentication trailer missing, malformed, or failed verification.
    pub const ACCESS_DENIED: u32 = 0x0000_0005;
    /// Stub data could not be marshalled/unmarshalled.
    pub const NDR_ERROR: u32 = 0x0000_06f7;
}

/// `BIND_NAK` provider-reject reasons (C706 12.6.3.1 / MS-RPCE 2.2.2.5).
pub mod nak_reason {
    pub const REASON_NOT_SPECIFIED: u16 = 0;
    pub const TEMPORARY_CONGESTION: u16 = 1;
    pub const LOCAL_LIMIT_EXCEEDED: u16 = 2;
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: u16 = 4;
    pub const AUTH_TYPE_NOT_RECOGNIZED: u16 = 8;
    pub const INVALID_CHECKSUM: u16 = 9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
#[repr(u8)]
pub enum IntegerRepresentation {
    BigEndian = 0,
    #[default]
    LittleEndian = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
#[repr(u8)]
pub enum CharacterRepresentation {
    #[default]
    Ascii = 0,
    Ebcdic = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
#[repr(u8)]
pub enum FloatingPointRepresentation {
    #[default]
    Ieee = 0,
    Vax = 1,
    Cray = 2,
    Ibm = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Ping = 1,
    Response = 2,
    Fault = 3,
    Working = 4,
    Nocall = 5,
    Reject = 6,
    Ack = 7,
    ClCancel = 8,
    Fack = 9,
    CancelAck = 10,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResponse = 15,
    Auth3 = 16,
    Shutdown = 17,
    CoCancel = 18,
    Orphaned = 19,
}

impl PacketType {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Connectionless-only packet types are a protocol error on a
    /// connection-oriented transport.
    pub fn is_connectionless(&self) -> bool {
        matches!(
            self,
            PacketType::Ping
                | PacketType::Working
                | PacketType::Nocall
                | PacketType::Reject
                | PacketType::Ack
                | PacketType::ClCancel
                | PacketType::Fack
                | PacketType::CancelAck
        )
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const None = 0x00;
        const PfcFirstFrag = 0x01;
        const PfcLastFrag = 0x02;
        // PfcPendingCancel = 0x04,
        const PfcSupportHeaderSign = 0x04; // MS-RPCE extension used in Bind/AlterContext
        const PfcReserved1 = 0x08;
        const PfcConcMpx = 0x10;
        const PfcDidNotExecute = 0x20;
        const PfcMaybe = 0x40;
        const PfcObjectUuid = 0x80;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataRepresentation {
    pub byte_order: IntegerRepresentation,
    pub character: CharacterRepresentation,
    pub floating_point: FloatingPointRepresentation,
}

impl Encode for DataRepresentation {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        let first_octet = (self.byte_order as u8) << 4 | self.character as u8;
        writer.write_u8(first_octet)?;
        writer.write_u8(self.floating_point as u8)?;

        // Padding
        writer.write_u16::<LittleEndian>(0)?;

        Ok(())
    }
}

impl Decode for DataRepresentation {
    fn decode(mut reader: impl Read) -> Result<Self> {
        let first_octet = reader.read_u8()?;

        let integer_representation = (first_octet & 0b11110000) >> 4;
        let character_representation = first_octet & 0b00001111;
        let floating_representation = reader.read_u8()?;

        let data_representation = Self {
            byte_order: IntegerRepresentation::from_u8(integer_representation)
                .ok_or(Error::InvalidIntRepr(integer_representation))?,
            character: CharacterRepresentation::from_u8(character_representation)
                .ok_or(Error::InvalidCharacterRepr(character_representation))?,
            floating_point: FloatingPointRepresentation::from_u8(floating_representation)
                .ok_or(Error::InvalidFloatingPointRepr(floating_representation))?,
        };

        // Padding.
        reader.read_u16::<LittleEndian>()?;

        Ok(data_representation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u8,
    pub version_minor: u8,
    pub packet_type: PacketType,
    pub packet_flags: PacketFlags,
    pub data_rep: DataRepresentation,
    pub frag_len: u16,
    pub auth_len: u16,
    pub call_id: u32,
}

impl PduHeader {
    pub fn new(packet_type: PacketType, packet_flags: PacketFlags, auth_len: u16, call_id: u32) -> Self {
        Self {
            version: RPC_VERSION_MAJOR,
            version_minor: RPC_VERSION_MINOR,
            packet_type,
            packet_flags,
            data_rep: DataRepresentation::default(),
            // Patched once the whole PDU is serialized.
            frag_len: 0,
            auth_len,
            call_id,
        }
    }
}

impl Encode for PduHeader {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u8(self.version)?;
        writer.write_u8(self.version_minor)?;
        writer.write_u8(self.packet_type as u8)?;
        writer.write_u8(self.packet_flags.bits())?;
        self.data_rep.encode(&mut writer)?;
        writer.write_u16::<LittleEndian>(self.frag_len)?;
        writer.write_u16::<LittleEndian>(self.auth_len)?;
        writer.write_u32::<LittleEndian>(self.call_id)?;

        Ok(())
    }
}

impl Decode for PduHeader {
    fn decode(mut reader: impl Read) -> Result<Self> {
        Ok(Self {
            version: reader.read_u8()?,
            version_minor: reader.read_u8()?,
            packet_type: {
                let packet_type = reader.read_u8()?;
                PacketType::from_u8(packet_type).ok_or(Error::InvalidPacketType(packet_type))?
            },
            packet_flags: {
                let packet_flags = reader.read_u8()?;
                PacketFlags::from_bits(packet_flags).ok_or(Error::InvalidPacketFlags(packet_flags))?
            },
            data_rep: DataRepresentation::decode(&mut reader)?,
            frag_len: reader.read_u16::<LittleEndian>()?,
            auth_len: reader.read_u16::<LittleEndian>()?,
            call_id: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// Reads the announced fragment length out of a partially received buffer.
///
/// Returns `None` until enough bytes for the length field have arrived.
/// Transports use this to learn how many bytes complete the current PDU.
pub fn frag_len_hint(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < FRAG_LEN_OFFSET + 2 {
        return None;
    }

    Some(u16::from_le_bytes([bytes[FRAG_LEN_OFFSET], bytes[FRAG_LEN_OFFSET + 1]]))
}

/// Patches `frag_length` into an already-serialized PDU.
///
/// The engines serialize the body before the auth trailer is computed, so the
/// length fields are fixed up afterwards. Patching the same value twice is a
/// no-op by construction.
pub fn set_frag_len(pdu: &mut [u8], frag_len: u16) -> Result<()> {
    if pdu.len() < PDU_HEADER_SIZE {
        return Err(Error::BufferTooSmall {
            needed: PDU_HEADER_SIZE,
            actual: pdu.len(),
        });
    }

    pdu[FRAG_LEN_OFFSET..FRAG_LEN_OFFSET + 2].copy_from_slice(&frag_len.to_le_bytes());

    Ok(())
}

/// Patches `auth_length` into an already-serialized PDU. See [set_frag_len].
pub fn set_auth_len(pdu: &mut [u8], auth_len: u16) -> Result<()> {
    if pdu.len() < PDU_HEADER_SIZE {
        return Err(Error::BufferTooSmall {
            needed: PDU_HEADER_SIZE,
            actual: pdu.len(),
        });
    }

    pdu[AUTH_LEN_OFFSET..AUTH_LEN_OFFSET + 2].copy_from_slice(&auth_len.to_le_bytes());

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum SecurityProvider {
    None = 0x00,
    GssNegotiate = 0x09,
    Winnt = 0x0a,
    GssSchannel = 0x0e,
    GssKerberos = 0x10,
    Netlogon = 0x44,
    Default = 0xff,
}

impl SecurityProvider {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u8)]
pub enum AuthenticationLevel {
    Default = 0x00,
    None = 0x01,
    Connect = 0x02,
    Call = 0x03,
    Pkt = 0x04,
    PktIntegrity = 0x05,
    PktPrivacy = 0x06,
}

impl AuthenticationLevel {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Whether PDUs at this level carry a per-packet signature.
    pub fn is_signed(&self) -> bool {
        *self >= AuthenticationLevel::PktIntegrity
    }

    /// Whether stub data at this level is encrypted.
    pub fn is_sealed(&self) -> bool {
        *self == AuthenticationLevel::PktPrivacy
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityTrailer {
    pub security_type: SecurityProvider,
    pub level: AuthenticationLevel,
    pub pad_length: u8,
    pub context_id: u32,
    pub auth_value: Vec<u8>,
}

impl SecurityTrailer {
    /// Serialized size of the trailer without `auth_value`.
    pub const HEADER_SIZE: usize = 8;

    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.auth_value.len()
    }
}

impl Encode for SecurityTrailer {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u8(self.security_type as u8)?;
        writer.write_u8(self.level as u8)?;
        writer.write_u8(self.pad_length)?;
        writer.write_u8(0)?; // Auth-Rsrvd
        writer.write_u32::<LittleEndian>(self.context_id)?;
        write_buf(&self.auth_value, writer)?;

        Ok(())
    }
}

impl Decode for SecurityTrailer {
    fn decode(mut reader: impl Read) -> Result<Self> {
        let security_provider = reader.read_u8()?;
        let authentication_level = reader.read_u8()?;

        Ok(Self {
            security_type: SecurityProvider::from_u8(security_provider)
                .ok_or(Error::InvalidSecurityProvider(security_provider))?,
            level: AuthenticationLevel::from_u8(authentication_level)
                .ok_or(Error::InvalidAuthenticationLevel(authentication_level))?,
            pad_length: reader.read_u8()?,
            context_id: {
                // Skip Auth-Rsrvd.
                reader.read_u8()?;

                reader.read_u32::<LittleEndian>()?
            },
            auth_value: read_to_end(reader)?,
        })
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct FaultFlags: u8 {
        const None = 0x00;
        const ExtendedErrorPresent = 0x01;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    // Extension of MS-RPCE.
    pub flags: FaultFlags,
    pub status: u32,
    pub stub_data: Vec<u8>,
}

impl Encode for Fault {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.alloc_hint)?;
        writer.write_u16::<LittleEndian>(self.context_id)?;
        writer.write_u8(self.cancel_count)?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u32::<LittleEndian>(self.status)?;
        // alignment padding
        writer.write_u32::<LittleEndian>(0)?;
        write_buf(&self.stub_data, writer)?;

        Ok(())
    }
}

impl Decode for Fault {
    fn decode(mut reader: impl Read) -> Result<Self> {
        Ok(Self {
            alloc_hint: reader.read_u32::<LittleEndian>()?,
            context_id: reader.read_u16::<LittleEndian>()?,
            cancel_count: reader.read_u8()?,
            flags: {
                let fault_flags = reader.read_u8()?;
                FaultFlags::from_bits(fault_flags).ok_or(Error::InvalidFaultFlags(fault_flags))?
            },
            status: reader.read_u32::<LittleEndian>()?,
            stub_data: {
                // alignment padding
                reader.read_u32::<LittleEndian>()?;

                read_to_end(reader)?
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduData {
    Bind(Bind),
    BindAck(BindAck),
    BindNak(BindNak),
    AlterContext(AlterContext),
    AlterContextResponse(AlterContextResponse),
    Auth3(Auth3),
    Request(Request),
    Response(Response),
    Fault(Fault),
    /// CO_CANCEL and ORPHANED carry no body the engines care about.
    Empty,
}

impl PduData {
    pub fn decode(pdu_header: &PduHeader, data_len: usize, reader: impl Read) -> Result<Self> {
        let buf = read_vec(data_len, reader)?;

        match pdu_header.packet_type {
            PacketType::Bind => Ok(PduData::Bind(Bind::decode(&buf as &[u8])?)),
            PacketType::BindAck => Ok(PduData::BindAck(BindAck::decode(&buf as &[u8])?)),
            PacketType::BindNak => Ok(PduData::BindNak(BindNak::decode(&buf as &[u8])?)),
            PacketType::AlterContext => Ok(PduData::AlterContext(AlterContext::decode(&buf as &[u8])?)),
            PacketType::AlterContextResponse => Ok(PduData::AlterContextResponse(AlterContextResponse::decode(
                &buf as &[u8],
            )?)),
            PacketType::Auth3 => Ok(PduData::Auth3(Auth3::decode(&buf as &[u8])?)),
            PacketType::Request => Ok(PduData::Request(Request::decode(pdu_header, &buf as &[u8])?)),
            PacketType::Response => Ok(PduData::Response(Response::decode(&buf as &[u8])?)),
            PacketType::Fault => Ok(PduData::Fault(Fault::decode(&buf as &[u8])?)),
            PacketType::CoCancel | PacketType::Orphaned => Ok(PduData::Empty),
            packet_type => Err(Error::PduNotSupported(packet_type)),
        }
    }
}

impl Encode for PduData {
    fn encode(&self, writer: impl Write) -> Result<()> {
        match self {
            PduData::Bind(bind) => bind.encode(writer),
            PduData::BindAck(bind_ack) => bind_ack.encode(writer),
            PduData::BindNak(bind_nak) => bind_nak.encode(writer),
            PduData::AlterContext(alter_context) => alter_context.encode(writer),
            PduData::AlterContextResponse(alter_context_response) => alter_context_response.encode(writer),
            PduData::Auth3(auth3) => auth3.encode(writer),
            PduData::Request(request) => request.encode(writer),
            PduData::Response(response) => response.encode(writer),
            PduData::Fault(fault) => fault.encode(writer),
            PduData::Empty => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub header: PduHeader,
    pub data: PduData,
    pub security_trailer: Option<SecurityTrailer>,
}

impl Pdu {
    /// Decodes one PDU out of a buffer that holds exactly one fragment,
    /// enforcing that the announced `frag_length` matches the buffer.
    pub fn decode_exact(buf: &[u8]) -> Result<Self> {
        let pdu = Self::decode(buf)?;

        if usize::from(pdu.header.frag_len) != buf.len() {
            return Err(Error::InvalidFragLength(pdu.header.frag_len));
        }

        Ok(pdu)
    }
}

impl Encode for Pdu {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        self.header.encode(&mut writer)?;
        self.data.encode(&mut writer)?;
        if let Some(security_trailer) = self.security_trailer.as_ref() {
            security_trailer.encode(writer)?;
        }

        Ok(())
    }
}

impl Decode for Pdu {
    fn decode(mut reader: impl Read) -> Result<Self> {
        let header = PduHeader::decode(&mut reader)?;

        let security_trailer_len = if header.auth_len > 0 {
            SecurityTrailer::HEADER_SIZE + usize::from(header.auth_len)
        } else {
            0
        };

        let data_len = usize::from(header.frag_len)
            .checked_sub(security_trailer_len + PDU_HEADER_SIZE)
            .ok_or(Error::InvalidFragLength(header.frag_len))?;

        let data = PduData::decode(&header, data_len, &mut reader)?;

        let security_trailer = if header.auth_len > 0 {
            let trailer_buf = read_vec(security_trailer_len, reader)?;
            Some(SecurityTrailer::decode(&trailer_buf as &[u8])?)
        } else {
            None
        };

        Ok(Self {
            header,
            data,
            security_trailer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    test_encoding_decoding! {
        data_rep,
        DataRepresentation,
        DataRepresentation::default(),
        [0x10, 0, 0, 0]
    }

    test_encoding_decoding! {
        pdu_header,
        PduHeader,
        PduHeader {
            version: 5,
            version_minor: 0,
            packet_type: PacketType::Request,
            packet_flags: PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            data_rep: DataRepresentation::default(),
            frag_len: 1024,
            auth_len: 16,
            call_id: 7,
        },
        [5, 0, 0, 3, 16, 0, 0, 0, 0, 4, 16, 0, 7, 0, 0, 0]
    }

    test_encoding_decoding! {
        sec_trailer,
        SecurityTrailer,
        SecurityTrailer {
            security_type: SecurityProvider::Winnt,
            level: AuthenticationLevel::PktPrivacy,
            pad_length: 12,
            context_id: 0,
            auth_value: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
        },
        [10, 6, 12, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
    }

    test_encoding_decoding! {
        fault,
        Fault,
        Fault {
            alloc_hint: 0,
            context_id: 1,
            cancel_count: 0,
            flags: FaultFlags::None,
            status: fault_status::NCA_S_UNKNOWN_IF,
            stub_data: vec![],
        },
        [0, 0, 0, 0, 1, 0, 0, 0, 3, 0, 1, 28, 0, 0, 0, 0]
    }

    #[test]
    fn frag_len_patching_is_idempotent() {
        let header = PduHeader::new(PacketType::Request, PacketFlags::PfcFirstFrag, 0, 1);
        let mut buf = crate::EncodeExt::encode_to_vec(&header).unwrap();

        set_frag_len(&mut buf, 512).unwrap();
        let first = buf.clone();
        set_frag_len(&mut buf, 512).unwrap();

        assert_eq!(first, buf);
        assert_eq!(frag_len_hint(&buf), Some(512));
    }

    #[test]
    fn decode_exact_rejects_wrong_frag_len() {
        let pdu = Pdu {
            header: PduHeader::new(
                PacketType::Request,
                PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
                0,
                1,
            ),
            data: PduData::Request(crate::request::Request {
                alloc_hint: 4,
                context_id: 0,
                opnum: 0,
                obj: None,
                stub_data: vec![0xaa; 4],
            }),
            security_trailer: None,
        };

        let mut buf = crate::EncodeExt::encode_to_vec(&pdu).unwrap();
        let frag_len = buf.len() as u16 + 1;
        set_frag_len(&mut buf, frag_len).unwrap();

        assert!(Pdu::decode_exact(&buf).is_err());
    }

    #[test]
    fn auth_len_larger_than_stub_is_rejected() {
        let mut buf = crate::EncodeExt::encode_to_vec(&PduHeader::new(
            PacketType::Request,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            // Announces a trailer that cannot fit in a 16-byte PDU.
            64,
            1,
        ))
        .unwrap();
        set_frag_len(&mut buf, 16).unwrap();

        assert!(matches!(Pdu::decode(&buf as &[u8]), Err(Error::InvalidFragLength(16))));
    }
}
