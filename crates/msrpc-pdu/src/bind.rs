use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::{uuid, Uuid};

use crate::{read_padding, read_vec, write_buf, write_padding, Decode, Encode, Error, Result};

/// Transfer syntax of the NDR encoding this engine speaks
/// (`8a885d04-1ceb-11c9-9fe8-08002b104860` v2.0).
pub const NDR_SYNTAX: SyntaxId = SyntaxId {
    uuid: uuid!("8a885d04-1ceb-11c9-9fe8-08002b104860"),
    version: 2,
    version_minor: 0,
};

/// UUID prefix of the bind-time feature negotiation pseudo transfer syntax
/// (MS-RPCE 3.3.1.5.3). The trailing eight bytes carry the feature bitmask.
pub const BIND_TIME_FEATURES_PREFIX: [u8; 8] = [0x2c, 0x1c, 0xb7, 0x6c, 0x12, 0x98, 0x40, 0x45];

/// [BindTimeFeatureNegotiationBitmask](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-rpce/cef529cc-77b5-4794-85dc-91e1467e80f0)
///
/// The bind time feature negotiation bitmask is an array of eight octets, each of which is interpreted as a bitmask.
/// **Bitmask**: Currently, only the two least significant bits in the first element of the array are defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BindTimeFeatureNegotiationBitmask {
    None = 0x0,
    /// Client supports security context multiplexing.
    SecurityContextMultiplexingSupported = 0x01,
    /// Client supports keeping the connection open after sending the orphaned PDU.
    KeepConnectionOnOrphanSupported = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u16,
    pub version_minor: u16,
}

impl SyntaxId {
    /// Whether this syntax is the bind-time feature negotiation marker
    /// rather than a real transfer syntax.
    pub fn is_bind_time_features(&self) -> bool {
        self.uuid.to_bytes_le()[..8] == BIND_TIME_FEATURES_PREFIX
    }
}

impl Encode for SyntaxId {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        self.uuid.encode(&mut writer)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u16::<LittleEndian>(self.version_minor)?;

        Ok(())
    }
}

impl Decode for SyntaxId {
    fn decode(mut reader: impl Read) -> Result<SyntaxId> {
        Ok(Self {
            uuid: Uuid::decode(&mut reader)?,
            version: reader.read_u16::<LittleEndian>()?,
            version_minor: reader.read_u16::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl Encode for ContextElement {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.context_id)?;
        writer.write_u16::<LittleEndian>(self.transfer_syntaxes.len().try_into()?)?;

        self.abstract_syntax.encode(&mut writer)?;

        for transfer_syntax in &self.transfer_syntaxes {
            transfer_syntax.encode(&mut writer)?;
        }

        Ok(())
    }
}

impl Decode for ContextElement {
    fn decode(mut reader: impl Read) -> Result<ContextElement> {
        let context_id = reader.read_u16::<LittleEndian>()?;
        let transfer_syntaxes_count = usize::from(reader.read_u16::<LittleEndian>()?);
        let abstract_syntax = SyntaxId::decode(&mut reader)?;

        let transfer_syntaxes = (0..transfer_syntaxes_count)
            .map(|_| SyntaxId::decode(&mut reader))
            .collect::<Result<_>>()?;

        Ok(Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        })
    }
}

/// [`p_cont_def_result_t` Enumerator](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-rpce/8df5c4d4-364d-468c-81fe-ec94c1b40917)
///
/// These extensions specify a new member, `negotiate_ack`, which is added to the `p_cont_def_result_t` enumeration
/// (specified in C706 section 12.6), with the numeric value of `3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContextResultCode {
    Acceptance = 0,
    UserRejection = 1,
    ProviderRejection = 2,
    NegotiateAck = 3, // MS-RPCE extension
}

impl ContextResultCode {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

impl TryFrom<u16> for ContextResultCode {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            0 => Ok(Self::Acceptance),
            1 => Ok(Self::UserRejection),
            2 => Ok(Self::ProviderRejection),
            3 => Ok(Self::NegotiateAck),
            v => Err(Error::InvalidContextResultCode(v)),
        }
    }
}

/// Provider-rejection reasons (`p_provider_reason_t`, C706 12.6.3.1).
pub mod provider_reason {
    pub const REASON_NOT_SPECIFIED: u16 = 0;
    pub const ABSTRACT_SYNTAX_NOT_SUPPORTED: u16 = 1;
    pub const PROPOSED_TRANSFER_SYNTAXES_NOT_SUPPORTED: u16 = 2;
    pub const LOCAL_LIMIT_EXCEEDED: u16 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextResult {
    pub result: ContextResultCode,
    pub reason: u16,
    pub syntax: Uuid,
    pub syntax_version: u32,
}

impl ContextResult {
    pub fn acceptance(transfer_syntax: &SyntaxId) -> Self {
        Self {
            result: ContextResultCode::Acceptance,
            reason: provider_reason::REASON_NOT_SPECIFIED,
            syntax: transfer_syntax.uuid,
            syntax_version: u32::from(transfer_syntax.version),
        }
    }

    pub fn provider_rejection(reason: u16) -> Self {
        Self {
            result: ContextResultCode::ProviderRejection,
            reason,
            syntax: Uuid::nil(),
            syntax_version: 0,
        }
    }
}

impl Encode for ContextResult {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.result.as_u16())?;
        writer.write_u16::<LittleEndian>(self.reason)?;
        self.syntax.encode(&mut writer)?;
        writer.write_u32::<LittleEndian>(self.syntax_version)?;

        Ok(())
    }
}

impl Decode for ContextResult {
    fn decode(mut reader: impl Read) -> Result<Self> {
        Ok(Self {
            result: reader.read_u16::<LittleEndian>()?.try_into()?,
            reason: reader.read_u16::<LittleEndian>()?,
            syntax: Uuid::decode(&mut reader)?,
            syntax_version: reader.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group: u32,
    pub contexts: Vec<ContextElement>,
}

impl Encode for Bind {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.max_xmit_frag)?;
        writer.write_u16::<LittleEndian>(self.max_recv_frag)?;
        writer.write_u32::<LittleEndian>(self.assoc_group)?;
        writer.write_u32::<LittleEndian>(self.contexts.len().try_into()?)?;

        for context in &self.contexts {
            context.encode(&mut writer)?;
        }

        Ok(())
    }
}

impl Decode for Bind {
    fn decode(mut reader: impl Read) -> Result<Self> {
        let max_xmit_frag = reader.read_u16::<LittleEndian>()?;
        let max_recv_frag = reader.read_u16::<LittleEndian>()?;
        let assoc_group = reader.read_u32::<LittleEndian>()?;

        let contexts_count = reader.read_u32::<LittleEndian>()?;
        let contexts = (0..contexts_count)
            .map(|_| ContextElement::decode(&mut reader))
            .collect::<Result<_>>()?;

        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group,
            contexts,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAck {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group: u32,
    pub sec_addr: String,
    pub results: Vec<ContextResult>,
}

impl Encode for BindAck {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.max_xmit_frag)?;
        writer.write_u16::<LittleEndian>(self.max_recv_frag)?;
        writer.write_u32::<LittleEndian>(self.assoc_group)?;

        let sec_addr_len = if !self.sec_addr.is_empty() {
            let sec_addr_len = self.sec_addr.len() + 1;
            writer.write_u16::<LittleEndian>(sec_addr_len.try_into()?)?;

            write_buf(self.sec_addr.as_bytes(), &mut writer)?;
            writer.write_u8(0)?;

            sec_addr_len
        } else {
            writer.write_u16::<LittleEndian>(0)?;

            0
        } + 2;

        write_padding::<4>(sec_addr_len, &mut writer)?;

        writer.write_u32::<LittleEndian>(self.results.len().try_into()?)?;
        for result in &self.results {
            result.encode(&mut writer)?;
        }

        Ok(())
    }
}

impl Decode for BindAck {
    fn decode(mut reader: impl Read) -> Result<Self> {
        Ok(Self {
            max_xmit_frag: reader.read_u16::<LittleEndian>()?,
            max_recv_frag: reader.read_u16::<LittleEndian>()?,
            assoc_group: reader.read_u32::<LittleEndian>()?,
            sec_addr: {
                let sec_addr_len = usize::from(reader.read_u16::<LittleEndian>()?);
                let sec_addr = if sec_addr_len > 0 {
                    let buf = read_vec(sec_addr_len - 1 /* null byte */, &mut reader)?;

                    // Read null-terminator byte.
                    reader.read_u8()?;

                    String::from_utf8(buf)?
                } else {
                    String::new()
                };

                read_padding::<4>(sec_addr_len + 2 /* len */, &mut reader)?;

                sec_addr
            },
            results: {
                let results_count = reader.read_u32::<LittleEndian>()?;
                (0..results_count)
                    .map(|_| ContextResult::decode(&mut reader))
                    .collect::<Result<_>>()?
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindNak {
    pub reason: u16,
    pub versions: Vec<(u8, u8)>,
}

impl BindNak {
    pub fn new(reason: u16) -> Self {
        Self {
            reason,
            versions: vec![(crate::pdu::RPC_VERSION_MAJOR, crate::pdu::RPC_VERSION_MINOR)],
        }
    }
}

impl Encode for BindNak {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u16::<LittleEndian>(self.reason)?;

        writer.write_u8(self.versions.len().try_into()?)?;
        for version in &self.versions {
            writer.write_u8(version.0)?;
            writer.write_u8(version.1)?;
        }

        let versions_buf_len = 1 /* len */ + 2 /* version size */ * self.versions.len();
        write_padding::<4>(2 + versions_buf_len, &mut writer)?;

        Ok(())
    }
}

impl Decode for BindNak {
    fn decode(mut reader: impl Read) -> Result<Self> {
        Ok(Self {
            reason: reader.read_u16::<LittleEndian>()?,
            versions: {
                let versions_count = reader.read_u8()?;
                let versions = (0..versions_count)
                    .map(|_| Ok((reader.read_u8()?, reader.read_u8()?)))
                    .collect::<Result<Vec<_>>>()?;

                let versions_buf_len = 1 /* len */ + 2 /* version size */ * versions.len();
                read_padding::<4>(2 + versions_buf_len, reader)?;

                versions
            },
        })
    }
}

// `AlterContext` has the same layout as `Bind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterContext(pub Bind);

impl Encode for AlterContext {
    fn encode(&self, writer: impl Write) -> Result<()> {
        self.0.encode(writer)
    }
}

impl Decode for AlterContext {
    fn decode(reader: impl Read) -> Result<Self> {
        Ok(Self(Bind::decode(reader)?))
    }
}

// `AlterContextResponse` has the same layout as `BindAck`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterContextResponse(pub BindAck);

impl Encode for AlterContextResponse {
    fn encode(&self, writer: impl Write) -> Result<()> {
        self.0.encode(writer)
    }
}

impl Decode for AlterContextResponse {
    fn decode(reader: impl Read) -> Result<Self> {
        Ok(Self(BindAck::decode(reader)?))
    }
}

/// `AUTH3` body: four pad bytes, then the security trailer (which the outer
/// [crate::pdu::Pdu] codec carries separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Auth3;

impl Encode for Auth3 {
    fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u32::<LittleEndian>(0)?;

        Ok(())
    }
}

impl Decode for Auth3 {
    fn decode(mut reader: impl Read) -> Result<Self> {
        reader.read_u32::<LittleEndian>()?;

        Ok(Self)
    }
}
