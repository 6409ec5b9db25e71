use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Error, Result};

pub(crate) const AV_PAIR_EOL: u16 = 0;
pub(crate) const AV_PAIR_NB_COMPUTER_NAME: u16 = 1;
pub(crate) const AV_PAIR_NB_DOMAIN_NAME: u16 = 2;
pub(crate) const AV_PAIR_DNS_COMPUTER_NAME: u16 = 3;
pub(crate) const AV_PAIR_DNS_DOMAIN_NAME: u16 = 4;
pub(crate) const AV_PAIR_DNS_TREE_NAME: u16 = 5;
pub(crate) const AV_PAIR_FLAGS: u16 = 6;
pub(crate) const AV_PAIR_TIMESTAMP: u16 = 7;
pub(crate) const AV_PAIR_SINGLE_HOST: u16 = 8;
pub(crate) const AV_PAIR_TARGET_NAME: u16 = 9;
pub(crate) const AV_PAIR_CHANNEL_BINDINGS: u16 = 10;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MsvAvFlags: u32 {
        const ACCOUNT_AUTH_CONSTRAINED = 0x01;
        const MESSAGE_INTEGRITY_CHECK = 0x02;
        const TARGET_SPN_FROM_UNTRUSTED = 0x04;
    }
}

/// One `MsvAv*` attribute/value pair from an NTLM target-info blob
/// (MS-NLMP 2.2.2.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AvPair {
    EOL,
    NbComputerName(Vec<u8>),
    NbDomainName(Vec<u8>),
    DnsComputerName(Vec<u8>),
    DnsDomainName(Vec<u8>),
    DnsTreeName(Vec<u8>),
    Flags(u32),
    Timestamp(u64),
    SingleHost(Vec<u8>),
    TargetName(Vec<u8>),
    ChannelBindings([u8; 16]),
}

impl AvPair {
    pub(crate) fn as_u16(&self) -> u16 {
        match self {
            AvPair::EOL => AV_PAIR_EOL,
            AvPair::NbComputerName(_) => AV_PAIR_NB_COMPUTER_NAME,
            AvPair::NbDomainName(_) => AV_PAIR_NB_DOMAIN_NAME,
            AvPair::DnsComputerName(_) => AV_PAIR_DNS_COMPUTER_NAME,
            AvPair::DnsDomainName(_) => AV_PAIR_DNS_DOMAIN_NAME,
            AvPair::DnsTreeName(_) => AV_PAIR_DNS_TREE_NAME,
            AvPair::Flags(_) => AV_PAIR_FLAGS,
            AvPair::Timestamp(_) => AV_PAIR_TIMESTAMP,
            AvPair::SingleHost(_) => AV_PAIR_SINGLE_HOST,
            AvPair::TargetName(_) => AV_PAIR_TARGET_NAME,
            AvPair::ChannelBindings(_) => AV_PAIR_CHANNEL_BINDINGS,
        }
    }

    fn value(&self) -> Vec<u8> {
        match self {
            AvPair::EOL => Vec::new(),
            AvPair::NbComputerName(value)
            | AvPair::NbDomainName(value)
            | AvPair::DnsComputerName(value)
            | AvPair::DnsDomainName(value)
            | AvPair::DnsTreeName(value)
            | AvPair::SingleHost(value)
            | AvPair::TargetName(value) => value.clone(),
            AvPair::Flags(flags) => flags.to_le_bytes().to_vec(),
            AvPair::Timestamp(timestamp) => timestamp.to_le_bytes().to_vec(),
            AvPair::ChannelBindings(hash) => hash.to_vec(),
        }
    }

    pub(crate) fn list_to_buffer(av_pairs: &[AvPair]) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();

        for av_pair in av_pairs {
            let value = av_pair.value();
            buffer.write_u16::<LittleEndian>(av_pair.as_u16())?;
            buffer.write_u16::<LittleEndian>(value.len().try_into()?)?;
            buffer.write_all(&value)?;
        }

        Ok(buffer)
    }

    pub(crate) fn buffer_to_av_pairs(buffer: &[u8]) -> Result<Vec<AvPair>> {
        let mut reader = Cursor::new(buffer);
        let mut av_pairs = Vec::new();

        loop {
            let id = reader.read_u16::<LittleEndian>()?;
            let len = usize::from(reader.read_u16::<LittleEndian>()?);

            let mut value = vec![0u8; len];
            reader.read_exact(&mut value)?;

            let av_pair = match id {
                AV_PAIR_EOL => {
                    av_pairs.push(AvPair::EOL);
                    break;
                }
                AV_PAIR_NB_COMPUTER_NAME => AvPair::NbComputerName(value),
                AV_PAIR_NB_DOMAIN_NAME => AvPair::NbDomainName(value),
                AV_PAIR_DNS_COMPUTER_NAME => AvPair::DnsComputerName(value),
                AV_PAIR_DNS_DOMAIN_NAME => AvPair::DnsDomainName(value),
                AV_PAIR_DNS_TREE_NAME => AvPair::DnsTreeName(value),
                AV_PAIR_FLAGS => AvPair::Flags(u32::from_le_bytes(value.as_slice().try_into().map_err(|_| {
                    Error::InvalidParameter(String::from("MsvAvFlags value is not four bytes"))
                })?)),
                AV_PAIR_TIMESTAMP => AvPair::Timestamp(u64::from_le_bytes(value.as_slice().try_into().map_err(
                    |_| Error::InvalidParameter(String::from("MsvAvTimestamp value is not eight bytes")),
                )?)),
                AV_PAIR_SINGLE_HOST => AvPair::SingleHost(value),
                AV_PAIR_TARGET_NAME => AvPair::TargetName(value),
                AV_PAIR_CHANNEL_BINDINGS => AvPair::ChannelBindings(value.as_slice().try_into().map_err(|_| {
                    Error::InvalidParameter(String::from("MsvAvChannelBindings value is not sixteen bytes"))
                })?),
                unknown => {
                    return Err(Error::InvalidParameter(format!(
                        "unknown target-info attribute id: {}",
                        unknown
                    )))
                }
            };

            av_pairs.push(av_pair);
        }

        Ok(av_pairs)
    }
}
