use oid::ObjectIdentifier;
use picky_krb::constants::gss_api::{ACCEPT_COMPLETE, ACCEPT_INCOMPLETE};
use picky_krb::gss_api::{ApplicationTag0, GssApiNegInit, MechTypeList, NegTokenInit, NegTokenTarg, NegTokenTarg1};

use crate::{Error, Result};

/// What the peer said about the negotiation in a negTokenTarg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NegResult {
    AcceptCompleted,
    AcceptIncomplete,
    Reject,
    /// The optional field was absent.
    Unspecified,
}

#[derive(Debug)]
pub(super) struct ParsedNegTokenTarg {
    pub neg_result: NegResult,
    pub supported_mech: Option<ObjectIdentifier>,
    pub response_token: Option<Vec<u8>>,
    pub mech_list_mic: Option<Vec<u8>>,
}

/// Extracts the mechanism list and the optimistic token from the first
/// SPNEGO token on the wire.
pub(super) fn decode_neg_token_init(data: &[u8]) -> Result<(MechTypeList, Option<Vec<u8>>)> {
    let token: ApplicationTag0<GssApiNegInit> = picky_asn1_der::from_bytes(data)?;
    let NegTokenInit {
        mech_types,
        req_flags: _,
        mech_token,
        mech_list_mic: _,
    } = token.0.neg_token_init.0;

    let mech_types = mech_types
        .0
        .ok_or_else(|| {
            Error::InvalidParameter(String::from("mech_types is missing in the negTokenInit message"))
        })?
        .0;

    let mech_token = mech_token.0.map(|token| token.0 .0);

    Ok((mech_types, mech_token))
}

pub(super) fn decode_neg_token_targ(data: &[u8]) -> Result<ParsedNegTokenTarg> {
    let neg_token_targ: NegTokenTarg1 = picky_asn1_der::from_bytes(data)?;
    let NegTokenTarg {
        neg_result,
        supported_mech,
        response_token,
        mech_list_mic,
    } = neg_token_targ.0;

    let neg_result = match neg_result.0 {
        Some(raw) => {
            let raw = raw.0 .0;
            if raw == ACCEPT_COMPLETE.to_vec() {
                NegResult::AcceptCompleted
            } else if raw == ACCEPT_INCOMPLETE.to_vec() {
                NegResult::AcceptIncomplete
            } else {
                NegResult::Reject
            }
        }
        None => NegResult::Unspecified,
    };

    Ok(ParsedNegTokenTarg {
        neg_result,
        supported_mech: supported_mech.0.map(|mech_type| mech_type.0 .0),
        response_token: response_token.0.map(|token| token.0 .0),
        mech_list_mic: mech_list_mic.0.map(|mic| mic.0 .0),
    })
}

/// Walks the client's mechanism list in its order of preference and returns
/// the first OID the acceptor supports, along with its list position.
pub(super) fn select_mech_type(
    mech_list: &MechTypeList,
    supported: impl Fn(&ObjectIdentifier) -> bool,
) -> Result<(usize, ObjectIdentifier)> {
    mech_list
        .0
        .iter()
        .enumerate()
        .find(|(_, mech_type)| supported(&mech_type.0))
        .map(|(index, mech_type)| (index, mech_type.0.clone()))
        .ok_or_else(|| {
            Error::InvalidParameter(String::from(
                "the peer's mechanism list contains no supported mechanism",
            ))
        })
}
