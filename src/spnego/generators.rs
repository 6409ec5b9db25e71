use oid::ObjectIdentifier;
use picky::oids;
use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ExplicitContextTag3,
    ObjectIdentifierAsn1, OctetStringAsn1, Optional,
};
use picky_asn1_der::Asn1RawDer;
use picky_krb::constants::gss_api::{ACCEPT_COMPLETE, ACCEPT_INCOMPLETE};
use picky_krb::gss_api::{ApplicationTag0, GssApiNegInit, MechType, MechTypeList, NegTokenInit, NegTokenTarg, NegTokenTarg1};

use crate::Result;

/// Builds the mechTypes list out of the candidate OIDs, in priority order.
pub(super) fn generate_mech_type_list(mech_oids: &[ObjectIdentifier]) -> MechTypeList {
    MechTypeList::from(Asn1SequenceOf::from(
        mech_oids.iter().cloned().map(MechType::from).collect::<Vec<_>>(),
    ))
}

/// Generates the initial SPNEGO token carrying the mechanism list and the
/// optimistic token of the preferred mechanism.
pub(super) fn generate_neg_token_init(
    mech_list: MechTypeList,
    optimistic_token: Option<Vec<u8>>,
) -> Result<ApplicationTag0<GssApiNegInit>> {
    Ok(ApplicationTag0(GssApiNegInit {
        oid: ObjectIdentifierAsn1::from(oids::spnego()),
        neg_token_init: ExplicitContextTag0::from(NegTokenInit {
            mech_types: Optional::from(Some(ExplicitContextTag0::from(mech_list))),
            req_flags: Optional::from(None),
            mech_token: Optional::from(
                optimistic_token.map(|token| ExplicitContextTag2::from(OctetStringAsn1::from(token))),
            ),
            mech_list_mic: Optional::from(None),
        }),
    }))
}

/// A continuation token: negotiation is still in progress.
pub(super) fn generate_neg_token_targ(
    supported_mech: Option<ObjectIdentifier>,
    response_token: Option<Vec<u8>>,
    mech_list_mic: Option<Vec<u8>>,
) -> NegTokenTarg1 {
    NegTokenTarg1::from(NegTokenTarg {
        neg_result: Optional::from(Some(ExplicitContextTag0::from(Asn1RawDer(ACCEPT_INCOMPLETE.to_vec())))),
        supported_mech: Optional::from(supported_mech.map(|oid| ExplicitContextTag1::from(MechType::from(oid)))),
        response_token: Optional::from(
            response_token.map(|token| ExplicitContextTag2::from(OctetStringAsn1::from(token))),
        ),
        mech_list_mic: Optional::from(mech_list_mic.map(|mic| ExplicitContextTag3::from(OctetStringAsn1::from(mic)))),
    })
}

/// The final token: negotiation succeeded, optionally carrying the last
/// mechanism token and the mechListMIC.
pub(super) fn generate_final_neg_token_targ(
    response_token: Option<Vec<u8>>,
    mech_list_mic: Option<Vec<u8>>,
) -> NegTokenTarg1 {
    NegTokenTarg1::from(NegTokenTarg {
        neg_result: Optional::from(Some(ExplicitContextTag0::from(Asn1RawDer(ACCEPT_COMPLETE.to_vec())))),
        supported_mech: Optional::from(None),
        response_token: Optional::from(
            response_token.map(|token| ExplicitContextTag2::from(OctetStringAsn1::from(token))),
        ),
        mech_list_mic: Optional::from(mech_list_mic.map(|mic| ExplicitContextTag3::from(OctetStringAsn1::from(mic)))),
    })
}
