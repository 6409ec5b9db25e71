//! SPNEGO (RFC 4178) negotiator: wraps the registered mechanisms, performs
//! mechanism-list negotiation, forwards tokens to the selected mechanism,
//! and exchanges the mechListMIC once the inner exchange succeeds.
//!
//! The mechListMIC verification is the anti-downgrade check: both peers sign
//! the exact DER bytes of the mechanism list that was offered, so an
//! attacker who strips the stronger mechanisms from the list is caught even
//! though the remaining mechanism authenticated successfully.

mod extractors;
mod generators;

use oid::ObjectIdentifier;

use self::extractors::{decode_neg_token_init, decode_neg_token_targ, select_mech_type, NegResult};
use self::generators::{
    generate_final_neg_token_targ, generate_mech_type_list, generate_neg_token_init, generate_neg_token_targ,
};
use crate::gensec::{MechUpdate, Mechanism, Role, SecurityProvider};
use crate::{Error, Result};

pub const PKG_NAME: &str = "Negotiate";

/// DER application tag 0, the outer tag of `negTokenInit`.
const SPNEGO_INIT_TAG: u8 = 0x60;
/// DER context tag 1, the outer tag of `negTokenTarg`.
const SPNEGO_TARG_TAG: u8 = 0xa1;

/// Compatibility switches for SPNEGO. Both are off by default.
#[derive(Debug, Clone, Default)]
pub struct SpnegoConfig {
    /// Accept peers that complete the exchange without a mechListMIC even
    /// though the selected mechanism could have produced one. Disables the
    /// anti-downgrade protection; exists only for very old interop.
    pub allow_missing_mic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpnegoState {
    Start,
    Targ,
    Done,
    /// The peer spoke a raw mechanism instead of SPNEGO; everything is
    /// delegated to the probed mechanism.
    Fallback,
}

/// The SPNEGO pseudo-mechanism. Holds the candidate sub-mechanisms in
/// priority order until one is selected by the exchange.
#[derive(Debug)]
pub struct Spnego {
    config: SpnegoConfig,
    role: Role,
    state: SpnegoState,
    candidates: Vec<Box<dyn Mechanism>>,
    selected: Option<Box<dyn Mechanism>>,
    /// Exact DER bytes of the negotiated mechanism list, kept for the
    /// mechListMIC computation.
    mech_types: Vec<u8>,
    inner_done: bool,
    mic_exchanged: bool,
}

impl Spnego {
    pub fn new(role: Role, candidates: Vec<Box<dyn Mechanism>>, config: SpnegoConfig) -> Result<Self> {
        if candidates.is_empty() {
            return Err(Error::InvalidParameter(String::from(
                "SPNEGO requires at least one sub-mechanism",
            )));
        }

        Ok(Self {
            config,
            role,
            state: SpnegoState::Start,
            candidates,
            selected: None,
            mech_types: Vec::new(),
            inner_done: false,
            mic_exchanged: false,
        })
    }

    /// Whether the anti-downgrade MIC exchange completed on this side.
    pub fn mic_exchanged(&self) -> bool {
        self.mic_exchanged
    }

    fn selected_mut(&mut self) -> Result<&mut Box<dyn Mechanism>> {
        self.selected
            .as_mut()
            .ok_or_else(|| Error::OutOfSequence(String::from("no mechanism has been selected yet")))
    }

    /// Moves the candidate with the given OID into the selected slot.
    fn select_candidate(&mut self, mech_oid: &ObjectIdentifier) -> Result<()> {
        let index = self
            .candidates
            .iter()
            .position(|candidate| candidate.oid() == *mech_oid)
            .ok_or_else(|| {
                Error::InvalidParameter(format!("the peer selected an unsupported mechanism: {:?}", mech_oid))
            })?;

        self.selected = Some(self.candidates.remove(index));

        Ok(())
    }

    fn candidate_oids(&self) -> Vec<ObjectIdentifier> {
        self.candidates.iter().map(|candidate| candidate.oid()).collect()
    }

    /// Verifies the peer's mechListMIC, or fails the exchange when it is
    /// required but absent.
    fn check_peer_mic(&mut self, mech_list_mic: Option<Vec<u8>>) -> Result<()> {
        let mech_types = self.mech_types.clone();
        let allow_missing_mic = self.config.allow_missing_mic;
        let selected = self.selected_mut()?;

        match mech_list_mic {
            Some(mic) => {
                selected.verify_mic(&mech_types, &mic)?;
                self.mic_exchanged = true;

                Ok(())
            }
            None if selected.supports_integrity() && !allow_missing_mic => Err(Error::AccessDenied(String::from(
                "the peer did not send a mechListMIC; possible mechanism downgrade",
            ))),
            None => Ok(()),
        }
    }

    fn our_mic(&mut self) -> Result<Option<Vec<u8>>> {
        let mech_types = self.mech_types.clone();
        let selected = self.selected_mut()?;

        if selected.supports_integrity() {
            selected.generate_mic(&mech_types)
        } else {
            Ok(None)
        }
    }

    fn client_start(&mut self) -> Result<MechUpdate> {
        let mech_list = generate_mech_type_list(&self.candidate_oids());
        self.mech_types = picky_asn1_der::to_vec(&mech_list)?;

        // Optimistic token of the preferred mechanism.
        self.selected = Some(self.candidates.remove(0));
        let optimistic = self.selected_mut()?.update(&[])?;
        if optimistic.is_done() {
            self.inner_done = true;
        }

        let token = picky_asn1_der::to_vec(&generate_neg_token_init(
            mech_list,
            Some(optimistic.token().to_vec()),
        )?)?;

        self.state = SpnegoState::Targ;

        Ok(MechUpdate::MoreProcessing(token))
    }

    fn client_targ(&mut self, input: &[u8]) -> Result<MechUpdate> {
        // A peer that ignored the SPNEGO framing and answered with a raw
        // mechanism token pushes the exchange into the fallback state.
        if input.first() != Some(&SPNEGO_TARG_TAG)
            && self
                .selected
                .as_ref()
                .is_some_and(|selected| selected.magic(input))
        {
            self.state = SpnegoState::Fallback;

            let outcome = self.selected_mut()?.update(input)?;
            if outcome.is_done() {
                self.inner_done = true;
            }

            return Ok(outcome);
        }

        let targ = decode_neg_token_targ(input)?;

        if targ.neg_result == NegResult::Reject {
            return Err(Error::AccessDenied(String::from("the server rejected the negotiation")));
        }

        // The server may have picked a mechanism other than our optimistic
        // one; restart the exchange with that candidate.
        if let Some(supported_mech) = targ.supported_mech.as_ref() {
            let current = self.selected_mut()?.oid();
            if current != *supported_mech {
                if self.inner_done {
                    return Err(Error::InvalidParameter(String::from(
                        "the server switched mechanisms after the exchange completed",
                    )));
                }

                self.select_candidate(supported_mech)?;
            }
        }

        if self.inner_done {
            // We already delivered the final mechanism token; this leg can
            // only carry the server's result and MIC.
            if targ.neg_result != NegResult::AcceptCompleted {
                return Err(Error::AccessDenied(String::from(
                    "the server did not complete the negotiation",
                )));
            }

            self.check_peer_mic(targ.mech_list_mic)?;
            self.state = SpnegoState::Done;

            return Ok(MechUpdate::Done(Vec::new()));
        }

        let inner_token = targ.response_token.unwrap_or_default();
        let outcome = self.selected_mut()?.update(&inner_token)?;

        match outcome {
            MechUpdate::MoreProcessing(token) => {
                let reply = generate_neg_token_targ(None, Some(token), None);

                Ok(MechUpdate::MoreProcessing(picky_asn1_der::to_vec(&reply)?))
            }
            MechUpdate::Done(token) => {
                self.inner_done = true;

                if targ.neg_result == NegResult::AcceptCompleted {
                    // The server finished first (its mechanism had nothing
                    // more to say); verify its MIC and send ours.
                    self.check_peer_mic(targ.mech_list_mic)?;
                    let mic = self.our_mic()?;
                    let token = if token.is_empty() { None } else { Some(token) };
                    let reply = generate_final_neg_token_targ(token, mic);
                    self.state = SpnegoState::Done;

                    Ok(MechUpdate::Done(picky_asn1_der::to_vec(&reply)?))
                } else {
                    // Final mechanism token still has to reach the server;
                    // attach our MIC and wait for its accept-complete.
                    let mic = self.our_mic()?;
                    let token = if token.is_empty() { None } else { Some(token) };
                    let reply = generate_neg_token_targ(None, token, mic);

                    Ok(MechUpdate::MoreProcessing(picky_asn1_der::to_vec(&reply)?))
                }
            }
        }
    }

    fn server_start(&mut self, input: &[u8]) -> Result<MechUpdate> {
        if input.first() != Some(&SPNEGO_INIT_TAG) {
            // Not SPNEGO at all: fall back to whichever mechanism claims
            // this token.
            let index = self
                .candidates
                .iter()
                .position(|candidate| candidate.magic(input))
                .ok_or_else(|| {
                    Error::InvalidParameter(String::from("the initial token matches no registered mechanism"))
                })?;
            self.selected = Some(self.candidates.remove(index));
            self.state = SpnegoState::Fallback;

            let outcome = self.selected_mut()?.update(input)?;
            if outcome.is_done() {
                self.inner_done = true;
            }

            return Ok(outcome);
        }

        let (mech_list, mech_token) = decode_neg_token_init(input)?;
        // Record the exact bytes the client offered; the MIC is computed
        // over them on both sides.
        self.mech_types = picky_asn1_der::to_vec(&mech_list)?;

        let (index, mech_oid) = select_mech_type(&mech_list, |oid| {
            self.candidates.iter().any(|candidate| candidate.oid() == *oid)
        })?;
        self.select_candidate(&mech_oid)?;

        // The optimistic token belongs to the client's first-choice
        // mechanism; only feed it through if that is the one we selected.
        let response_token = if index == 0 {
            if let Some(mech_token) = mech_token {
                let outcome = self.selected_mut()?.update(&mech_token)?;
                if outcome.is_done() {
                    self.inner_done = true;
                }

                Some(outcome.token().to_vec()).filter(|token| !token.is_empty())
            } else {
                None
            }
        } else {
            None
        };

        self.state = SpnegoState::Targ;

        let reply = generate_neg_token_targ(Some(mech_oid), response_token, None);

        Ok(MechUpdate::MoreProcessing(picky_asn1_der::to_vec(&reply)?))
    }

    fn server_targ(&mut self, input: &[u8]) -> Result<MechUpdate> {
        let targ = decode_neg_token_targ(input)?;

        let outcome = if self.inner_done {
            MechUpdate::Done(Vec::new())
        } else {
            let inner_token = targ.response_token.unwrap_or_default();
            self.selected_mut()?.update(&inner_token)?
        };

        match outcome {
            MechUpdate::MoreProcessing(token) => {
                let reply = generate_neg_token_targ(None, Some(token), None);

                Ok(MechUpdate::MoreProcessing(picky_asn1_der::to_vec(&reply)?))
            }
            MechUpdate::Done(token) => {
                self.inner_done = true;

                // Anti-downgrade: the client's MIC must verify before we
                // declare success, even though the mechanism itself did.
                self.check_peer_mic(targ.mech_list_mic)?;

                let mic = self.our_mic()?;
                let token = if token.is_empty() { None } else { Some(token) };
                let reply = generate_final_neg_token_targ(token, mic);
                self.state = SpnegoState::Done;

                Ok(MechUpdate::Done(picky_asn1_der::to_vec(&reply)?))
            }
        }
    }
}

impl Mechanism for Spnego {
    fn auth_type(&self) -> SecurityProvider {
        SecurityProvider::GssNegotiate
    }

    fn oid(&self) -> ObjectIdentifier {
        picky::oids::spnego()
    }

    fn magic(&self, token: &[u8]) -> bool {
        token.first() == Some(&SPNEGO_INIT_TAG)
    }

    #[instrument(level = "debug", fields(role = ?self.role, state = ?self.state), skip_all)]
    fn update(&mut self, input: &[u8]) -> Result<MechUpdate> {
        match (self.role, self.state) {
            (Role::Client, SpnegoState::Start) => self.client_start(),
            (Role::Client, SpnegoState::Targ) => self.client_targ(input),
            (Role::Server, SpnegoState::Start) => self.server_start(input),
            (Role::Server, SpnegoState::Targ) => self.server_targ(input),
            (_, SpnegoState::Fallback) if !self.inner_done => {
                let outcome = self.selected_mut()?.update(input)?;
                if outcome.is_done() {
                    self.inner_done = true;
                }

                Ok(outcome)
            }
            (role, state) => Err(Error::OutOfSequence(format!(
                "got an SPNEGO token as {:?} in state {:?}",
                role, state
            ))),
        }
    }

    fn is_established(&self) -> bool {
        self.inner_done
            && matches!(self.state, SpnegoState::Done | SpnegoState::Fallback)
            && self.selected.as_ref().is_some_and(|selected| selected.is_established())
    }

    fn session_key(&self) -> Result<Vec<u8>> {
        self.selected
            .as_ref()
            .ok_or_else(|| Error::OutOfSequence(String::from("no mechanism has been selected yet")))?
            .session_key()
    }

    fn signature_size(&self) -> usize {
        self.selected
            .as_ref()
            .map(|selected| selected.signature_size())
            .unwrap_or(crate::ntlmssp::SIGNATURE_SIZE)
    }

    fn supports_integrity(&self) -> bool {
        self.selected
            .as_ref()
            .map(|selected| selected.supports_integrity())
            .unwrap_or(false)
    }

    fn sign(&mut self, header: &[u8], data: &[u8], trailer: &[u8]) -> Result<Vec<u8>> {
        self.established_inner()?.sign(header, data, trailer)
    }

    fn verify(&mut self, header: &[u8], data: &[u8], trailer: &[u8], signature: &[u8]) -> Result<()> {
        self.established_inner()?.verify(header, data, trailer, signature)
    }

    fn seal(&mut self, header: &[u8], data: &mut [u8], trailer: &[u8]) -> Result<Vec<u8>> {
        self.established_inner()?.seal(header, data, trailer)
    }

    fn unseal(&mut self, header: &[u8], data: &mut [u8], trailer: &[u8], signature: &[u8]) -> Result<()> {
        self.established_inner()?.unseal(header, data, trailer, signature)
    }

    fn generate_mic(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.established_inner()?.generate_mic(data)
    }

    fn verify_mic(&mut self, data: &[u8], mic: &[u8]) -> Result<()> {
        self.established_inner()?.verify_mic(data, mic)
    }
}

impl Spnego {
    /// Packet protection is only available once negotiation reached a
    /// terminal state; anything earlier is a caller bug.
    fn established_inner(&mut self) -> Result<&mut Box<dyn Mechanism>> {
        if !matches!(self.state, SpnegoState::Done | SpnegoState::Fallback) {
            return Err(Error::OutOfSequence(String::from(
                "SPNEGO negotiation has not completed",
            )));
        }

        self.selected_mut()
    }
}
