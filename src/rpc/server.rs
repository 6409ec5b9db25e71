//! Server-side dispatch engine: one [ServerConnection] per transport
//! connection, driving the bind/alter/auth3/request state machine and
//! dispatching reassembled calls into registered interface implementations.
//!
//! The engine is sans-I/O: the surrounding server framework feeds it one
//! received fragment at a time through [ServerConnection::process_pdu] and
//! ships back whatever PDUs it returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use msrpc_pdu::bind::{
    provider_reason, AlterContextResponse, Bind, BindAck, BindNak, ContextElement, ContextResult, SyntaxId,
    BindTimeFeatureNegotiationBitmask, NDR_SYNTAX,
};
use msrpc_pdu::pdu::{
    fault_status, nak_reason, AuthenticationLevel, Fault, FaultFlags, PacketFlags, PacketType, Pdu, PduData,
    PduHeader, SecurityTrailer, set_frag_len,
};
use msrpc_pdu::request::{Request, Response, RESPONSE_FIXED_SIZE};
use msrpc_pdu::EncodeExt;

use crate::gensec::{GensecConfig, GensecRegistry, Role};
use crate::rpc::auth::{build_data_pdu, data_chunk_size, split_stub, unprotect_data_pdu, AuthContext};
use crate::{Error, Result};

/// Hard cap on the total bytes held for in-progress request reassembly on
/// one connection.
pub const MAX_TOTAL_REASSEMBLED_SIZE: usize = 15 * 1024 * 1024;

/// Fragment size this engine advertises and accepts.
pub const DEFAULT_MAX_FRAG: u16 = 5840;

/// Smallest fragment size a peer may propose.
const MIN_MAX_FRAG: u16 = 1024;

/// One registered interface implementation: the business dispatch behind a
/// bound presentation context. Stub bytes go in, stub bytes come out; NDR
/// marshalling happens inside the implementation.
pub trait InterfaceDispatch: Send + Sync {
    /// Called when a presentation context binds to this interface.
    fn bind(&self, _context_id: u16) -> Result<()> {
        Ok(())
    }

    /// Number of operations the interface implements; opnums at or above
    /// this fault with `nca_s_op_rng_error`.
    fn op_count(&self) -> u16;

    /// Executes one operation. An `Err` becomes a FAULT PDU carrying the
    /// returned status.
    fn call(&self, opnum: u16, stub: &[u8]) -> std::result::Result<Vec<u8>, u32>;
}

pub struct RegisteredInterface {
    pub uuid: Uuid,
    pub version: u16,
    pub version_minor: u16,
    pub name: &'static str,
    pub dispatch: Arc<dyn InterfaceDispatch>,
}

/// The interfaces reachable on one endpoint. Built at startup and shared by
/// every connection the endpoint accepts.
pub struct EndpointRegistry {
    endpoint: String,
    interfaces: Vec<RegisteredInterface>,
}

impl EndpointRegistry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            interfaces: Vec::new(),
        }
    }

    pub fn register_interface(&mut self, interface: RegisteredInterface) {
        info!(name = interface.name, uuid = %interface.uuid, version = interface.version, "registering interface");
        self.interfaces.push(interface);
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn find(&self, syntax: &SyntaxId) -> Option<&RegisteredInterface> {
        self.interfaces
            .iter()
            .find(|interface| interface.uuid == syntax.uuid && interface.version == syntax.version)
    }
}

/// Process-wide table of association groups: sets of presentation contexts
/// that share server-side state across connections. Entries are
/// reference-counted through [AssocGroupHandle].
#[derive(Debug, Default)]
pub struct AssocGroupTable {
    groups: Mutex<HashMap<u32, u32>>,
}

impl AssocGroupTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a fresh group with a randomized non-zero id.
    pub fn allocate(table: &Arc<Self>) -> AssocGroupHandle {
        let mut groups = table.groups.lock().expect("assoc group table poisoned");

        let id = loop {
            let candidate = OsRng.next_u32();
            if candidate != 0 && !groups.contains_key(&candidate) {
                break candidate;
            }
        };
        groups.insert(id, 1);

        AssocGroupHandle {
            id,
            table: Arc::clone(table),
        }
    }

    /// Joins an existing group, or returns `None` for an unknown id.
    pub fn join(table: &Arc<Self>, id: u32) -> Option<AssocGroupHandle> {
        let mut groups = table.groups.lock().expect("assoc group table poisoned");

        let refcount = groups.get_mut(&id)?;
        *refcount += 1;

        Some(AssocGroupHandle {
            id,
            table: Arc::clone(table),
        })
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: u32) -> bool {
        self.groups.lock().expect("assoc group table poisoned").contains_key(&id)
    }

    fn release(&self, id: u32) {
        let mut groups = self.groups.lock().expect("assoc group table poisoned");

        if let Some(refcount) = groups.get_mut(&id) {
            *refcount -= 1;
            if *refcount == 0 {
                groups.remove(&id);
            }
        }
    }
}

/// Shared-ownership handle onto one association group. The group lives
/// while any handle does.
#[derive(Debug)]
pub struct AssocGroupHandle {
    id: u32,
    table: Arc<AssocGroupTable>,
}

impl AssocGroupHandle {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Clone for AssocGroupHandle {
    fn clone(&self) -> Self {
        let mut groups = self.table.groups.lock().expect("assoc group table poisoned");
        if let Some(refcount) = groups.get_mut(&self.id) {
            *refcount += 1;
        }
        drop(groups);

        Self {
            id: self.id,
            table: Arc::clone(&self.table),
        }
    }
}

impl Drop for AssocGroupHandle {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

/// How a connection starts server-side security contexts: the mechanism
/// capability table plus the credentials it validates against.
pub struct ServerAuth {
    pub registry: Arc<GensecRegistry>,
    pub config: GensecConfig,
}

struct BoundContext {
    context_id: u16,
    dispatch: Arc<dyn InterfaceDispatch>,
}

struct IncomingCall {
    call_id: u32,
    context_id: u16,
    opnum: u16,
    stub: Vec<u8>,
}

/// One transport connection's server-side state machine.
pub struct ServerConnection {
    registry: Arc<EndpointRegistry>,
    assoc_table: Arc<AssocGroupTable>,
    auth_provider: Option<ServerAuth>,

    auth: Option<AuthContext>,
    allow_bind: bool,
    allow_alter: bool,
    allow_auth3: bool,
    pipe_bound: bool,
    /// Latched on a fatal protocol violation: every subsequent inbound PDU
    /// is answered with an `nca_s_proto_error` fault.
    incoming_fault: bool,

    conc_mpx: bool,
    enforce_assoc_group: bool,
    max_xmit_frag: u16,
    max_recv_frag: u16,
    assoc_group: Option<AssocGroupHandle>,
    contexts: Vec<BoundContext>,
    pending_calls: Vec<IncomingCall>,
}

impl ServerConnection {
    pub fn new(registry: Arc<EndpointRegistry>, assoc_table: Arc<AssocGroupTable>) -> Self {
        Self {
            registry,
            assoc_table,
            auth_provider: None,

            auth: None,
            allow_bind: true,
            allow_alter: false,
            allow_auth3: false,
            pipe_bound: false,
            incoming_fault: false,

            conc_mpx: false,
            enforce_assoc_group: true,
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group: None,
            contexts: Vec::new(),
            pending_calls: Vec::new(),
        }
    }

    pub fn with_auth_provider(mut self, provider: ServerAuth) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    /// Relaxes the association-group check on alter-context: a foreign
    /// group id is then ignored instead of rejected.
    pub fn allow_foreign_assoc_group(mut self) -> Self {
        self.enforce_assoc_group = false;
        self
    }

    /// The association group this connection joined, if bound.
    pub fn assoc_group(&self) -> Option<&AssocGroupHandle> {
        self.assoc_group.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.pipe_bound
    }

    /// Whether the connection has been moved into the terminal fault state.
    pub fn is_faulted(&self) -> bool {
        self.incoming_fault
    }

    /// Processes one received fragment and returns the PDUs to ship back.
    #[instrument(level = "debug", skip_all, fields(len = raw.len()))]
    pub fn process_pdu(&mut self, raw: &[u8]) -> Result<Vec<Vec<u8>>> {
        if self.incoming_fault {
            return Ok(vec![self.fault_pdu(
                call_id_hint(raw),
                0,
                fault_status::NCA_S_PROTO_ERROR,
                true,
            )?]);
        }

        match self.handle(raw) {
            Ok(replies) => Ok(replies),
            Err(err) => self.protocol_failure(raw, err),
        }
    }

    /// A connection-fatal violation: latch the fault state and answer. A
    /// connection that never completed a bind gets a BIND_NAK instead of a
    /// fault, since there is no call to fault.
    fn protocol_failure(&mut self, raw: &[u8], err: Error) -> Result<Vec<Vec<u8>>> {
        warn!(%err, "fatal protocol error, marking connection faulted");
        self.incoming_fault = true;

        if self.allow_bind {
            Ok(vec![bind_nak_pdu(call_id_hint(raw), nak_reason::REASON_NOT_SPECIFIED)?])
        } else {
            Ok(vec![self.fault_pdu(call_id_hint(raw), 0, err.fault_status(), true)?])
        }
    }

    fn handle(&mut self, raw: &[u8]) -> Result<Vec<Vec<u8>>> {
        let pdu = Pdu::decode_exact(raw)?;
        let header = pdu.header.clone();

        if header.packet_type.is_connectionless() {
            return Err(Error::Protocol(format!(
                "connectionless packet type {:?} on a connection-oriented transport",
                header.packet_type
            )));
        }

        if header.data_rep.byte_order != msrpc_pdu::pdu::IntegerRepresentation::LittleEndian {
            return Err(Error::Protocol(String::from(
                "big-endian data representation is not supported",
            )));
        }

        // The bind family is never fragmented: anything without both frag
        // flags set is a violation.
        if matches!(
            header.packet_type,
            PacketType::Bind | PacketType::AlterContext | PacketType::Auth3
        ) && !header
            .packet_flags
            .contains(PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag)
        {
            return Err(Error::Protocol(format!(
                "fragmented {:?} PDU",
                header.packet_type
            )));
        }

        match (header.packet_type, pdu.data) {
            (PacketType::Bind, PduData::Bind(bind)) => self.handle_bind(header, bind, pdu.security_trailer),
            (PacketType::AlterContext, PduData::AlterContext(alter)) => {
                self.handle_alter(header, alter.0, pdu.security_trailer)
            }
            (PacketType::Auth3, PduData::Auth3(_)) => self.handle_auth3(pdu.security_trailer),
            (PacketType::Request, PduData::Request(request)) => {
                self.handle_request(raw, header, request)
            }
            (PacketType::CoCancel | PacketType::Orphaned, _) => {
                // No async cancellation: accepted and dropped.
                debug!(packet_type = ?header.packet_type, call_id = header.call_id, "ignoring cancel-class PDU");
                Ok(Vec::new())
            }
            (packet_type, _) => Err(Error::Protocol(format!(
                "unexpected {:?} PDU on the server side",
                packet_type
            ))),
        }
    }

    fn handle_bind(
        &mut self,
        header: PduHeader,
        bind: Bind,
        trailer: Option<SecurityTrailer>,
    ) -> Result<Vec<Vec<u8>>> {
        if !self.allow_bind {
            return Err(Error::Protocol(String::from("BIND on an already-bound connection")));
        }

        if header.version != msrpc_pdu::pdu::RPC_VERSION_MAJOR || header.version_minor != msrpc_pdu::pdu::RPC_VERSION_MINOR {
            return self.reject_bind(nak_reason::PROTOCOL_VERSION_NOT_SUPPORTED);
        }

        if bind.max_xmit_frag < MIN_MAX_FRAG || bind.max_recv_frag < MIN_MAX_FRAG {
            return self.reject_bind(nak_reason::LOCAL_LIMIT_EXCEEDED);
        }

        if bind.contexts.is_empty() {
            return Err(Error::Protocol(String::from("BIND offers no presentation contexts")));
        }

        self.conc_mpx = header.packet_flags.contains(PacketFlags::PfcConcMpx);
        self.max_recv_frag = bind.max_xmit_frag.min(DEFAULT_MAX_FRAG);
        self.max_xmit_frag = bind.max_recv_frag.min(DEFAULT_MAX_FRAG);

        // Security negotiation, leg one.
        let mut reply_token = None;
        if let Some(trailer) = trailer {
            if self.auth_provider.is_none() {
                return self.reject_bind(nak_reason::AUTH_TYPE_NOT_RECOGNIZED);
            }
            if !matches!(
                trailer.level,
                AuthenticationLevel::Connect | AuthenticationLevel::PktIntegrity | AuthenticationLevel::PktPrivacy
            ) {
                return self.reject_bind(nak_reason::AUTH_TYPE_NOT_RECOGNIZED);
            }

            let provider = self.auth_provider.as_ref().expect("checked above");
            let mech = match provider.registry.start(trailer.security_type, Role::Server, &provider.config) {
                Ok(mech) => mech,
                Err(err) => {
                    warn!(%err, "cannot start the requested security mechanism");
                    return self.reject_bind(nak_reason::AUTH_TYPE_NOT_RECOGNIZED);
                }
            };

            let mut auth = AuthContext {
                security_type: trailer.security_type,
                level: trailer.level,
                context_id: trailer.context_id,
                sign_header: header.packet_flags.contains(PacketFlags::PfcSupportHeaderSign),
                mech,
            };

            let outcome = match auth.mech.update(&trailer.auth_value) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(%err, "security mechanism rejected the bind token");
                    return self.reject_bind(nak_reason::INVALID_CHECKSUM);
                }
            };

            let token = outcome.token().to_vec();
            if !token.is_empty() {
                reply_token = Some(auth.token_trailer(token));
            }

            self.auth = Some(auth);
        }

        // Association group: allocate a fresh one or join by id.
        self.assoc_group = match bind.assoc_group {
            0 => Some(AssocGroupTable::allocate(&self.assoc_table)),
            id => match AssocGroupTable::join(&self.assoc_table, id) {
                Some(handle) => Some(handle),
                None => return self.reject_bind(nak_reason::REASON_NOT_SPECIFIED),
            },
        };

        let results = self.process_contexts(&bind.contexts)?;

        self.allow_bind = false;
        self.allow_alter = true;
        self.pipe_bound = match self.auth.as_ref() {
            None => true,
            Some(auth) if auth.is_established() => true,
            Some(_) => {
                self.allow_auth3 = true;
                false
            }
        };

        let ack = BindAck {
            max_xmit_frag: self.max_xmit_frag,
            max_recv_frag: self.max_recv_frag,
            assoc_group: self.assoc_group.as_ref().map(AssocGroupHandle::id).unwrap_or(0),
            sec_addr: self.registry.endpoint.clone(),
            results,
        };

        let mut flags = PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag;
        if self.conc_mpx {
            flags |= PacketFlags::PfcConcMpx;
        }
        if self.auth.as_ref().is_some_and(|auth| auth.sign_header) {
            flags |= PacketFlags::PfcSupportHeaderSign;
        }

        Ok(vec![control_pdu(
            PacketType::BindAck,
            flags,
            header.call_id,
            PduData::BindAck(ack),
            reply_token,
        )?])
    }

    fn handle_alter(
        &mut self,
        header: PduHeader,
        alter: Bind,
        trailer: Option<SecurityTrailer>,
    ) -> Result<Vec<Vec<u8>>> {
        if !self.allow_alter {
            return Err(Error::Protocol(String::from("ALTER_CONTEXT before a successful BIND")));
        }

        // Continuation legs of the security negotiation ride on
        // alter-context. The negotiated triple is frozen: any deviation is
        // rejected rather than renegotiated.
        let mut reply_token = None;
        if let Some(trailer) = trailer {
            let mut auth = self.auth.take().ok_or_else(|| {
                Error::Protocol(String::from("auth trailer on an unauthenticated connection"))
            })?;

            if (trailer.security_type, trailer.level, trailer.context_id)
                != (auth.security_type, auth.level, auth.context_id)
            {
                warn!("alter-context attempted to change the negotiated security triple");
                return self.reject_bind(nak_reason::AUTH_TYPE_NOT_RECOGNIZED);
            }

            if auth.is_established() {
                warn!("alter-context attempted to renegotiate a completed security context");
                return self.reject_bind(nak_reason::AUTH_TYPE_NOT_RECOGNIZED);
            }

            let outcome = match auth.mech.update(&trailer.auth_value) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(%err, "security mechanism rejected the alter-context token");
                    return self.reject_bind(nak_reason::INVALID_CHECKSUM);
                }
            };

            if auth.is_established() {
                self.pipe_bound = true;
                self.allow_auth3 = false;
            }

            let token = outcome.token().to_vec();
            if !token.is_empty() {
                reply_token = Some(auth.token_trailer(token));
            }

            self.auth = Some(auth);
        }

        // A new context may only join the association group this connection
        // already belongs to.
        if self.enforce_assoc_group && alter.assoc_group != 0 {
            let ours = self.assoc_group.as_ref().map(AssocGroupHandle::id);
            if ours != Some(alter.assoc_group) {
                warn!(offered = alter.assoc_group, "alter-context offered a foreign association group");
                return self.reject_bind(nak_reason::REASON_NOT_SPECIFIED);
            }
        }

        let results = self.process_contexts(&alter.contexts)?;

        let ack = BindAck {
            max_xmit_frag: self.max_xmit_frag,
            max_recv_frag: self.max_recv_frag,
            assoc_group: self.assoc_group.as_ref().map(AssocGroupHandle::id).unwrap_or(0),
            sec_addr: String::new(),
            results,
        };

        Ok(vec![control_pdu(
            PacketType::AlterContextResponse,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            header.call_id,
            PduData::AlterContextResponse(AlterContextResponse(ack)),
            reply_token,
        )?])
    }

    fn handle_auth3(&mut self, trailer: Option<SecurityTrailer>) -> Result<Vec<Vec<u8>>> {
        if !self.allow_auth3 {
            return Err(Error::Protocol(String::from("unexpected AUTH3")));
        }

        let trailer = trailer.ok_or_else(|| Error::Protocol(String::from("AUTH3 without an auth trailer")))?;
        let mut auth = self
            .auth
            .take()
            .ok_or_else(|| Error::Protocol(String::from("AUTH3 on an unauthenticated connection")))?;

        if (trailer.security_type, trailer.level, trailer.context_id)
            != (auth.security_type, auth.level, auth.context_id)
        {
            return self.reject_bind(nak_reason::AUTH_TYPE_NOT_RECOGNIZED);
        }

        let update = auth.mech.update(&trailer.auth_value);
        let established = auth.is_established();
        self.auth = Some(auth);

        match update {
            Ok(_) if established => {
                self.pipe_bound = true;
                self.allow_auth3 = false;

                // AUTH3 is never answered on success.
                Ok(Vec::new())
            }
            Ok(_) => Err(Error::Protocol(String::from(
                "AUTH3 did not complete the security exchange",
            ))),
            Err(err) => {
                warn!(%err, "AUTH3 verification failed");
                self.reject_bind(nak_reason::INVALID_CHECKSUM)
            }
        }
    }

    fn handle_request(&mut self, raw: &[u8], header: PduHeader, request: Request) -> Result<Vec<Vec<u8>>> {
        if !self.pipe_bound {
            return Err(Error::Protocol(String::from("REQUEST before the connection is bound")));
        }

        let call_id = header.call_id;
        let first = header.packet_flags.contains(PacketFlags::PfcFirstFrag);
        let last = header.packet_flags.contains(PacketFlags::PfcLastFrag);
        let existing = self.pending_calls.iter().position(|call| call.call_id == call_id);

        match (first, existing) {
            (true, Some(_)) => {
                return Err(Error::Protocol(format!(
                    "first fragment for call {} which is already being reassembled",
                    call_id
                )))
            }
            (false, None) => {
                return Err(Error::Protocol(format!(
                    "continuation fragment for unknown call {}",
                    call_id
                )))
            }
            _ => {}
        }

        if first && !self.conc_mpx && !self.pending_calls.is_empty() {
            return Err(Error::Protocol(String::from(
                "interleaved calls without concurrent multiplexing",
            )));
        }

        // Every fragment is independently protected.
        let stub = match self.auth.as_mut().filter(|auth| auth.protects_packets()) {
            Some(auth) => match unprotect_data_pdu(raw, &header, request.header_size(), auth) {
                Ok(stub) => stub,
                Err(err @ Error::AccessDenied(_)) => {
                    // Call-fatal only: drop the call, keep the connection.
                    warn!(%err, call_id, "request failed packet verification");
                    if let Some(index) = existing {
                        self.pending_calls.remove(index);
                    }

                    return Ok(vec![self.fault_pdu(
                        call_id,
                        request.context_id,
                        fault_status::ACCESS_DENIED,
                        true,
                    )?]);
                }
                Err(err) => return Err(err),
            },
            None => {
                if header.auth_len != 0 {
                    return Err(Error::Protocol(String::from(
                        "auth trailer on an unauthenticated connection",
                    )));
                }

                request.stub_data.clone()
            }
        };

        if first {
            if !self.contexts.iter().any(|context| context.context_id == request.context_id) {
                return Ok(vec![self.fault_pdu(
                    call_id,
                    request.context_id,
                    fault_status::NCA_S_UNKNOWN_IF,
                    true,
                )?]);
            }

            self.pending_calls.push(IncomingCall {
                call_id,
                context_id: request.context_id,
                opnum: request.opnum,
                stub,
            });
        } else {
            let call = &mut self.pending_calls[existing.expect("checked above")];
            if call.context_id != request.context_id {
                return Err(Error::Protocol(String::from(
                    "fragment changed the presentation context mid-call",
                )));
            }

            call.stub.extend_from_slice(&stub);
        }

        let total: usize = self.pending_calls.iter().map(|call| call.stub.len()).sum();
        if total > MAX_TOTAL_REASSEMBLED_SIZE {
            return Err(Error::Protocol(format!(
                "request reassembly exceeds the {} byte cap",
                MAX_TOTAL_REASSEMBLED_SIZE
            )));
        }

        if !last {
            return Ok(Vec::new());
        }

        let index = self
            .pending_calls
            .iter()
            .position(|call| call.call_id == call_id)
            .expect("the call was just inserted or found");
        let call = self.pending_calls.remove(index);

        self.dispatch_call(call)
    }

    fn dispatch_call(&mut self, call: IncomingCall) -> Result<Vec<Vec<u8>>> {
        let context = self
            .contexts
            .iter()
            .find(|context| context.context_id == call.context_id)
            .expect("checked on the first fragment");
        let dispatch = Arc::clone(&context.dispatch);

        if call.opnum >= dispatch.op_count() {
            return Ok(vec![self.fault_pdu(
                call.call_id,
                call.context_id,
                fault_status::NCA_S_OP_RNG_ERROR,
                true,
            )?]);
        }

        debug!(call_id = call.call_id, opnum = call.opnum, stub_len = call.stub.len(), "dispatching call");

        let reply_stub = match dispatch.call(call.opnum, &call.stub) {
            Ok(reply_stub) => reply_stub,
            Err(status) => {
                // A dispatch failure faults this call without affecting the
                // connection.
                return Ok(vec![self.fault_pdu(call.call_id, call.context_id, status, false)?]);
            }
        };

        self.build_response(call.call_id, call.context_id, &reply_stub)
    }

    /// Chunks one reply stub into RESPONSE PDUs, each signed and sealed
    /// per the connection's auth level.
    fn build_response(&mut self, call_id: u32, context_id: u16, stub: &[u8]) -> Result<Vec<Vec<u8>>> {
        let auth = self.auth.as_mut().filter(|auth| auth.protects_packets());
        let chunk_size = data_chunk_size(self.max_xmit_frag, RESPONSE_FIXED_SIZE, auth.as_deref())?;

        let mut replies = Vec::new();
        let mut remaining = stub.len();
        let mut auth = auth;

        for (first, last, chunk) in split_stub(stub, chunk_size) {
            let mut flags = PacketFlags::None;
            if first {
                flags |= PacketFlags::PfcFirstFrag;
            }
            if last {
                flags |= PacketFlags::PfcLastFrag;
            }

            let body_header = Response {
                alloc_hint: remaining.try_into()?,
                context_id,
                cancel_count: 0,
                stub_data: Vec::new(),
            }
            .encode_to_vec()?;

            replies.push(build_data_pdu(
                PacketType::Response,
                flags,
                call_id,
                &body_header,
                chunk,
                auth.as_deref_mut(),
            )?);

            remaining -= chunk.len();
        }

        Ok(replies)
    }

    /// Computes the result for each offered presentation context, binding
    /// the accepted ones.
    fn process_contexts(&mut self, offered: &[ContextElement]) -> Result<Vec<ContextResult>> {
        offered
            .iter()
            .map(|context| {
                let result = self.context_result(context)?;
                debug!(
                    context_id = context.context_id,
                    abstract_syntax = %context.abstract_syntax.uuid,
                    result = ?result.result,
                    reason = result.reason,
                    "presentation context negotiated"
                );

                Ok(result)
            })
            .collect()
    }

    fn context_result(&mut self, context: &ContextElement) -> Result<ContextResult> {
        // Bind-time feature negotiation rides on a pseudo transfer syntax.
        if context
            .transfer_syntaxes
            .iter()
            .all(|syntax| syntax.is_bind_time_features())
            && !context.transfer_syntaxes.is_empty()
        {
            return Ok(ContextResult {
                result: msrpc_pdu::bind::ContextResultCode::NegotiateAck,
                reason: BindTimeFeatureNegotiationBitmask::KeepConnectionOnOrphanSupported as u16,
                syntax: Uuid::nil(),
                syntax_version: 0,
            });
        }

        let Some(interface) = self.registry.find(&context.abstract_syntax) else {
            // Unknown interface: a well-formed rejection, not a NAK.
            return Ok(ContextResult::provider_rejection(
                provider_reason::ABSTRACT_SYNTAX_NOT_SUPPORTED,
            ));
        };

        if !context.transfer_syntaxes.iter().any(|syntax| *syntax == NDR_SYNTAX) {
            return Ok(ContextResult::provider_rejection(
                provider_reason::PROPOSED_TRANSFER_SYNTAXES_NOT_SUPPORTED,
            ));
        }

        if self.contexts.iter().any(|bound| bound.context_id == context.context_id) {
            return Ok(ContextResult::provider_rejection(provider_reason::REASON_NOT_SPECIFIED));
        }

        if let Err(err) = interface.dispatch.bind(context.context_id) {
            warn!(%err, interface = interface.name, "interface bind hook rejected the context");
            return Ok(ContextResult::provider_rejection(provider_reason::LOCAL_LIMIT_EXCEEDED));
        }

        self.contexts.push(BoundContext {
            context_id: context.context_id,
            dispatch: Arc::clone(&interface.dispatch),
        });

        Ok(ContextResult::acceptance(&NDR_SYNTAX))
    }

    /// Rejects the connection's bind handshake and latches the fault state.
    fn reject_bind(&mut self, reason: u16) -> Result<Vec<Vec<u8>>> {
        self.incoming_fault = true;

        Ok(vec![bind_nak_pdu(0, reason)?])
    }

    fn fault_pdu(&self, call_id: u32, context_id: u16, status: u32, did_not_execute: bool) -> Result<Vec<u8>> {
        let mut flags = PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag;
        if did_not_execute {
            flags |= PacketFlags::PfcDidNotExecute;
        }

        control_pdu(
            PacketType::Fault,
            flags,
            call_id,
            PduData::Fault(Fault {
                alloc_hint: 0,
                context_id,
                cancel_count: 0,
                flags: FaultFlags::None,
                status,
                stub_data: Vec::new(),
            }),
            None,
        )
    }
}

fn call_id_hint(raw: &[u8]) -> u32 {
    raw.get(12..16)
        .map(|bytes| u32::from_le_bytes(bytes.try_into().expect("slice length is four")))
        .unwrap_or(0)
}

fn bind_nak_pdu(call_id: u32, reason: u16) -> Result<Vec<u8>> {
    control_pdu(
        PacketType::BindNak,
        PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
        call_id,
        PduData::BindNak(BindNak::new(reason)),
        None,
    )
}

/// Serializes a control PDU (bind family, fault) and patches its length
/// fields.
pub(crate) fn control_pdu(
    packet_type: PacketType,
    packet_flags: PacketFlags,
    call_id: u32,
    data: PduData,
    security_trailer: Option<SecurityTrailer>,
) -> Result<Vec<u8>> {
    let auth_len = security_trailer
        .as_ref()
        .map(|trailer| trailer.auth_value.len())
        .unwrap_or(0);

    let pdu = Pdu {
        header: PduHeader::new(packet_type, packet_flags, auth_len.try_into()?, call_id),
        data,
        security_trailer,
    };

    let mut encoded = pdu.encode_to_vec()?;
    let frag_len = encoded.len().try_into()?;
    set_frag_len(&mut encoded, frag_len)?;

    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use msrpc_pdu::Decode;

    struct Echo;

    impl InterfaceDispatch for Echo {
        fn op_count(&self) -> u16 {
            1
        }

        fn call(&self, _opnum: u16, stub: &[u8]) -> std::result::Result<Vec<u8>, u32> {
            Ok(stub.to_vec())
        }
    }

    fn registry() -> Arc<EndpointRegistry> {
        let mut registry = EndpointRegistry::new("135");
        registry.register_interface(RegisteredInterface {
            uuid: Uuid::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10),
            version: 1,
            version_minor: 0,
            name: "echo",
            dispatch: Arc::new(Echo),
        });

        Arc::new(registry)
    }

    fn bind_pdu(assoc_group: u32, contexts: Vec<ContextElement>) -> Vec<u8> {
        control_pdu(
            PacketType::Bind,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            1,
            PduData::Bind(Bind {
                max_xmit_frag: DEFAULT_MAX_FRAG,
                max_recv_frag: DEFAULT_MAX_FRAG,
                assoc_group,
                contexts,
            }),
            None,
        )
        .unwrap()
    }

    fn echo_context(context_id: u16) -> ContextElement {
        ContextElement {
            context_id,
            abstract_syntax: SyntaxId {
                uuid: Uuid::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10),
                version: 1,
                version_minor: 0,
            },
            transfer_syntaxes: vec![NDR_SYNTAX],
        }
    }

    #[test]
    fn assoc_groups_are_reference_counted() {
        let table = AssocGroupTable::new();

        let first = AssocGroupTable::allocate(&table);
        let id = first.id();
        assert!(table.contains(id));

        let second = AssocGroupTable::join(&table, id).unwrap();
        drop(first);
        assert!(table.contains(id));

        drop(second);
        assert!(!table.contains(id));
    }

    #[test]
    fn joining_an_unknown_group_fails() {
        let table = AssocGroupTable::new();

        assert!(AssocGroupTable::join(&table, 0xdead_beef).is_none());
    }

    #[test]
    fn assoc_group_ids_are_never_zero() {
        let table = AssocGroupTable::new();

        for _ in 0..32 {
            assert_ne!(AssocGroupTable::allocate(&table).id(), 0);
        }
    }

    #[test]
    fn connection_drop_releases_the_assoc_group() {
        let table = AssocGroupTable::new();
        let mut connection = ServerConnection::new(registry(), Arc::clone(&table));

        let replies = connection.process_pdu(&bind_pdu(0, vec![echo_context(0)])).unwrap();
        assert_eq!(replies.len(), 1);

        let id = connection.assoc_group().unwrap().id();
        assert!(table.contains(id));

        drop(connection);
        assert!(!table.contains(id));
    }

    #[test]
    fn bind_time_feature_context_gets_a_negotiate_ack() {
        let mut connection = ServerConnection::new(registry(), AssocGroupTable::new());

        let feature_syntax = SyntaxId {
            uuid: Uuid::from_slice_le(&[
                0x2c, 0x1c, 0xb7, 0x6c, 0x12, 0x98, 0x40, 0x45, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ])
            .unwrap(),
            version: 1,
            version_minor: 0,
        };
        let feature_context = ContextElement {
            context_id: 1,
            abstract_syntax: echo_context(0).abstract_syntax,
            transfer_syntaxes: vec![feature_syntax],
        };

        let replies = connection
            .process_pdu(&bind_pdu(0, vec![echo_context(0), feature_context]))
            .unwrap();

        let pdu = Pdu::decode(&replies[0] as &[u8]).unwrap();
        let PduData::BindAck(ack) = pdu.data else {
            panic!("expected a BIND_ACK");
        };

        assert_eq!(ack.results.len(), 2);
        assert_eq!(ack.results[0].result, msrpc_pdu::bind::ContextResultCode::Acceptance);
        assert_eq!(ack.results[1].result, msrpc_pdu::bind::ContextResultCode::NegotiateAck);
    }

    #[test]
    fn fragmented_bind_is_a_fatal_protocol_error() {
        let mut connection = ServerConnection::new(registry(), AssocGroupTable::new());

        let raw = control_pdu(
            PacketType::Bind,
            PacketFlags::PfcFirstFrag,
            1,
            PduData::Bind(Bind {
                max_xmit_frag: DEFAULT_MAX_FRAG,
                max_recv_frag: DEFAULT_MAX_FRAG,
                assoc_group: 0,
                contexts: vec![echo_context(0)],
            }),
            None,
        )
        .unwrap();

        let replies = connection.process_pdu(&raw).unwrap();
        let pdu = Pdu::decode(&replies[0] as &[u8]).unwrap();
        assert_eq!(pdu.header.packet_type, PacketType::BindNak);
        assert!(connection.is_faulted());
    }

    #[test]
    fn request_before_bind_latches_the_fault_state() {
        let mut connection = ServerConnection::new(registry(), AssocGroupTable::new());

        let request = build_data_pdu(
            PacketType::Request,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            9,
            &Request {
                alloc_hint: 0,
                context_id: 0,
                opnum: 0,
                obj: None,
                stub_data: Vec::new(),
            }
            .encode_to_vec()
            .unwrap(),
            &[],
            None,
        )
        .unwrap();

        // The connection never bound: the violation is answered with a NAK
        // and the connection is latched faulted.
        let replies = connection.process_pdu(&request).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(connection.is_faulted());

        let replies = connection.process_pdu(&request).unwrap();
        let pdu = Pdu::decode(&replies[0] as &[u8]).unwrap();
        let PduData::Fault(fault) = pdu.data else {
            panic!("expected a fault");
        };
        assert_eq!(fault.status, fault_status::NCA_S_PROTO_ERROR);
    }
}
