//! Client-side connection engine: one [RpcClient] per transport connection,
//! owning the call-id allocator, the bind/alter-context/auth3 handshake,
//! outbound fragmentation, and inbound reassembly of responses.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use msrpc_pdu::bind::{AlterContext, Auth3, Bind, BindAck, ContextElement, ContextResultCode, SyntaxId, NDR_SYNTAX};
use msrpc_pdu::pdu::{
    AuthenticationLevel, PacketFlags, PacketType, Pdu, PduData, PduHeader, SecurityProvider,
};
use msrpc_pdu::request::{Response, REQUEST_FIXED_SIZE, RESPONSE_FIXED_SIZE};
use msrpc_pdu::{Decode, EncodeExt};

use crate::gensec::{GensecConfig, GensecRegistry, MechUpdate, Role};
use crate::rpc::auth::{build_data_pdu, data_chunk_size, split_stub, unprotect_data_pdu, AuthContext};
use crate::rpc::server::control_pdu;
use crate::rpc::transport::Transport;
use crate::{Error, Result};

/// Fragment sizes this client proposes on bind.
pub const DEFAULT_MAX_FRAG: u16 = 5840;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    /// Ask the server for concurrent multiplexing: more than one call in
    /// flight per connection.
    pub request_conc_mpx: bool,
    /// Read timeout applied to the transport; an expired timeout on a
    /// regular call tears the connection down.
    pub default_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            request_conc_mpx: false,
            default_timeout: None,
        }
    }
}

/// Security settings for an authenticated connection.
pub struct ClientAuth {
    pub registry: Arc<GensecRegistry>,
    pub security_type: SecurityProvider,
    pub level: AuthenticationLevel,
    pub config: GensecConfig,
}

struct QueuedRequest {
    call_id: u32,
    context_id: u16,
    opnum: u16,
    obj: Option<Uuid>,
    stub: Vec<u8>,
}

struct PendingRequest {
    reply: Vec<u8>,
    fault: Option<u32>,
    received_first: bool,
    done: bool,
}

/// One connection to an RPC endpoint.
pub struct RpcClient<T: Transport> {
    transport: T,
    config: ClientConfig,

    call_id_counter: u32,
    next_context_id: u16,
    max_xmit_frag: u16,
    max_recv_frag: u16,
    assoc_group: u32,
    conc_mpx: bool,
    bound: bool,
    dead: bool,
    /// Fault status of the last call that faulted, kept for diagnostics the
    /// way the pipe stashes `NET_WRITE_FAULT`.
    last_fault: Option<u32>,

    auth: Option<AuthContext>,

    queued: VecDeque<QueuedRequest>,
    pending: BTreeMap<u32, PendingRequest>,
}

impl<T: Transport> RpcClient<T> {
    pub fn new(transport: T) -> Result<Self> {
        Self::with_config(transport, ClientConfig::default(), None)
    }

    pub fn with_auth(transport: T, auth: ClientAuth) -> Result<Self> {
        Self::with_config(transport, ClientConfig::default(), Some(auth))
    }

    pub fn with_config(mut transport: T, config: ClientConfig, auth: Option<ClientAuth>) -> Result<Self> {
        transport.set_read_timeout(config.default_timeout)?;

        let auth = match auth {
            Some(auth) => Some(AuthContext {
                security_type: auth.security_type,
                level: auth.level,
                context_id: 0,
                sign_header: true,
                mech: auth.registry.start(auth.security_type, Role::Client, &auth.config)?,
            }),
            None => None,
        };

        Ok(Self {
            transport,
            config,

            call_id_counter: 0,
            next_context_id: 0,
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group: 0,
            conc_mpx: false,
            bound: false,
            dead: false,
            last_fault: None,

            auth,

            queued: VecDeque::new(),
            pending: BTreeMap::new(),
        })
    }

    /// The association group id granted by the server.
    pub fn assoc_group(&self) -> u32 {
        self.assoc_group
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Fault status of the most recent faulted call.
    pub fn last_fault(&self) -> Option<u32> {
        self.last_fault
    }

    /// Allocates the next call id: monotonically increasing, wrapping,
    /// never zero.
    fn next_call_id(&mut self) -> u32 {
        self.call_id_counter = self.call_id_counter.wrapping_add(1);
        if self.call_id_counter == 0 {
            self.call_id_counter = 1;
        }

        self.call_id_counter
    }

    /// Binds the connection to one interface, driving the full security
    /// handshake when the connection is authenticated. Returns the
    /// presentation context id.
    #[instrument(level = "debug", skip_all, fields(interface = %interface.uuid))]
    pub fn bind(&mut self, interface: &SyntaxId) -> Result<u16> {
        if self.bound {
            return Err(Error::OutOfSequence(String::from("the connection is already bound")));
        }
        self.check_alive()?;

        let context_id = self.next_context_id;
        self.next_context_id += 1;

        let contexts = vec![ContextElement {
            context_id,
            abstract_syntax: *interface,
            transfer_syntaxes: vec![NDR_SYNTAX],
        }];

        let call_id = self.next_call_id();

        let mut flags = PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag;
        if self.config.request_conc_mpx {
            flags |= PacketFlags::PfcConcMpx;
        }

        let mut trailer = None;
        if self.auth.is_some() {
            let outcome = {
                let auth = self.auth.as_mut().expect("checked above");
                auth.mech.update(&[])?
            };

            let auth = self.auth.as_ref().expect("checked above");
            if auth.sign_header {
                flags |= PacketFlags::PfcSupportHeaderSign;
            }
            trailer = Some(auth.token_trailer(outcome.token().to_vec()));
        }

        let bind = Bind {
            max_xmit_frag: self.config.max_xmit_frag,
            max_recv_frag: self.config.max_recv_frag,
            assoc_group: 0,
            contexts,
        };

        let pdu = control_pdu(PacketType::Bind, flags, call_id, PduData::Bind(bind), trailer)?;
        self.transport.send(&pdu)?;

        let reply = self.recv_control()?;
        let granted_mpx = reply.header.packet_flags.contains(PacketFlags::PfcConcMpx);

        let (ack, server_token) = match reply.data {
            PduData::BindAck(ack) => (ack, reply.security_trailer.map(|trailer| trailer.auth_value)),
            PduData::BindNak(nak) => {
                return Err(Error::BindRejected { reason: nak.reason });
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "expected BIND_ACK, got {:?}",
                    reply.header.packet_type
                )))
            }
        };

        self.accept_bind_ack(&ack)?;
        self.conc_mpx = self.config.request_conc_mpx && granted_mpx;

        if self.auth.is_some() {
            self.drive_auth_legs(server_token)?;
        }

        self.bound = true;

        debug!(assoc_group = self.assoc_group, context_id, "bound");

        Ok(context_id)
    }

    /// Validates a BIND_ACK/ALTER_CONTEXT_RESP result list: the offered
    /// context must have been accepted.
    fn check_bind_response(ack: &BindAck) -> Result<()> {
        let result = ack
            .results
            .first()
            .ok_or_else(|| Error::Protocol(String::from("bind ack carries no context results")))?;

        if result.result != ContextResultCode::Acceptance {
            return Err(Error::ContextRejected {
                result: result.result.as_u16(),
                reason: result.reason,
            });
        }

        Ok(())
    }

    fn accept_bind_ack(&mut self, ack: &BindAck) -> Result<()> {
        Self::check_bind_response(ack)?;

        // The server's receive limit caps our outbound fragments, and vice
        // versa.
        self.max_xmit_frag = self.config.max_xmit_frag.min(ack.max_recv_frag);
        self.max_recv_frag = self.config.max_recv_frag.min(ack.max_xmit_frag);
        self.assoc_group = ack.assoc_group;

        Ok(())
    }

    /// Runs the remaining legs of the security handshake: ALTER_CONTEXT for
    /// mechanisms that keep talking (SPNEGO), AUTH3 for the classic
    /// three-leg finish (raw NTLMSSP).
    fn drive_auth_legs(&mut self, mut server_token: Option<Vec<u8>>) -> Result<()> {
        loop {
            let established = self
                .auth
                .as_ref()
                .map(|auth| auth.is_established())
                .unwrap_or(true);
            if established && server_token.is_none() {
                return Ok(());
            }

            let input = server_token.take().unwrap_or_default();
            let outcome = {
                let auth = self
                    .auth
                    .as_mut()
                    .ok_or_else(|| Error::OutOfSequence(String::from("no security context to drive")))?;
                auth.mech.update(&input)?
            };

            match outcome {
                MechUpdate::Done(token) if token.is_empty() => return Ok(()),
                MechUpdate::Done(token) => {
                    // The final token needs no answer: deliver it in AUTH3.
                    let call_id = self.next_call_id();
                    let (trailer, flags) = self.auth_reply(token);

                    let pdu = control_pdu(PacketType::Auth3, flags, call_id, PduData::Auth3(Auth3), Some(trailer))?;
                    self.transport.send(&pdu)?;

                    return Ok(());
                }
                MechUpdate::MoreProcessing(token) => {
                    let call_id = self.next_call_id();
                    let (trailer, flags) = self.auth_reply(token);

                    let alter = AlterContext(Bind {
                        max_xmit_frag: self.config.max_xmit_frag,
                        max_recv_frag: self.config.max_recv_frag,
                        assoc_group: self.assoc_group,
                        contexts: Vec::new(),
                    });

                    let pdu = control_pdu(
                        PacketType::AlterContext,
                        flags,
                        call_id,
                        PduData::AlterContext(alter),
                        Some(trailer),
                    )?;
                    self.transport.send(&pdu)?;

                    let reply = self.recv_control()?;
                    server_token = match reply.data {
                        PduData::AlterContextResponse(_) => {
                            reply.security_trailer.map(|trailer| trailer.auth_value)
                        }
                        PduData::BindNak(nak) => return Err(Error::BindRejected { reason: nak.reason }),
                        PduData::Fault(fault) => return Err(Error::Fault { status: fault.status }),
                        _ => {
                            return Err(Error::Protocol(format!(
                                "expected ALTER_CONTEXT_RESP, got {:?}",
                                reply.header.packet_type
                            )))
                        }
                    };
                }
            }
        }
    }

    fn auth_reply(&self, token: Vec<u8>) -> (msrpc_pdu::pdu::SecurityTrailer, PacketFlags) {
        let auth = self.auth.as_ref().expect("caller checked the auth state");

        let mut flags = PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag;
        if auth.sign_header {
            flags |= PacketFlags::PfcSupportHeaderSign;
        }

        (auth.token_trailer(token), flags)
    }

    /// Adds one more presentation context to a bound connection.
    #[instrument(level = "debug", skip_all, fields(interface = %interface.uuid))]
    pub fn alter_context(&mut self, interface: &SyntaxId) -> Result<u16> {
        if !self.bound {
            return Err(Error::OutOfSequence(String::from("the connection is not bound yet")));
        }
        self.check_alive()?;

        let context_id = self.next_context_id;
        self.next_context_id += 1;

        let call_id = self.next_call_id();
        let alter = AlterContext(Bind {
            max_xmit_frag: self.config.max_xmit_frag,
            max_recv_frag: self.config.max_recv_frag,
            assoc_group: self.assoc_group,
            contexts: vec![ContextElement {
                context_id,
                abstract_syntax: *interface,
                transfer_syntaxes: vec![NDR_SYNTAX],
            }],
        });

        let pdu = control_pdu(
            PacketType::AlterContext,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            call_id,
            PduData::AlterContext(alter),
            None,
        )?;
        self.transport.send(&pdu)?;

        let reply = self.recv_control()?;
        match reply.data {
            PduData::AlterContextResponse(response) => {
                Self::check_bind_response(&response.0)?;

                Ok(context_id)
            }
            PduData::BindNak(nak) => Err(Error::BindRejected { reason: nak.reason }),
            PduData::Fault(fault) => Err(Error::Fault { status: fault.status }),
            _ => Err(Error::Protocol(format!(
                "expected ALTER_CONTEXT_RESP, got {:?}",
                reply.header.packet_type
            ))),
        }
    }

    /// Issues one call and blocks until its reply is fully reassembled.
    pub fn request(&mut self, context_id: u16, opnum: u16, stub: &[u8]) -> Result<Vec<u8>> {
        self.request_with_object(context_id, opnum, None, stub)
    }

    #[instrument(level = "debug", skip_all, fields(context_id, opnum, stub_len = stub.len()))]
    pub fn request_with_object(
        &mut self,
        context_id: u16,
        opnum: u16,
        obj: Option<Uuid>,
        stub: &[u8],
    ) -> Result<Vec<u8>> {
        if !self.bound {
            return Err(Error::OutOfSequence(String::from("the connection is not bound yet")));
        }
        self.check_alive()?;

        let call_id = self.next_call_id();
        self.queued.push_back(QueuedRequest {
            call_id,
            context_id,
            opnum,
            obj,
            stub: stub.to_vec(),
        });

        self.drive(call_id)
    }

    fn check_alive(&self) -> Result<()> {
        if self.dead {
            return Err(Error::Disconnected);
        }

        Ok(())
    }

    /// Pumps the connection until the target call completes.
    fn drive(&mut self, target: u32) -> Result<Vec<u8>> {
        loop {
            self.ship_queued()?;

            if self.pending.get(&target).map(|pending| pending.done).unwrap_or(false) {
                break;
            }

            let raw = match self.transport.recv_pdu() {
                Ok(raw) => raw,
                Err(Error::Timeout) => {
                    // The wire has no reliable mid-stream cancel, so an
                    // expired call poisons the whole connection.
                    self.fail_all();
                    return Err(Error::Timeout);
                }
                Err(err) => {
                    self.fail_all();
                    return Err(err);
                }
            };

            self.handle_data_pdu(&raw)?;
        }

        let pending = self.pending.remove(&target).expect("loop exited on done");
        if let Some(status) = pending.fault {
            self.last_fault = Some(status);
            return Err(Error::Fault { status });
        }

        Ok(pending.reply)
    }

    /// Ships queued calls while the multiplexing policy allows: one call in
    /// flight unless the server granted concurrent multiplexing.
    fn ship_queued(&mut self) -> Result<()> {
        while !self.queued.is_empty() {
            if !self.pending.is_empty() && !self.conc_mpx {
                break;
            }

            let request = self.queued.pop_front().expect("checked non-empty");
            self.send_request_fragments(&request)?;
            self.pending.insert(
                request.call_id,
                PendingRequest {
                    reply: Vec::new(),
                    fault: None,
                    received_first: false,
                    done: false,
                },
            );
        }

        Ok(())
    }

    fn send_request_fragments(&mut self, request: &QueuedRequest) -> Result<()> {
        let body_header_len = REQUEST_FIXED_SIZE + if request.obj.is_some() { 16 } else { 0 };
        let mut auth = self.auth.as_mut().filter(|auth| auth.protects_packets());
        let chunk_size = data_chunk_size(self.max_xmit_frag, body_header_len, auth.as_deref())?;

        let mut remaining = request.stub.len();
        for (first, last, chunk) in split_stub(&request.stub, chunk_size) {
            let mut flags = PacketFlags::None;
            if first {
                flags |= PacketFlags::PfcFirstFrag;
            }
            if last {
                flags |= PacketFlags::PfcLastFrag;
            }
            if request.obj.is_some() {
                flags |= PacketFlags::PfcObjectUuid;
            }

            let body_header = msrpc_pdu::request::Request {
                alloc_hint: remaining.try_into()?,
                context_id: request.context_id,
                opnum: request.opnum,
                obj: request.obj,
                stub_data: Vec::new(),
            }
            .encode_to_vec()?;

            let pdu = build_data_pdu(
                PacketType::Request,
                flags,
                request.call_id,
                &body_header,
                chunk,
                auth.as_deref_mut(),
            )?;
            self.transport.send(&pdu)?;

            remaining -= chunk.len();
        }

        Ok(())
    }

    fn handle_data_pdu(&mut self, raw: &[u8]) -> Result<()> {
        match self.process_data_pdu(raw) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Anything unexpected on the data path invalidates the
                // connection's framing.
                self.fail_all();
                Err(err)
            }
        }
    }

    fn process_data_pdu(&mut self, raw: &[u8]) -> Result<()> {
        let header = PduHeader::decode(raw)?;
        if usize::from(header.frag_len) != raw.len() {
            return Err(Error::Pdu(msrpc_pdu::Error::InvalidFragLength(header.frag_len)));
        }

        match header.packet_type {
            PacketType::Response => {
                let pending = self
                    .pending
                    .get(&header.call_id)
                    .ok_or_else(|| Error::Protocol(format!("response for unknown call {}", header.call_id)))?;
                if !pending.received_first && !header.packet_flags.contains(PacketFlags::PfcFirstFrag) {
                    return Err(Error::Protocol(String::from(
                        "response started without a first fragment",
                    )));
                }

                let stub = match self.auth.as_mut().filter(|auth| auth.protects_packets()) {
                    Some(auth) => unprotect_data_pdu(raw, &header, RESPONSE_FIXED_SIZE, auth)?,
                    None => {
                        if header.auth_len != 0 {
                            return Err(Error::Protocol(String::from(
                                "auth trailer on an unauthenticated connection",
                            )));
                        }

                        Response::decode(&raw[msrpc_pdu::pdu::PDU_HEADER_SIZE..])?.stub_data
                    }
                };

                let pending = self
                    .pending
                    .get_mut(&header.call_id)
                    .expect("presence checked above");
                pending.received_first = true;
                pending.reply.extend_from_slice(&stub);
                if header.packet_flags.contains(PacketFlags::PfcLastFrag) {
                    pending.done = true;
                }

                Ok(())
            }
            PacketType::Fault => {
                let pdu = Pdu::decode_exact(raw)?;
                let PduData::Fault(fault) = pdu.data else {
                    return Err(Error::Protocol(String::from("malformed FAULT PDU")));
                };

                let pending = self
                    .pending
                    .get_mut(&header.call_id)
                    .ok_or_else(|| Error::Protocol(format!("fault for unknown call {}", header.call_id)))?;
                pending.fault = Some(fault.status);
                pending.done = true;

                warn!(call_id = header.call_id, status = fault.status, "call faulted");

                Ok(())
            }
            PacketType::Shutdown => Err(Error::Disconnected),
            packet_type => Err(Error::Protocol(format!(
                "unexpected {:?} PDU on the data path",
                packet_type
            ))),
        }
    }

    /// Receives one control (bind-phase) PDU. A timeout here fails only the
    /// handshake in progress; the caller owns the retry policy.
    fn recv_control(&mut self) -> Result<Pdu> {
        let raw = match self.transport.recv_pdu() {
            Ok(raw) => raw,
            Err(err @ Error::Timeout) => return Err(err),
            Err(err) => {
                self.fail_all();
                return Err(err);
            }
        };

        Ok(Pdu::decode_exact(&raw)?)
    }

    /// Kills the connection: every queued and pending call fails with a
    /// disconnect error.
    fn fail_all(&mut self) {
        warn!(
            queued = self.queued.len(),
            pending = self.pending.len(),
            "connection failed, dropping all in-flight calls"
        );

        self.dead = true;
        self.queued.clear();
        self.pending.clear();
        let _ = self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::LoopbackTransport;

    /// A do-nothing transport for tests that never touch the wire.
    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&mut self, _pdu: &[u8]) -> Result<()> {
            Ok(())
        }

        fn recv_pdu(&mut self) -> Result<Vec<u8>> {
            Err(Error::Timeout)
        }

        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
            Ok(())
        }

        fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn call_ids_are_unique_and_skip_zero() {
        let mut client = RpcClient::new(NullTransport).unwrap();

        assert_eq!(client.next_call_id(), 1);
        assert_eq!(client.next_call_id(), 2);

        // Wrap-around skips zero.
        client.call_id_counter = u32::MAX - 1;
        assert_eq!(client.next_call_id(), u32::MAX);
        assert_eq!(client.next_call_id(), 1);
    }

    #[test]
    fn request_before_bind_is_out_of_sequence() {
        let mut client = RpcClient::new(NullTransport).unwrap();

        assert!(matches!(
            client.request(0, 0, &[]),
            Err(Error::OutOfSequence(_))
        ));
    }

    #[test]
    fn loopback_transport_is_object_safe_for_the_client() {
        // Compile-time check that the engine composes with the loopback.
        fn assert_transport<T: Transport>() {}
        assert_transport::<LoopbackTransport>();
        assert_transport::<NullTransport>();
    }
}
