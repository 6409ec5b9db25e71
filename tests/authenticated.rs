mod common;

use common::*;

use msrpc::gensec::{GensecRegistry, Mechanism, Role, SecurityProvider};
use msrpc::ntlmssp::Ntlmssp;
use msrpc::pdu::bind::{Bind, ContextElement, NDR_SYNTAX};
use msrpc::pdu::pdu::{
    AuthenticationLevel, PacketFlags, PacketType, Pdu, PduData, PduHeader, SecurityTrailer,
};
use msrpc::pdu::{Decode, EncodeExt};
use msrpc::rpc::{ClientAuth, ClientConfig, LoopbackTransport, RpcClient, Transport};
use msrpc::Error;

fn client_auth(security_type: SecurityProvider, level: AuthenticationLevel) -> ClientAuth {
    ClientAuth {
        registry: GensecRegistry::with_default_mechanisms(),
        security_type,
        level,
        config: client_gensec_config(),
    }
}

fn authenticated_pair(
    security_type: SecurityProvider,
    level: AuthenticationLevel,
) -> RpcClient<LoopbackTransport> {
    let server = authenticated_server(GensecRegistry::with_default_mechanisms());

    RpcClient::with_auth(LoopbackTransport::new(server), client_auth(security_type, level)).unwrap()
}

#[test]
fn ntlmssp_three_leg_bind_and_sealed_echo() {
    setup_logger();

    let mut client = authenticated_pair(SecurityProvider::Winnt, AuthenticationLevel::PktPrivacy);

    let context_id = client.bind(&ECHO_INTERFACE).unwrap();
    assert!(client.transport_mut().server().is_bound());

    let reply = client.request(context_id, 0, b"sealed payload").unwrap();
    assert_eq!(reply, b"sealed payload");
}

#[test]
fn ntlmssp_integrity_level_signs_traffic() {
    let mut client = authenticated_pair(SecurityProvider::Winnt, AuthenticationLevel::PktIntegrity);

    let context_id = client.bind(&ECHO_INTERFACE).unwrap();
    let reply = client.request(context_id, 1, b"signed").unwrap();

    assert_eq!(reply, b"dengis");
}

#[test]
fn spnego_negotiated_bind_and_sealed_echo() {
    let mut client = authenticated_pair(SecurityProvider::GssNegotiate, AuthenticationLevel::PktPrivacy);

    let context_id = client.bind(&ECHO_INTERFACE).unwrap();
    assert!(client.transport_mut().server().is_bound());

    let reply = client.request(context_id, 0, b"negotiated and sealed").unwrap();
    assert_eq!(reply, b"negotiated and sealed");
}

#[test]
fn sealed_large_stub_fragments_survive_the_round_trip() {
    let config = ClientConfig {
        max_xmit_frag: 4096,
        max_recv_frag: 4096,
        ..Default::default()
    };
    let server = authenticated_server(GensecRegistry::with_default_mechanisms());
    let mut client = RpcClient::with_config(
        LoopbackTransport::new(server),
        config,
        Some(client_auth(SecurityProvider::Winnt, AuthenticationLevel::PktPrivacy)),
    )
    .unwrap();

    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    let stub: Vec<u8> = (0..50_000u32).map(|value| (value % 239) as u8).collect();
    let reply = client.request(context_id, 5, &stub).unwrap();

    assert_eq!(reply, stub);
}

#[test]
fn tampered_request_faults_with_access_denied_and_the_connection_survives() {
    let server = authenticated_server(GensecRegistry::with_default_mechanisms());
    let mut transport = InstrumentedTransport::new(server);
    transport.tamper_request = Some(2);

    let mut client = RpcClient::with_config(
        transport,
        ClientConfig::default(),
        Some(client_auth(SecurityProvider::Winnt, AuthenticationLevel::PktPrivacy)),
    )
    .unwrap();

    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    // First request passes untouched.
    assert_eq!(client.request(context_id, 0, b"first").unwrap(), b"first");

    // The second request gets one bit of its sealed stub flipped in
    // transit: the server answers an access-denied fault.
    assert_fault(
        client.request(context_id, 0, b"second"),
        msrpc::fault_status::ACCESS_DENIED,
    );

    // Call-fatal only: an independent call on the same connection works.
    assert_eq!(client.request(context_id, 0, b"third").unwrap(), b"third");
}

#[test]
fn wrong_ntlmssp_message_in_bind_is_rejected_with_a_nak() {
    // Produce a CHALLENGE message by running an unrelated handshake.
    let challenge = {
        let registry = GensecRegistry::with_default_mechanisms();
        let mut client_mech = registry
            .start(SecurityProvider::Winnt, Role::Client, &client_gensec_config())
            .unwrap();
        let mut server_mech = registry
            .start(SecurityProvider::Winnt, Role::Server, &server_gensec_config())
            .unwrap();

        let negotiate = client_mech.update(&[]).unwrap();
        server_mech.update(negotiate.token()).unwrap().token().to_vec()
    };

    // A BIND whose auth trailer carries a CHALLENGE where the server
    // expects NEGOTIATE must be answered with BIND_NAK.
    let bind = Pdu {
        header: PduHeader::new(
            PacketType::Bind,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag | PacketFlags::PfcSupportHeaderSign,
            challenge.len() as u16,
            1,
        ),
        data: PduData::Bind(Bind {
            max_xmit_frag: 5840,
            max_recv_frag: 5840,
            assoc_group: 0,
            contexts: vec![ContextElement {
                context_id: 0,
                abstract_syntax: ECHO_INTERFACE,
                transfer_syntaxes: vec![NDR_SYNTAX],
            }],
        }),
        security_trailer: Some(SecurityTrailer {
            security_type: SecurityProvider::Winnt,
            level: AuthenticationLevel::PktPrivacy,
            pad_length: 0,
            context_id: 0,
            auth_value: challenge,
        }),
    };
    let mut raw = bind.encode_to_vec().unwrap();
    let frag_len = raw.len() as u16;
    msrpc::pdu::pdu::set_frag_len(&mut raw, frag_len).unwrap();

    let mut server = authenticated_server(GensecRegistry::with_default_mechanisms());
    let replies = server.process_pdu(&raw).unwrap();

    assert_eq!(replies.len(), 1);
    let reply = Pdu::decode(&replies[0] as &[u8]).unwrap();
    assert_eq!(reply.header.packet_type, PacketType::BindNak);
    assert!(server.is_faulted());
}

#[test]
fn unauthenticated_request_on_an_authenticated_connection_is_access_denied() {
    let server = authenticated_server(GensecRegistry::with_default_mechanisms());
    let mut client = RpcClient::with_auth(
        LoopbackTransport::new(server),
        client_auth(SecurityProvider::Winnt, AuthenticationLevel::PktIntegrity),
    )
    .unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    // Hand-build a REQUEST without any auth trailer.
    let request = Pdu {
        header: PduHeader::new(
            PacketType::Request,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            0,
            77,
        ),
        data: PduData::Request(msrpc::pdu::request::Request {
            alloc_hint: 4,
            context_id,
            opnum: 0,
            obj: None,
            stub_data: vec![1, 2, 3, 4],
        }),
        security_trailer: None,
    };
    let mut raw = request.encode_to_vec().unwrap();
    let frag_len = raw.len() as u16;
    msrpc::pdu::pdu::set_frag_len(&mut raw, frag_len).unwrap();

    let replies = {
        let transport = client.transport_mut();
        transport.send(&raw).unwrap();
        let reply = transport.recv_pdu().unwrap();
        vec![reply]
    };

    let fault = Pdu::decode(&replies[0] as &[u8]).unwrap();
    match fault.data {
        PduData::Fault(fault) => assert_eq!(fault.status, msrpc::fault_status::ACCESS_DENIED),
        other => panic!("expected an access-denied fault, got {:?}", other),
    }
}

#[test]
fn server_requires_a_configured_auth_provider() {
    // A server without an auth provider rejects authenticated binds.
    let mut client = RpcClient::with_auth(
        LoopbackTransport::new(plain_server()),
        client_auth(SecurityProvider::Winnt, AuthenticationLevel::PktPrivacy),
    )
    .unwrap();

    assert!(matches!(client.bind(&ECHO_INTERFACE), Err(Error::BindRejected { .. })));
}

#[test]
fn raw_ntlmssp_mechanism_composes_with_spnego_capable_server() {
    // The server side always starts whatever mechanism the trailer's auth
    // type names; a raw NTLMSSP client therefore interoperates with a
    // server that also offers SPNEGO.
    let mut client = authenticated_pair(SecurityProvider::Winnt, AuthenticationLevel::PktPrivacy);
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    assert_eq!(client.request(context_id, 1, b"raw").unwrap(), b"war");
}

#[test]
fn direct_ntlmssp_context_reports_establishment() {
    let mut server = Ntlmssp::new(Role::Server, &server_gensec_config()).unwrap();
    assert!(!server.is_established());

    let mut client = Ntlmssp::new(Role::Client, &client_gensec_config()).unwrap();
    let negotiate = client.update(&[]).unwrap();
    let challenge = server.update(negotiate.token()).unwrap();
    let authenticate = client.update(challenge.token()).unwrap();
    server.update(authenticate.token()).unwrap();

    assert!(server.is_established());
    assert!(client.is_established());
}
