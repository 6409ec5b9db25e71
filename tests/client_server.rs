mod common;

use common::*;

use msrpc::pdu::bind::NDR_SYNTAX;
use msrpc::pdu::pdu::{fault_status, nak_reason, PacketType, Pdu, PduData, PduHeader, PacketFlags};
use msrpc::pdu::{Decode, EncodeExt};
use msrpc::rpc::{ClientConfig, LoopbackTransport, RpcClient, Transport};
use msrpc::Error;

#[test]
fn bind_to_registered_interface_is_accepted() {
    let mut client = RpcClient::new(LoopbackTransport::new(plain_server())).unwrap();

    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    assert_eq!(context_id, 0);
    assert_ne!(client.assoc_group(), 0);
}

#[test]
fn bind_to_unknown_interface_is_a_provider_rejection_not_a_nak() {
    let mut client = RpcClient::new(LoopbackTransport::new(plain_server())).unwrap();

    // The server answers with a well-formed BIND_ACK carrying a
    // provider_rejection result, which the client surfaces as a context
    // rejection with the abstract-syntax reason.
    match client.bind(&UNREGISTERED_INTERFACE) {
        Err(Error::ContextRejected { result, reason }) => {
            assert_eq!(result, 2); // provider_rejection
            assert_eq!(reason, 1); // abstract_syntax_not_supported
        }
        other => panic!("expected a context rejection, got {:?}", other.is_ok()),
    }
}

#[test]
fn echo_round_trip() {
    setup_logger();

    let mut client = RpcClient::new(LoopbackTransport::new(plain_server())).unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    let reply = client.request(context_id, 0, b"hello rpc").unwrap();

    assert_eq!(reply, b"hello rpc");
}

#[test]
fn empty_stub_round_trip() {
    let mut client = RpcClient::new(LoopbackTransport::new(plain_server())).unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    assert_eq!(client.request(context_id, 0, &[]).unwrap(), Vec::<u8>::new());
}

#[test]
fn large_stub_is_fragmented_and_reassembled() {
    let config = ClientConfig {
        max_xmit_frag: 4096,
        max_recv_frag: 4096,
        ..Default::default()
    };
    let mut transport = InstrumentedTransport::new(plain_server());
    transport.tamper_request = None;

    let mut client = RpcClient::with_config(transport, config, None).unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    let stub: Vec<u8> = (0..50_000u32).map(|value| (value % 251) as u8).collect();
    let reply = client.request(context_id, 5, &stub).unwrap();

    assert_eq!(reply.len(), 50_000);
    assert_eq!(reply, stub);
}

#[test]
fn fragment_count_matches_the_negotiated_chunk_size() {
    let config = ClientConfig {
        max_xmit_frag: 4096,
        max_recv_frag: 4096,
        ..Default::default()
    };
    let mut client = RpcClient::with_config(InstrumentedTransport::new(plain_server()), config, None).unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    let stub = vec![0xabu8; 50_000];
    client.request(context_id, 5, &stub).unwrap();

    // 4096 bytes per fragment minus the 16-byte common header and the
    // 8-byte request header.
    let chunk = 4096 - 16 - 8;
    let expected = 50_000usize.div_ceil(chunk);

    // Only this call's fragments: the bind is not a REQUEST.
    // (The transport counted every REQUEST PDU sent on the connection.)
    assert_eq!(transport_requests(&client), expected);
}

fn transport_requests(client: &RpcClient<InstrumentedTransport>) -> usize {
    client.transport().sent_requests
}

#[test]
fn dispatch_error_becomes_a_fault_and_the_connection_survives() {
    let mut client = RpcClient::new(LoopbackTransport::new(plain_server())).unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    assert_fault(client.request(context_id, 2, b"boom"), ECHO_FAULT_STATUS);
    assert_eq!(client.last_fault(), Some(ECHO_FAULT_STATUS));

    // The fault was call-fatal only.
    assert_eq!(client.request(context_id, 0, b"still alive").unwrap(), b"still alive");
}

#[test]
fn out_of_range_opnum_faults_with_op_rng_error() {
    let mut client = RpcClient::new(LoopbackTransport::new(plain_server())).unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    assert_fault(client.request(context_id, 99, &[]), fault_status::NCA_S_OP_RNG_ERROR);
}

#[test]
fn unknown_context_id_faults_with_unknown_if() {
    let mut client = RpcClient::new(LoopbackTransport::new(plain_server())).unwrap();
    client.bind(&ECHO_INTERFACE).unwrap();

    assert_fault(client.request(42, 0, &[]), fault_status::NCA_S_UNKNOWN_IF);
}

#[test]
fn alter_context_adds_a_second_context() {
    let mut client = RpcClient::new(LoopbackTransport::new(plain_server())).unwrap();
    let first = client.bind(&ECHO_INTERFACE).unwrap();
    let second = client.alter_context(&ECHO_INTERFACE).unwrap();

    assert_ne!(first, second);
    assert_eq!(client.request(second, 1, b"abc").unwrap(), b"cba");
    assert_eq!(client.request(first, 0, b"abc").unwrap(), b"abc");
}

#[test]
fn second_bind_on_a_connection_is_fatal() {
    let server = plain_server();
    let mut client = RpcClient::new(LoopbackTransport::new(server)).unwrap();
    client.bind(&ECHO_INTERFACE).unwrap();

    // A raw second BIND must push the connection into the fault state.
    let bind = Pdu {
        header: PduHeader::new(
            PacketType::Bind,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            0,
            7,
        ),
        data: PduData::Bind(msrpc::pdu::bind::Bind {
            max_xmit_frag: 5840,
            max_recv_frag: 5840,
            assoc_group: 0,
            contexts: vec![msrpc::pdu::bind::ContextElement {
                context_id: 9,
                abstract_syntax: ECHO_INTERFACE,
                transfer_syntaxes: vec![NDR_SYNTAX],
            }],
        }),
        security_trailer: None,
    };
    let mut raw = bind.encode_to_vec().unwrap();
    let frag_len = raw.len() as u16;
    msrpc::pdu::pdu::set_frag_len(&mut raw, frag_len).unwrap();

    let transport = client.transport_mut();
    transport.send(&raw).unwrap();
    let reply = transport.recv_pdu().unwrap();

    let fault = Pdu::decode(&reply as &[u8]).unwrap();
    assert_eq!(fault.header.packet_type, PacketType::Fault);

    // After the fault latch every PDU is answered with nca_s_proto_error.
    match client.request(0, 0, b"too late") {
        Err(Error::Fault { status }) => assert_eq!(status, fault_status::NCA_S_PROTO_ERROR),
        other => panic!("expected a protocol-error fault, got {:?}", other.is_ok()),
    }
}

#[test]
fn cancel_and_orphaned_are_ignored() {
    let server = plain_server();
    let mut client = RpcClient::new(LoopbackTransport::new(server)).unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    for packet_type in [PacketType::CoCancel, PacketType::Orphaned] {
        let mut header = PduHeader::new(
            packet_type,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            0,
            99,
        );
        header.frag_len = 16;
        let raw = header.encode_to_vec().unwrap();

        client.transport_mut().send(&raw).unwrap();
        // No reply at all.
        assert!(matches!(client.transport_mut().recv_pdu(), Err(Error::Timeout)));
    }

    // The connection is unaffected.
    assert_eq!(client.request(context_id, 0, b"ok").unwrap(), b"ok");
}

#[test]
fn connectionless_packet_type_is_a_fatal_protocol_error() {
    let server = plain_server();
    let mut client = RpcClient::new(LoopbackTransport::new(server)).unwrap();
    client.bind(&ECHO_INTERFACE).unwrap();

    let mut header = PduHeader::new(
        PacketType::Ping,
        PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
        0,
        100,
    );
    header.frag_len = 16;
    let raw = header.encode_to_vec().unwrap();

    client.transport_mut().send(&raw).unwrap();
    let reply = client.transport_mut().recv_pdu().unwrap();
    let fault = Pdu::decode(&reply as &[u8]).unwrap();

    match fault.data {
        PduData::Fault(fault) => assert_eq!(fault.status, fault_status::NCA_S_PROTO_ERROR),
        other => panic!("expected a fault, got {:?}", other),
    }
}

#[test]
fn undersized_fragment_proposal_is_rejected() {
    let config = ClientConfig {
        max_xmit_frag: 128,
        max_recv_frag: 128,
        ..Default::default()
    };
    let mut client = RpcClient::with_config(LoopbackTransport::new(plain_server()), config, None).unwrap();

    match client.bind(&ECHO_INTERFACE) {
        Err(Error::BindRejected { reason }) => assert_eq!(reason, nak_reason::LOCAL_LIMIT_EXCEEDED),
        other => panic!("expected a bind rejection, got {:?}", other.is_ok()),
    }
}

#[test]
fn dead_peer_timeout_tears_down_the_connection() {
    let mut transport = LoopbackTransport::new(plain_server());
    transport.drop_sends = false;

    let mut client = RpcClient::new(transport).unwrap();
    let context_id = client.bind(&ECHO_INTERFACE).unwrap();

    client.transport_mut().drop_sends = true;

    assert!(matches!(client.request(context_id, 0, b"lost"), Err(Error::Timeout)));
    // The timeout poisoned the connection: everything after fails fast.
    assert!(matches!(client.request(context_id, 0, b"gone"), Err(Error::Disconnected)));
}
