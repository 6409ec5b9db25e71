use msrpc_pdu::pdu::{
    fault_status, set_frag_len, AuthenticationLevel, DataRepresentation, Fault, FaultFlags, PacketFlags, PacketType,
    Pdu, PduData, PduHeader, SecurityProvider, SecurityTrailer,
};
use msrpc_pdu::request::Response;
use msrpc_pdu::{Decode, EncodeExt};

test_encoding_decoding! {
    pdu_header,
    PduHeader,
    PduHeader {
        version: 5,
        version_minor: 0,
        packet_type: PacketType::BindAck,
        packet_flags: PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
        data_rep: DataRepresentation::default(),
        frag_len: 68,
        auth_len: 0,
        call_id: 2,
    },
    [5, 0, 12, 3, 16, 0, 0, 0, 68, 0, 0, 0, 2, 0, 0, 0]
}

test_encoding_decoding! {
    fault,
    Fault,
    Fault {
        alloc_hint: 0,
        context_id: 0,
        cancel_count: 0,
        flags: FaultFlags::None,
        status: fault_status::NCA_S_OP_RNG_ERROR,
        stub_data: vec![],
    },
    [0, 0, 0, 0, 0, 0, 0, 0, 2, 0, 1, 28, 0, 0, 0, 0]
}

test_encoding_decoding! {
    response,
    Response,
    Response {
        alloc_hint: 4,
        context_id: 0,
        cancel_count: 0,
        stub_data: vec![0xde, 0xad, 0xbe, 0xef],
    },
    [4, 0, 0, 0, 0, 0, 0, 0, 222, 173, 190, 239]
}

#[test]
fn request_pdu_decodes_from_raw_bytes() {
    // 16-byte common header, 8-byte request header, 4-byte stub.
    let raw = [
        5, 0, 0, 3, 16, 0, 0, 0, 28, 0, 0, 0, 7, 0, 0, 0, // header, frag_len 28
        4, 0, 0, 0, 0, 0, 5, 0, // alloc_hint 4, context 0, opnum 5
        0xde, 0xad, 0xbe, 0xef,
    ];

    let pdu = Pdu::decode_exact(&raw).unwrap();

    assert_eq!(pdu.header.packet_type, PacketType::Request);
    assert_eq!(pdu.header.call_id, 7);
    let PduData::Request(request) = pdu.data else {
        panic!("expected a request body");
    };
    assert_eq!(request.opnum, 5);
    assert_eq!(request.stub_data, [0xde, 0xad, 0xbe, 0xef]);
    assert!(pdu.security_trailer.is_none());
}

#[test]
fn authenticated_response_pdu_round_trips() {
    let trailer = SecurityTrailer {
        security_type: SecurityProvider::Winnt,
        level: AuthenticationLevel::PktPrivacy,
        pad_length: 12,
        context_id: 0,
        auth_value: (1..=16).collect(),
    };

    let mut pdu = Pdu {
        header: PduHeader::new(
            PacketType::Response,
            PacketFlags::PfcFirstFrag | PacketFlags::PfcLastFrag,
            trailer.auth_value.len() as u16,
            9,
        ),
        data: PduData::Response(Response {
            alloc_hint: 4,
            context_id: 0,
            cancel_count: 0,
            // Stub plus the auth padding the trailer announces.
            stub_data: vec![0xaa; 16],
        }),
        security_trailer: Some(trailer),
    };

    let mut raw = pdu.encode_to_vec().unwrap();
    let frag_len = raw.len() as u16;
    set_frag_len(&mut raw, frag_len).unwrap();
    pdu.header.frag_len = raw.len() as u16;

    assert_eq!(Pdu::decode_exact(&raw).unwrap(), pdu);
}

#[test]
fn truncated_pdu_is_rejected() {
    let raw: [u8; 20] = [
        5, 0, 0, 3, 16, 0, 0, 0, 28, 0, 0, 0, 7, 0, 0, 0, // announces 28 bytes
        4, 0, 0, 0,
    ];

    assert!(Pdu::decode(raw.as_slice()).is_err());
}
