use uuid::uuid;

use msrpc_pdu::bind::{Bind, BindAck, BindNak, ContextElement, ContextResult, ContextResultCode, SyntaxId, NDR_SYNTAX};

test_encoding_decoding! {
    context_element,
    ContextElement,
    ContextElement {
        context_id: 0,
        abstract_syntax: SyntaxId {
            uuid: uuid!("b9785960-524f-11df-8b6d-83dcded72085"),
            version: 1,
            version_minor: 0,
        },
        transfer_syntaxes: vec![NDR_SYNTAX],
    },
    [
        0, 0, 1, 0,
        96, 89, 120, 185, 79, 82, 223, 17, 139, 109, 131, 220, 222, 215, 32, 133, 1, 0, 0, 0,
        4, 93, 136, 138, 235, 28, 201, 17, 159, 232, 8, 0, 43, 16, 72, 96, 2, 0, 0, 0
    ]
}

test_encoding_decoding! {
    context_result,
    ContextResult,
    ContextResult::acceptance(&NDR_SYNTAX),
    [
        0, 0, 0, 0,
        4, 93, 136, 138, 235, 28, 201, 17, 159, 232, 8, 0, 43, 16, 72, 96, 2, 0, 0, 0
    ]
}

test_encoding_decoding! {
    bind,
    Bind,
    Bind {
        max_xmit_frag: 5840,
        max_recv_frag: 5840,
        assoc_group: 0,
        contexts: vec![ContextElement {
            context_id: 0,
            abstract_syntax: SyntaxId {
                uuid: uuid!("b9785960-524f-11df-8b6d-83dcded72085"),
                version: 1,
                version_minor: 0,
            },
            transfer_syntaxes: vec![NDR_SYNTAX],
        }],
    },
    [
        208, 22, 208, 22, 0, 0, 0, 0, 1, 0, 0, 0,
        0, 0, 1, 0,
        96, 89, 120, 185, 79, 82, 223, 17, 139, 109, 131, 220, 222, 215, 32, 133, 1, 0, 0, 0,
        4, 93, 136, 138, 235, 28, 201, 17, 159, 232, 8, 0, 43, 16, 72, 96, 2, 0, 0, 0
    ]
}

test_encoding_decoding! {
    bind_ack,
    BindAck,
    BindAck {
        max_xmit_frag: 4096,
        max_recv_frag: 4096,
        assoc_group: 0x1234_5678,
        sec_addr: String::from("135"),
        results: vec![ContextResult::acceptance(&NDR_SYNTAX)],
    },
    [
        0, 16, 0, 16, 120, 86, 52, 18,
        4, 0, 49, 51, 53, 0, 0, 0,
        1, 0, 0, 0,
        0, 0, 0, 0,
        4, 93, 136, 138, 235, 28, 201, 17, 159, 232, 8, 0, 43, 16, 72, 96, 2, 0, 0, 0
    ]
}

test_encoding_decoding! {
    bind_nak,
    BindNak,
    BindNak {
        reason: msrpc_pdu::pdu::nak_reason::AUTH_TYPE_NOT_RECOGNIZED,
        versions: vec![(5, 0)],
    },
    [8, 0, 1, 5, 0, 0, 0, 0]
}

#[test]
fn provider_rejection_result_has_a_nil_syntax() {
    use msrpc_pdu::bind::provider_reason;
    use msrpc_pdu::{Decode, EncodeExt};

    let result = ContextResult::provider_rejection(provider_reason::ABSTRACT_SYNTAX_NOT_SUPPORTED);

    assert_eq!(result.result, ContextResultCode::ProviderRejection);
    assert_eq!(result.syntax, uuid::Uuid::nil());

    let encoded = result.encode_to_vec().unwrap();
    assert_eq!(ContextResult::decode(&encoded as &[u8]).unwrap(), result);
}
