//! Integration test: wire format pinning.
//!
//! The armor framing and the TLV emission order are interoperability
//! contracts; these tests pin them byte-exactly so a refactor cannot
//! silently reorder the envelope.

use std::collections::BTreeSet;

use mpenc_codec::tlv::{self, types};
use mpenc_codec::wire;
use mpenc_integration_tests::{ids, init_tracing, TestNet};
use mpenc_session::channel::ChannelSend;
use mpenc_session::session::SessionConfig;

fn capture_packet(net: &mut TestNet, name: &str) -> (String, BTreeSet<String>) {
    let traffic = net.session_mut(name).channel_mut().drain();
    let ChannelSend::Packet { pubtxt, recipients } = traffic
        .into_iter()
        .next()
        .expect("a packet was sent")
    else {
        unreachable!("membership sends are not expected here");
    };
    (pubtxt, recipients)
}

#[test]
fn greet_packet_tlv_order_is_pinned() {
    init_tracing();
    let mut net = TestNet::new(&["A", "B"], SessionConfig::default());
    net.session_mut("A").start(&ids(&["B"])).expect("start");
    let (pubtxt, recipients) = capture_packet(&mut net, "A");

    assert!(pubtxt.starts_with("?mpENC:"));
    assert!(pubtxt.ends_with('.'));

    let bytes = wire::unarmor(&pubtxt).expect("unarmor");
    let tlvs = tlv::decode(&bytes).expect("decode");
    let order: Vec<u16> = tlvs.iter().map(|t| t.ty).collect();
    assert_eq!(
        order,
        vec![
            types::SIGNATURE,
            types::PROTOCOL_VERSION,
            types::MESSAGE_TYPE,
            types::SOURCE,
            types::DEST,
            types::AGREEMENT,
            types::FLOW,
            types::MEMBER,
            types::MEMBER,
            types::INT_KEY,
            types::INT_KEY,
            types::NONCE,
            types::PUB_KEY,
            types::PREV_PF,
            types::PREV_CH,
            types::PREV_SENDER,
        ]
    );

    // Resume the flow so the fixture is left consistent.
    net.deliver(&"A".to_string(), &pubtxt, &recipients);
    net.pump();
}

#[test]
fn data_packet_tlv_order_is_pinned() {
    init_tracing();
    let mut net = TestNet::new(&["A", "B"], SessionConfig::default());
    net.session_mut("A").start(&ids(&["B"])).expect("start");
    net.pump();

    net.session_mut("A").send(b"pin me").expect("send");
    let (pubtxt, _) = capture_packet(&mut net, "A");

    let bytes = wire::unarmor(&pubtxt).expect("unarmor");
    let tlvs = tlv::decode(&bytes).expect("decode");
    let order: Vec<u16> = tlvs.iter().map(|t| t.ty).collect();
    assert_eq!(
        order,
        vec![
            types::SIDKEY_HINT,
            types::SIGNATURE,
            types::PROTOCOL_VERSION,
            types::MESSAGE_TYPE,
            types::MESSAGE_IV,
            types::DATA_MESSAGE,
        ]
    );

    // Field widths as fixed by the protocol.
    assert_eq!(tlvs[0].value.len(), 1);
    assert_eq!(tlvs[1].value.len(), 64);
    assert_eq!(tlvs[2].value, vec![1]);
    assert_eq!(tlvs[4].value.len(), 12);
    // Default padding: 128-byte plaintext plus CBC-preserved length.
    assert_eq!(tlvs[5].value.len() % 16, 0);
    assert!(tlvs[5].value.len() >= 128);
}

#[test]
fn query_and_plaintext_pass_through_untouched() {
    init_tracing();
    assert_eq!(wire::QUERY_MESSAGE, "?mpENC?v1?");
    match wire::classify("just chatting") {
        wire::WireInbound::Plain(text) => assert_eq!(text, "just chatting"),
        other => unreachable!("plaintext misclassified: {other:?}"),
    }
}
