//! Integration test: server-ordered membership operations.
//!
//! Two members race to open the first membership operation. The packet
//! the channel delivers first wins; the concurrent initial claiming the
//! same previous-final is rejected everywhere and its sender is noted.

use mpenc_greet::greeter::GreetState;
use mpenc_integration_tests::{ids, init_tracing, TestNet};
use mpenc_session::session::SessionConfig;
use mpenc_types::events::SessionEvent;

#[test]
fn concurrent_initial_is_rejected_and_noted() {
    init_tracing();
    let mut net = TestNet::new(&["A", "B", "C"], SessionConfig::default());

    // Both A and C try to start before seeing each other's packet.
    net.session_mut("A").start(&ids(&["B", "C"])).expect("start");
    net.session_mut("C").start(&ids(&["A", "B"])).expect("start");

    // The channel delivers A's packet first; C's becomes the loser.
    net.pump();

    // Everyone converged on A's operation.
    for name in ["A", "B", "C"] {
        assert_eq!(net.session(name).state(), GreetState::Ready, "{name}");
        assert_eq!(net.session(name).members(), ids(&["A", "B", "C"]), "{name}");
    }

    // B noted C as the sender of a rejected boundary packet.
    let rejected = net.session("B").server_order().rejected();
    assert!(
        rejected.iter().any(|(sender, _)| sender == "C"),
        "C's concurrent initial should be noted, got {rejected:?}"
    );
    let events = net.session_mut("B").poll_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::PacketDropped { sender, .. } if sender == "C")));
}

#[test]
fn chain_hashes_agree_across_members() {
    init_tracing();
    let mut net = TestNet::new(&["A", "B", "C"], SessionConfig::default());
    net.session_mut("A").start(&ids(&["B", "C"])).expect("start");
    net.pump();

    net.session_mut("B").refresh().expect("refresh");
    net.pump();

    let chain_a = net.session("A").server_order().chain_hashes().to_vec();
    let chain_b = net.session("B").server_order().chain_hashes().to_vec();
    let chain_c = net.session("C").server_order().chain_hashes().to_vec();
    assert!(!chain_a.is_empty());
    assert_eq!(chain_a, chain_b);
    assert_eq!(chain_a, chain_c);
}

#[test]
fn duplicate_boundary_packet_rejected() {
    init_tracing();
    let mut net = TestNet::new(&["A", "B"], SessionConfig::default());
    net.session_mut("A").start(&ids(&["B"])).expect("start");

    // Capture the start packet and replay it after the flow completes.
    let sender = "A".to_string();
    let traffic = {
        let session = net.session_mut("A");
        session.channel_mut().drain()
    };
    let mpenc_session::channel::ChannelSend::Packet { pubtxt, recipients } = &traffic[0] else {
        unreachable!("start emits a packet");
    };
    net.deliver(&sender, pubtxt, recipients);
    net.pump();
    assert_eq!(net.session("B").state(), GreetState::Ready);

    let accepted_before = net.session("B").server_order().packet_ids().len();
    net.deliver(&sender, pubtxt, recipients);
    net.pump();
    assert_eq!(
        net.session("B").server_order().packet_ids().len(),
        accepted_before
    );
    let rejected = net.session("B").server_order().rejected();
    assert!(rejected.iter().any(|(s, _)| s == "A"));
}
