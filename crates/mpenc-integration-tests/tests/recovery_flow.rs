//! Integration test: recovery from a stuck membership operation.
//!
//! 1. Three members reach READY
//! 2. The initiator's include upflow is lost in the transport
//! 3. `recover()` abandons the stuck auxiliary flow and re-runs a full
//!    initial agreement over the intended membership
//! 4. Everyone converges on a fresh key and the recovering flag clears

use mpenc_greet::greeter::GreetState;
use mpenc_integration_tests::{ids, init_tracing, TestNet};
use mpenc_session::session::SessionConfig;

#[test]
fn recover_from_stuck_include() {
    init_tracing();
    let mut net = TestNet::new(&["A", "B", "C", "D"], SessionConfig::default());

    net.session_mut("A").start(&ids(&["B", "C"])).expect("start");
    net.pump();
    for name in ["A", "B", "C"] {
        assert_eq!(net.session(name).state(), GreetState::Ready, "{name}");
    }

    // The include packet never reaches the channel.
    net.session_mut("A").include(&ids(&["D"])).expect("include");
    let lost = net.drop_outbound("A");
    assert_eq!(lost, 1);
    assert_eq!(net.session("A").state(), GreetState::AuxUpflow);

    // Recovery restarts the agreement over A's member view {A, B, C, D}.
    net.session_mut("A").recover().expect("recover");
    assert_eq!(net.session("A").state(), GreetState::InitUpflow);
    assert!(net.session("A").recovering());

    net.pump();
    for name in ["A", "B", "C", "D"] {
        assert_eq!(net.session(name).state(), GreetState::Ready, "{name}");
        assert_eq!(net.session(name).members(), ids(&["A", "B", "C", "D"]));
        assert!(!net.session(name).recovering(), "{name}");
    }

    // The fresh key carries traffic to everyone, including D.
    net.session_mut("A").send(b"recovered").expect("send");
    net.pump();
    for name in ["B", "C", "D"] {
        assert_eq!(net.session(name).transcript().len(), 1, "{name}");
    }
}

#[test]
fn recovery_packets_survive_established_members() {
    init_tracing();
    let mut net = TestNet::new(&["A", "B"], SessionConfig::default());
    net.session_mut("A").start(&ids(&["B"])).expect("start");
    net.pump();

    // B is READY; A recovers anyway (e.g. suspected key compromise).
    net.session_mut("A").recover().expect("recover");
    net.pump();

    for name in ["A", "B"] {
        assert_eq!(net.session(name).state(), GreetState::Ready, "{name}");
        assert!(!net.session(name).recovering(), "{name}");
    }
    net.session_mut("B").send(b"still works").expect("send");
    net.pump();
    assert_eq!(net.session("A").transcript().len(), 1);
}
