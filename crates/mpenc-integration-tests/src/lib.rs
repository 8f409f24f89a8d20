//! Shared fixtures for the mpENC integration tests.
//!
//! The tests exercise end-to-end protocol flows across the workspace
//! crates: several [`Session`]s wired to a loopback "channel" that
//! reflects every send back to all members, the way a group transport
//! server echoes broadcasts.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p mpenc-integration-tests
//! ```

use std::collections::{BTreeMap, BTreeSet};

use mpenc_crypto::ed25519::{KeyPair, VerifyingKey};
use mpenc_session::channel::{ChannelRecv, ChannelSend, RecordingChannel};
use mpenc_session::session::{Session, SessionConfig};
use mpenc_session::timer::VirtualTimer;
use mpenc_types::UserId;

pub type TestSession = Session<RecordingChannel, VirtualTimer>;

/// Initialise tracing once for a test binary; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A loopback network of sessions sharing one key directory.
pub struct TestNet {
    pub sessions: Vec<TestSession>,
}

impl TestNet {
    /// Build one session per name; the first member created the channel.
    pub fn new(names: &[&str], config: SessionConfig) -> Self {
        let mut directory: BTreeMap<UserId, VerifyingKey> = BTreeMap::new();
        let mut keys = Vec::new();
        for name in names {
            let kp = KeyPair::generate();
            directory.insert(name.to_string(), kp.verifying_key.clone());
            keys.push(kp.signing_key);
        }
        let sessions = names
            .iter()
            .zip(keys)
            .enumerate()
            .map(|(i, (name, key))| {
                Session::new(
                    *name,
                    key,
                    Box::new(directory.clone()),
                    RecordingChannel::new(),
                    VirtualTimer::new(),
                    config.clone(),
                    i == 0,
                )
            })
            .collect();
        Self { sessions }
    }

    pub fn session(&self, name: &str) -> &TestSession {
        self.sessions
            .iter()
            .find(|s| s.id() == name)
            .expect("unknown session name")
    }

    pub fn session_mut(&mut self, name: &str) -> &mut TestSession {
        self.sessions
            .iter_mut()
            .find(|s| s.id() == name)
            .expect("unknown session name")
    }

    /// Collect every session's outbound packets.
    fn collect(&mut self) -> Vec<(UserId, ChannelSend)> {
        let mut traffic = Vec::new();
        for session in self.sessions.iter_mut() {
            let sender = session.id().clone();
            for send in session.channel_mut().drain() {
                traffic.push((sender.clone(), send));
            }
        }
        traffic
    }

    /// Deliver a packet to every session, echo included.
    pub fn deliver(&mut self, sender: &UserId, pubtxt: &str, recipients: &BTreeSet<UserId>) {
        for session in self.sessions.iter_mut() {
            session
                .recv(ChannelRecv::Packet {
                    pubtxt: pubtxt.to_string(),
                    sender: sender.clone(),
                    recipients: recipients.clone(),
                })
                .expect("recv");
        }
    }

    /// Reflect all pending traffic until the network is quiet.
    pub fn pump(&mut self) {
        loop {
            let traffic = self.collect();
            if traffic.is_empty() {
                break;
            }
            for (sender, send) in traffic {
                if let ChannelSend::Packet { pubtxt, recipients } = send {
                    self.deliver(&sender, &pubtxt, &recipients);
                }
            }
        }
    }

    /// Silently discard one member's pending outbound traffic, simulating
    /// loss in the transport.
    pub fn drop_outbound(&mut self, name: &str) -> usize {
        self.session_mut(name).channel_mut().drain().len()
    }

    /// Advance every session's virtual clock by one tick.
    pub fn tick_all(&mut self) {
        for session in self.sessions.iter_mut() {
            session.tick();
        }
    }
}

/// Convenience: owned id list from names.
pub fn ids(names: &[&str]) -> Vec<UserId> {
    names.iter().map(|n| n.to_string()).collect()
}
