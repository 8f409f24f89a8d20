//! Group transport channel contract.
//!
//! The channel is an untrusted broadcast medium owned by the embedding
//! application: sends are fire-and-forget with advisory recipients, and
//! inbound traffic arrives as packets or membership notifications. The
//! session never assumes delivery, ordering beyond what the server-order
//! tracker verifies, or confidentiality.

use std::collections::BTreeSet;

use mpenc_types::UserId;

/// Outbound channel traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelSend {
    /// Broadcast a wire string; recipients are advisory.
    Packet {
        pubtxt: String,
        recipients: BTreeSet<UserId>,
    },
    /// Ask the channel to admit and/or evict members.
    Membership {
        enter: BTreeSet<UserId>,
        leave: BTreeSet<UserId>,
    },
}

/// Inbound channel traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelRecv {
    /// A wire string from a channel member (including our own echoes).
    Packet {
        pubtxt: String,
        sender: UserId,
        recipients: BTreeSet<UserId>,
    },
    /// The channel membership changed.
    Membership {
        enter: BTreeSet<UserId>,
        leave: BTreeSet<UserId>,
        members: BTreeSet<UserId>,
    },
}

/// The send half the session needs from the transport.
pub trait GroupChannel {
    fn send(&mut self, message: ChannelSend);
}

/// Channel stub that records every send; test fixtures drain it and feed
/// the packets back as inbound echoes.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Vec<ChannelSend>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<ChannelSend> {
        std::mem::take(&mut self.sent)
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

impl GroupChannel for RecordingChannel {
    fn send(&mut self, message: ChannelSend) {
        self.sent.push(message);
    }
}
