//! Session-to-application notification events.
//!
//! The session controller publishes these in the order they become valid:
//! `MsgReady` follows a topological order (parents before children), and
//! `MsgFullyAcked` fires exactly once per message.

use serde::{Deserialize, Serialize};

use crate::{MessageId, UserId};

/// Events published by a session to the embedding application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    /// A payload message passed verification and entered the transcript.
    MsgAccepted { mid: MessageId },
    /// A message is deliverable in causal order.
    MsgReady { mid: MessageId },
    /// Every intended recipient has authored a descendant of the message.
    MsgFullyAcked { mid: MessageId },
    /// A message was not fully acked within its timeout. `last` is set when
    /// the session is stopping and no further acks can arrive.
    FullAckWarn { mid: MessageId, last: bool },
    /// Active-ack monitor tick: the message is still awaiting acks.
    Unacked { mid: MessageId },
    /// Active-ack monitor tick: the local user itself still owes an ack.
    UnackByOwn { mid: MessageId },
    /// The session membership changed.
    MembersChanged { members: Vec<UserId> },
    /// The key agreement completed and the session is ready for payloads.
    SessionReady { members: Vec<UserId> },
    /// A plaintext (non-mpENC) message arrived on the channel.
    PlaintextReceived { sender: UserId, body: String },
    /// A peer asked to negotiate an mpENC session.
    QueryReceived { sender: UserId },
    /// A non-fatal protocol failure; the offending packet was dropped.
    PacketDropped { sender: UserId, reason: String },
}
