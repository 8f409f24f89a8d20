//! # mpenc-transcript
//!
//! Append-only causal transcript of accepted payload messages.
//!
//! - [`graph`] — the arena-backed DAG store with per-author total orders,
//!   acknowledgement tracking, and an out-of-order delivery buffer
//! - [`order`] — the causal partial order: `le`, ancestor traversal, and
//!   `pre_pred` (maximal ancestors matching a predicate)
//! - [`merge`] — deterministic 3-way merge of membership views across
//!   branches, memoised per parent set
//!
//! The transcript is a transitive reduction: a message whose parents are
//! mutually comparable is rejected, so reachability alone encodes the
//! ancestor relation.

pub mod graph;
pub mod merge;
pub mod order;

use mpenc_types::MessageId;

/// Error types for transcript operations.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    /// The message is already in the transcript.
    #[error("duplicate message {0}")]
    Duplicate(MessageId),

    /// A referenced message is not in the transcript.
    #[error("unknown message {0}")]
    Unknown(MessageId),

    /// A parent of the message has not been accepted yet.
    #[error("missing parent {0}")]
    MissingParent(MessageId),

    /// One parent is an ancestor of another.
    #[error("parents are not an anti-chain: {0} precedes {1}")]
    NotAntiChain(MessageId, MessageId),

    /// The message does not follow its author's previous message.
    #[error("author order violation: {0}")]
    AuthorOrder(String),

    /// The author references a message it could not have read.
    #[error("visibility violation: {0}")]
    Visibility(String),

    /// Membership views across branches disagree irreconcilably.
    #[error("membership merge conflict: {0}")]
    MergeConflict(String),
}

pub type Result<T> = std::result::Result<T, TranscriptError>;
