//! # mpenc-session
//!
//! The mpENC session controller and its collaborators.
//!
//! - [`session`] — wires the greet state machine, server-order tracker,
//!   transcript, message security, and consistency monitor behind one
//!   user-action API (start / include / exclude / refresh / send / quit)
//! - [`channel`] — the group transport contract the embedder provides
//! - [`timer`] — cancellable tick-based timers with a deterministic
//!   virtual implementation for tests
//! - [`monitor`] — full-ack warning and active-ack monitoring
//! - [`keystore`] — session key generations for trial decryption

pub mod channel;
pub mod keystore;
pub mod monitor;
pub mod session;
pub mod timer;

/// Error types for session actions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Key agreement or membership failure.
    #[error(transparent)]
    Greet(#[from] mpenc_greet::GreetError),

    /// Wire-level failure on an outbound packet.
    #[error(transparent)]
    Codec(#[from] mpenc_codec::CodecError),

    /// Transcript contract violation on our own data.
    #[error(transparent)]
    Transcript(#[from] mpenc_transcript::TranscriptError),

    /// The action is not available in the current state.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Internal inconsistency; the session moved to the error state.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
