//! # mpenc-greet
//!
//! Membership and key agreement for mpENC sessions.
//!
//! - [`cliques`] — CLIQUES iterated Diffie-Hellman group key agreement
//!   over Curve25519 (initial agreement, auxiliary join/exclude/refresh)
//! - [`aske`] — authenticated signature key exchange binding per-session
//!   ephemeral Ed25519 keys to long-term identities
//! - [`greeter`] — the composite upflow/downflow state machine merging
//!   both sub-protocols into single signed packets
//! - [`serverorder`] — server-ordered acceptance of membership packets
//!   via packet ids and chained hashes

pub mod aske;
pub mod cliques;
pub mod greeter;
pub mod serverorder;

use mpenc_crypto::ed25519::VerifyingKey;
use mpenc_types::UserId;

/// Read-only directory of long-term identity keys.
pub trait KeyDirectory {
    /// Look up a member's long-term Ed25519 public key.
    fn lookup(&self, user: &UserId) -> Option<VerifyingKey>;
}

impl KeyDirectory for std::collections::BTreeMap<UserId, VerifyingKey> {
    fn lookup(&self, user: &UserId) -> Option<VerifyingKey> {
        self.get(user).cloned()
    }
}

/// Error types for key agreement and membership operations.
#[derive(Debug, thiserror::Error)]
pub enum GreetError {
    /// Caller-supplied members are invalid (duplicates, empty set,
    /// excluding self, unknown member).
    #[error("invalid argument: {0}")]
    Argument(String),

    /// A packet or transition violates the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A session signature failed to verify or a key is missing.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Wire-level encode/decode failure.
    #[error(transparent)]
    Codec(#[from] mpenc_codec::CodecError),
}

pub type Result<T> = std::result::Result<T, GreetError>;
