//! # mpenc-types
//!
//! Shared domain types used across the mpENC workspace.

pub mod events;

/// Participant identifier, assigned by the embedding application.
pub type UserId = String;

/// Transcript message identifier (lowercase hex of a SHA-256 digest).
pub type MessageId = String;

/// 32-byte digest or key material.
pub type Hash = [u8; 32];

/// Shared group key as derived by the key agreement.
pub type GroupKey = [u8; 32];

/// Per-session, per-member nonce.
pub type Nonce = [u8; 32];

/// Wire protocol version carried in every packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// Synthetic sender id for channel-generated leave pseudo-packets.
pub const SERVER_SENDER: &str = "__server__";
