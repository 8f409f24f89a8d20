//! # mpenc-codec
//!
//! Wire codec for the mpENC protocol.
//!
//! - [`tlv`] — type-length-value framing (u16 big-endian type and length)
//! - [`wire`] — `?mpENC:` base64 armor, query strings, inbound classification
//! - [`packet`] — the signed packet envelope and greet packet fields
//! - [`message`] — payload padding, AES-128-CBC message security, trial
//!   decryption across session/key generations
//!
//! The bit-exact layouts (TLV type codes, armor prefix, padding scheme,
//! sidkey hint) are pinned by tests in each module.

pub mod message;
pub mod packet;
pub mod tlv;
pub mod wire;

/// Error types for encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// TLV stream ended inside a header or value.
    #[error("truncated TLV stream at offset {0}")]
    Truncated(usize),

    /// A value does not fit the u16 length field.
    #[error("TLV value too large: {0} bytes")]
    Oversize(usize),

    /// A required TLV is missing or out of order.
    #[error("expected TLV type {expected:#06x}, got {got:#06x}")]
    UnexpectedTlv { expected: u16, got: u16 },

    /// Structurally invalid packet.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Unknown protocol version byte.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// The packet signature did not verify.
    #[error("packet signature verification failed")]
    Verification,

    /// No session/group-key candidate decrypted the message.
    #[error("decryption failed: {0}")]
    Decryption(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;
