//! # mpenc-crypto
//!
//! Cryptographic primitives for the mpENC protocol core.
//!
//! The cryptographic suite is fixed; no algorithm negotiation is permitted:
//!
//! - [`ed25519`] — Ed25519 signing and verification (RFC 8032) for the
//!   long-term identity keys and the per-session ephemeral keys
//! - [`x25519`] — Curve25519 scalar multiplication (RFC 7748) driving the
//!   CLIQUES group key agreement
//! - [`aescbc`] — AES-128-CBC payload encryption
//! - [`hash`] — SHA-256 and SHA-512 digests
//! - [`random`] — OS randomness for nonces, scalars, and IVs

pub mod aescbc;
pub mod ed25519;
pub mod hash;
pub mod random;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// CBC decryption failed (malformed ciphertext).
    #[error("CBC decryption failed")]
    CbcDecryption,

    /// Input is not aligned to the cipher block size.
    #[error("input not block aligned: {0} bytes")]
    BlockAlignment(usize),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
