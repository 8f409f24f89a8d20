//! SHA-256 and SHA-512 digests.
//!
//! Session ids, packet ids, chain hashes, and message ids are all SHA-256;
//! SHA-512 is kept for parity with the Ed25519 internals and future key
//! derivation. Multi-part helpers hash the exact concatenation of their
//! inputs, so the byte sequence entering the digest is always explicit at
//! the call site.

use sha2::{Digest, Sha256, Sha512};

/// SHA-256 of a byte string.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of the concatenation of several byte strings.
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-512 of a byte string.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}
