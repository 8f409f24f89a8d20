//! Curve25519 scalar multiplication (RFC 7748).
//!
//! The CLIQUES group key agreement treats intermediate keys as raw curve
//! points (Montgomery u-coordinates) and repeatedly multiplies them with
//! per-member private scalars. Scalars are clamped per RFC 7748 before use
//! (low three bits cleared, high bit cleared, second-highest bit set);
//! `x25519-dalek` applies the clamp during multiplication.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// A private ECDH scalar contribution.
///
/// Exclusively owned by its member; rotated on every auxiliary key
/// agreement and wiped on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct DhScalar {
    inner: StaticSecret,
}

/// A Curve25519 group element (32-byte Montgomery u-coordinate).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhPoint {
    bytes: [u8; 32],
}

impl DhScalar {
    /// Generate a fresh random scalar.
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Get the raw bytes of this scalar.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Multiply an arbitrary group element by this scalar.
    pub fn mult(&self, point: &DhPoint) -> DhPoint {
        let pk = PublicKey::from(point.bytes);
        let shared = self.inner.diffie_hellman(&pk);
        DhPoint {
            bytes: *shared.as_bytes(),
        }
    }

    /// Multiply the curve base point by this scalar.
    pub fn mult_base(&self) -> DhPoint {
        let pk = PublicKey::from(&self.inner);
        DhPoint {
            bytes: pk.to_bytes(),
        }
    }
}

impl DhPoint {
    /// The curve generator (u = 9).
    pub fn generator() -> Self {
        let mut bytes = [0u8; 32];
        bytes[0] = 9;
        Self { bytes }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Create from a byte slice of exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes: arr })
    }

    /// Get the raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// Get the raw bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for DhScalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhScalar").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mult_base_matches_generator_mult() {
        let scalar = DhScalar::random();
        assert_eq!(scalar.mult_base(), scalar.mult(&DhPoint::generator()));
    }

    #[test]
    fn test_scalar_mult_commutes() {
        // (a * (b * G)) == (b * (a * G)), the property every GKA round
        // relies on.
        let a = DhScalar::random();
        let b = DhScalar::random();
        let ab = a.mult(&b.mult_base());
        let ba = b.mult(&a.mult_base());
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_three_party_product_is_order_independent() {
        let a = DhScalar::random();
        let b = DhScalar::random();
        let c = DhScalar::random();
        let abc = c.mult(&b.mult(&a.mult_base()));
        let cba = a.mult(&b.mult(&c.mult_base()));
        assert_eq!(abc, cba);
    }

    #[test]
    fn test_from_bytes_roundtrip() {
        let scalar = DhScalar::random();
        let bytes = scalar.to_bytes();
        let restored = DhScalar::from_bytes(bytes);
        assert_eq!(scalar.mult_base(), restored.mult_base());
    }

    #[test]
    fn test_point_from_slice_rejects_bad_length() {
        assert!(DhPoint::from_slice(&[0u8; 31]).is_err());
        assert!(DhPoint::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_rfc7748_section6_1() {
        // RFC 7748 section 6.1 test vector: Alice's private -> public.
        let alice_private =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .expect("valid hex");
        let alice_public =
            hex::decode("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
                .expect("valid hex");

        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(&alice_private);
        let computed = DhScalar::from_bytes(secret_bytes).mult_base();
        assert_eq!(computed.as_bytes().as_slice(), alice_public.as_slice());
    }
}
