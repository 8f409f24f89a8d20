//! OS randomness for nonces, scalars, and IVs.

use rand::RngCore;

/// Fill a buffer with OS randomness.
pub fn fill(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf);
}

/// 32 random bytes (nonces, key seeds).
pub fn bytes32() -> [u8; 32] {
    let mut buf = [0u8; 32];
    fill(&mut buf);
    buf
}

/// 12 random bytes (message IVs).
pub fn bytes12() -> [u8; 12] {
    let mut buf = [0u8; 12];
    fill(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_draws() {
        // Two 256-bit draws colliding would indicate a broken RNG.
        assert_ne!(bytes32(), bytes32());
    }

    #[test]
    fn test_fill_covers_buffer() {
        let mut buf = [0u8; 64];
        fill(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
