//! AES-128-CBC payload encryption.
//!
//! mpENC encrypts chat payloads with AES-128-CBC under the first half of
//! the 32-byte group key. The wire carries a 12-byte random IV which is
//! zero-extended on the right to the 16-byte CBC width. Block alignment is
//! the caller's responsibility (the codec's padding scheme guarantees it);
//! no cipher-level padding is applied.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::{CryptoError, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Size of the IV carried on the wire.
pub const WIRE_IV_SIZE: usize = 12;

/// Expand a 12-byte wire IV to the 16-byte CBC initialization vector.
fn cbc_iv(wire_iv: &[u8; WIRE_IV_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    iv[..WIRE_IV_SIZE].copy_from_slice(wire_iv);
    iv
}

/// Encrypt block-aligned data with AES-128-CBC.
///
/// # Arguments
///
/// * `key` - 16-byte encryption key (leading half of the group key)
/// * `wire_iv` - 12-byte random IV as carried on the wire
/// * `plaintext` - Data to encrypt; length must be a multiple of 16
pub fn encrypt(key: &[u8; KEY_SIZE], wire_iv: &[u8; WIRE_IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::BlockAlignment(plaintext.len()));
    }
    let enc = Aes128CbcEnc::new(key.into(), &cbc_iv(wire_iv).into());
    Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
}

/// Decrypt AES-128-CBC ciphertext.
///
/// # Arguments
///
/// * `key` - 16-byte encryption key
/// * `wire_iv` - 12-byte IV as carried on the wire
/// * `ciphertext` - Ciphertext; length must be a multiple of 16
pub fn decrypt(key: &[u8; KEY_SIZE], wire_iv: &[u8; WIRE_IV_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % BLOCK_SIZE != 0 || ciphertext.is_empty() {
        return Err(CryptoError::BlockAlignment(ciphertext.len()));
    }
    let dec = Aes128CbcDec::new(key.into(), &cbc_iv(wire_iv).into());
    dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| CryptoError::CbcDecryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [0x42u8; KEY_SIZE];
        let iv = [0x01u8; WIRE_IV_SIZE];
        let plaintext = [0xABu8; 128];

        let ciphertext = encrypt(&key, &iv, &plaintext).expect("encrypt");
        assert_eq!(ciphertext.len(), plaintext.len());
        let decrypted = decrypt(&key, &iv, &ciphertext).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_unaligned_input_rejected() {
        let key = [0u8; KEY_SIZE];
        let iv = [0u8; WIRE_IV_SIZE];
        assert!(encrypt(&key, &iv, &[0u8; 17]).is_err());
        assert!(decrypt(&key, &iv, &[0u8; 15]).is_err());
    }

    #[test]
    fn test_empty_ciphertext_rejected() {
        let key = [0u8; KEY_SIZE];
        let iv = [0u8; WIRE_IV_SIZE];
        assert!(decrypt(&key, &iv, &[]).is_err());
    }

    #[test]
    fn test_wrong_key_garbles() {
        let key1 = [0x01u8; KEY_SIZE];
        let key2 = [0x02u8; KEY_SIZE];
        let iv = [0x03u8; WIRE_IV_SIZE];
        let plaintext = [0x55u8; 32];

        let ciphertext = encrypt(&key1, &iv, &plaintext).expect("encrypt");
        let decrypted = decrypt(&key2, &iv, &ciphertext).expect("decrypt");
        assert_ne!(decrypted, plaintext);
    }

    #[test]
    fn test_iv_affects_first_block() {
        let key = [0x01u8; KEY_SIZE];
        let plaintext = [0u8; 32];

        let ct1 = encrypt(&key, &[0x01u8; WIRE_IV_SIZE], &plaintext).expect("encrypt");
        let ct2 = encrypt(&key, &[0x02u8; WIRE_IV_SIZE], &plaintext).expect("encrypt");
        assert_ne!(ct1[..BLOCK_SIZE], ct2[..BLOCK_SIZE]);
    }

    #[test]
    fn test_nist_cbc_vector() {
        // NIST SP 800-38A F.2.1 key and plaintext, with the vector's IV
        // reduced to our 12-byte wire width (remaining 4 bytes zero), so
        // this pins our own construction: deterministic ciphertext that
        // round-trips.
        let key = hex_literal::hex!("2b7e151628aed2a6abf7158809cf4f3c");
        let iv = hex_literal::hex!("000102030405060708090a0b");
        let plaintext = hex_literal::hex!("6bc1bee22e409f96e93d7e117393172a");

        let ct_a = encrypt(&key, &iv, &plaintext).expect("encrypt");
        let ct_b = encrypt(&key, &iv, &plaintext).expect("encrypt");
        assert_eq!(ct_a, ct_b);
        assert_eq!(decrypt(&key, &iv, &ct_a).expect("decrypt"), plaintext);
    }
}
