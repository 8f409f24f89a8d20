//! Payload message security.
//!
//! Chat payloads are padded, encrypted with AES-128-CBC under the leading
//! 16 bytes of the group key, and wrapped in a signed envelope whose first
//! TLV is a one-byte session-key hint:
//!
//! ```text
//! sidkey_hint ‖ signature ‖ version ‖ type ‖ iv ‖ ciphertext
//! ```
//!
//! The decrypted plaintext is itself a TLV stream: the sender's claimed
//! transcript parents followed by either a payload body or an explicit ack
//! marker.
//!
//! ## Padding
//!
//! The payload is terminated with a single 0xFF byte and zero-filled up to
//! the smallest power of two that accommodates it, but never below the
//! configured minimum (default 128). A minimum of 0 disables exponential
//! padding; the payload is then zero-filled to the AES block only. Unpadding
//! strips trailing zeros and the 0xFF terminator, so the scheme is injective
//! for every payload length.

use mpenc_crypto::ed25519::{SigningKey, VerifyingKey};
use mpenc_crypto::{aescbc, random};
use mpenc_types::{GroupKey, Hash, MessageId, UserId};

use crate::packet::{seal, Envelope, PacketKind};
use crate::tlv::{self, types, Tlv, TlvReader};
use crate::wire;
use crate::{CodecError, Result};

/// Default minimum padded payload size in bytes.
pub const DEFAULT_PADDING_SIZE: usize = 128;

/// Decrypted content of a data message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataContent {
    /// The sender's claimed latest transcript messages.
    pub parents: Vec<MessageId>,
    pub body: DataBody,
}

/// Body of a data message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataBody {
    /// Chat payload bytes.
    Payload(Vec<u8>),
    /// Explicit acknowledgement with no payload.
    Ack,
}

/// A parsed-but-sealed data packet awaiting trial decryption.
#[derive(Clone, Debug)]
pub struct SealedData {
    pub sidkey_hint: u8,
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
    envelope: Envelope,
}

/// Compute the session-key hint for a (session id, group key) pair.
pub fn sidkey_hint(session_id: &Hash, group_key: &GroupKey) -> u8 {
    session_id[0] ^ group_key[0]
}

/// Pad a payload for encryption.
pub fn pad(payload: &[u8], padding_size: usize) -> Vec<u8> {
    let needed = payload.len() + 1;
    let target = if padding_size == 0 {
        needed.div_ceil(aescbc::BLOCK_SIZE) * aescbc::BLOCK_SIZE
    } else {
        let mut size = padding_size.max(aescbc::BLOCK_SIZE);
        while size < needed {
            size *= 2;
        }
        size
    };
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(payload);
    out.push(0xFF);
    out.resize(target, 0x00);
    out
}

/// Remove padding, returning the original payload.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    let end = padded
        .iter()
        .rposition(|&b| b != 0x00)
        .ok_or_else(|| CodecError::Decryption("padding is all zeros".into()))?;
    if padded[end] != 0xFF {
        return Err(CodecError::Decryption(format!(
            "bad padding terminator {:#04x}",
            padded[end]
        )));
    }
    Ok(padded[..end].to_vec())
}

fn encode_content(content: &DataContent) -> Result<Vec<u8>> {
    let mut tlvs = Vec::with_capacity(content.parents.len() + 1);
    for parent in &content.parents {
        tlvs.push(Tlv::new(types::PARENT_MID, parent.as_bytes().to_vec()));
    }
    match &content.body {
        DataBody::Payload(data) => tlvs.push(Tlv::new(types::DATA_BODY, data.clone())),
        DataBody::Ack => tlvs.push(Tlv::empty(types::ACK_BODY)),
    }
    tlv::encode(&tlvs)
}

fn decode_content(plaintext: &[u8]) -> Result<DataContent> {
    let tlvs = tlv::decode(plaintext)?;
    let mut reader = TlvReader::new(&tlvs);
    let parents = reader
        .take_all(types::PARENT_MID)
        .into_iter()
        .map(|v| {
            String::from_utf8(v.to_vec())
                .map_err(|_| CodecError::Malformed("parent mid is not UTF-8".into()))
        })
        .collect::<Result<Vec<_>>>()?;
    let body = if let Some(data) = reader.take(types::DATA_BODY) {
        DataBody::Payload(data.to_vec())
    } else if reader.take(types::ACK_BODY).is_some() {
        DataBody::Ack
    } else {
        return Err(CodecError::Malformed("data message without body".into()));
    };
    if !reader.finished() {
        return Err(CodecError::Malformed("trailing TLVs in data content".into()));
    }
    Ok(DataContent { parents, body })
}

/// Encrypt, sign, and armor a data message.
///
/// # Arguments
///
/// * `content` - parents and body to protect
/// * `session_id` - current ASKE session id
/// * `group_key` - current 32-byte group key (AES key is its first half)
/// * `signing_key` - the sender's session-ephemeral Ed25519 key
/// * `padding_size` - minimum padded size; 0 disables exponential padding
pub fn encode_data_message(
    content: &DataContent,
    session_id: &Hash,
    group_key: &GroupKey,
    signing_key: &SigningKey,
    padding_size: usize,
) -> Result<String> {
    let plaintext = encode_content(content)?;
    let padded = pad(&plaintext, padding_size);

    let iv = random::bytes12();
    let mut aes_key = [0u8; aescbc::KEY_SIZE];
    aes_key.copy_from_slice(&group_key[..aescbc::KEY_SIZE]);
    let ciphertext =
        aescbc::encrypt(&aes_key, &iv, &padded).map_err(|e| CodecError::Decryption(e.to_string()))?;

    let body = vec![
        Tlv::new(types::MESSAGE_IV, iv.to_vec()),
        Tlv::new(types::DATA_MESSAGE, ciphertext),
    ];
    let hint = sidkey_hint(session_id, group_key);
    let bytes = seal(Some(hint), PacketKind::Data, &body, signing_key)?;
    Ok(wire::armor(&bytes))
}

impl SealedData {
    /// Parse an unarmored data packet.
    pub fn parse(tlv_bytes: &[u8]) -> Result<Self> {
        let envelope = Envelope::parse(tlv_bytes)?;
        if envelope.kind != PacketKind::Data {
            return Err(CodecError::Malformed("not a data packet".into()));
        }
        let sidkey_hint = envelope
            .sidkey_hint
            .ok_or_else(|| CodecError::Malformed("data packet without sidkey hint".into()))?;

        let mut reader = TlvReader::new(&envelope.body);
        let iv: [u8; 12] = reader
            .expect(types::MESSAGE_IV)?
            .try_into()
            .map_err(|_| CodecError::Malformed("IV must be 12 bytes".into()))?;
        let ciphertext = reader.expect(types::DATA_MESSAGE)?.to_vec();
        if !reader.finished() {
            return Err(CodecError::Malformed("trailing TLVs in data packet".into()));
        }

        Ok(Self {
            sidkey_hint,
            iv,
            ciphertext,
            envelope,
        })
    }

    /// Verify the packet signature against the sender's ephemeral key.
    pub fn verify(&self, sender_key: &VerifyingKey) -> Result<()> {
        self.envelope.verify(sender_key)
    }

    /// Attempt decryption under one (session id, group key) candidate.
    ///
    /// The caller iterates candidates whose hint matches; a wrong key within
    /// a matching hint surfaces as a `Decryption` error.
    pub fn open(&self, session_id: &Hash, group_key: &GroupKey) -> Result<DataContent> {
        if sidkey_hint(session_id, group_key) != self.sidkey_hint {
            return Err(CodecError::Decryption("sidkey hint mismatch".into()));
        }
        let mut aes_key = [0u8; aescbc::KEY_SIZE];
        aes_key.copy_from_slice(&group_key[..aescbc::KEY_SIZE]);
        let padded = aescbc::decrypt(&aes_key, &self.iv, &self.ciphertext)
            .map_err(|e| CodecError::Decryption(e.to_string()))?;
        let plaintext = unpad(&padded)?;
        decode_content(&plaintext)
    }
}

/// Message id of a wire packet: lowercase hex of its SHA-256.
pub fn message_id(wire_str: &str) -> MessageId {
    hex::encode(mpenc_crypto::hash::sha256(wire_str.as_bytes()))
}

/// Errors surfaced to the embedding application when a packet had to be
/// dropped; kept alongside the codec so the session can log uniformly.
pub fn drop_reason(sender: &UserId, err: &CodecError) -> String {
    format!("dropped packet from {sender}: {err}")
}
