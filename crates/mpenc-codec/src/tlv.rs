//! Type-length-value framing.
//!
//! Every mpENC packet is a flat sequence of TLV records:
//!
//! ```text
//! type (u16 big-endian) ‖ length (u16 big-endian) ‖ value
//! ```
//!
//! Repeated types (members, intermediate keys, nonces, public keys, parent
//! message ids) appear once per element, in list order.

use crate::{CodecError, Result};

/// Recognized TLV type codes, in the order they appear in a signed packet.
pub mod types {
    /// First byte of session id XOR first byte of group key (data messages).
    pub const SIDKEY_HINT: u16 = 0x0001;
    /// Ed25519 signature over every subsequent TLV.
    pub const SIGNATURE: u16 = 0x0002;
    /// Protocol version byte.
    pub const PROTOCOL_VERSION: u16 = 0x0003;
    /// Packet kind discriminant (2 bytes).
    pub const MESSAGE_TYPE: u16 = 0x0004;
    /// 12-byte random IV (data messages).
    pub const MESSAGE_IV: u16 = 0x0005;
    /// Encrypted payload (data messages).
    pub const DATA_MESSAGE: u16 = 0x0006;

    /// Greet packet sender.
    pub const SOURCE: u16 = 0x0100;
    /// Greet packet recipient; empty on broadcast.
    pub const DEST: u16 = 0x0101;
    /// Agreement kind: initial or auxiliary.
    pub const AGREEMENT: u16 = 0x0102;
    /// Flow direction: upflow or downflow.
    pub const FLOW: u16 = 0x0103;
    /// Participant id, repeated per member.
    pub const MEMBER: u16 = 0x0104;
    /// GKA intermediate key, repeated.
    pub const INT_KEY: u16 = 0x0105;
    /// ASKE nonce, repeated.
    pub const NONCE: u16 = 0x0106;
    /// ASKE ephemeral public key, repeated.
    pub const PUB_KEY: u16 = 0x0107;
    /// ASKE session acknowledgement signature.
    pub const SESSION_SIGNATURE: u16 = 0x0108;
    /// Ephemeral signing key publication slot (reserved for QUIT; unused).
    pub const SIGNING_KEY: u16 = 0x0109;

    /// Membership operation metadata: previous final packet id.
    pub const PREV_PF: u16 = 0x0110;
    /// Membership operation metadata: previous chain hash.
    pub const PREV_CH: u16 = 0x0111;
    /// Membership operation metadata: claimed sender of the previous final.
    pub const PREV_SENDER: u16 = 0x0112;
    /// Claimed latest transcript parents, repeated.
    pub const PARENT_MID: u16 = 0x0113;

    /// Decrypted payload body (inner stream).
    pub const DATA_BODY: u16 = 0x0201;
    /// Explicit ack marker, empty value (inner stream).
    pub const ACK_BODY: u16 = 0x0202;
}

/// A single type-length-value record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlv {
    pub ty: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(ty: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }

    /// An empty-valued record (broadcast dest, ack body).
    pub fn empty(ty: u16) -> Self {
        Self { ty, value: Vec::new() }
    }

    /// Serialized size of this record including its header.
    pub fn wire_len(&self) -> usize {
        4 + self.value.len()
    }
}

/// Serialize a TLV sequence.
pub fn encode(tlvs: &[Tlv]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(tlvs.iter().map(Tlv::wire_len).sum());
    for tlv in tlvs {
        if tlv.value.len() > u16::MAX as usize {
            return Err(CodecError::Oversize(tlv.value.len()));
        }
        out.extend_from_slice(&tlv.ty.to_be_bytes());
        out.extend_from_slice(&(tlv.value.len() as u16).to_be_bytes());
        out.extend_from_slice(&tlv.value);
    }
    Ok(out)
}

/// Parse a complete TLV sequence; trailing garbage is an error.
pub fn decode(mut data: &[u8]) -> Result<Vec<Tlv>> {
    let total = data.len();
    let mut out = Vec::new();
    while !data.is_empty() {
        let offset = total - data.len();
        if data.len() < 4 {
            return Err(CodecError::Truncated(offset));
        }
        let ty = u16::from_be_bytes([data[0], data[1]]);
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        data = &data[4..];
        if data.len() < len {
            return Err(CodecError::Truncated(offset));
        }
        out.push(Tlv::new(ty, &data[..len]));
        data = &data[len..];
    }
    Ok(out)
}

/// Cursor over a decoded TLV sequence for in-order field extraction.
pub struct TlvReader<'a> {
    tlvs: &'a [Tlv],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(tlvs: &'a [Tlv]) -> Self {
        Self { tlvs, pos: 0 }
    }

    /// Peek the type of the next record, if any.
    pub fn peek(&self) -> Option<u16> {
        self.tlvs.get(self.pos).map(|t| t.ty)
    }

    /// Consume the next record, requiring the given type.
    pub fn expect(&mut self, ty: u16) -> Result<&'a [u8]> {
        match self.tlvs.get(self.pos) {
            Some(tlv) if tlv.ty == ty => {
                self.pos += 1;
                Ok(&tlv.value)
            }
            Some(tlv) => Err(CodecError::UnexpectedTlv {
                expected: ty,
                got: tlv.ty,
            }),
            None => Err(CodecError::Truncated(self.pos)),
        }
    }

    /// Consume the next record if it has the given type.
    pub fn take(&mut self, ty: u16) -> Option<&'a [u8]> {
        match self.tlvs.get(self.pos) {
            Some(tlv) if tlv.ty == ty => {
                self.pos += 1;
                Some(&tlv.value)
            }
            _ => None,
        }
    }

    /// Consume a run of records of the given type.
    pub fn take_all(&mut self, ty: u16) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        while let Some(value) = self.take(ty) {
            out.push(value);
        }
        out
    }

    /// True when every record has been consumed.
    pub fn finished(&self) -> bool {
        self.pos == self.tlvs.len()
    }
}
