//! Signed packet envelope and greet packet fields.
//!
//! Every binary packet opens with an Ed25519 signature TLV covering every
//! subsequent TLV byte-for-byte, followed by the protocol version and the
//! packet kind. Data messages additionally prefix a session-key hint in
//! front of the signature (see [`crate::message`]).

use serde::{Deserialize, Serialize};

use mpenc_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use mpenc_crypto::x25519::DhPoint;
use mpenc_types::{MessageId, Nonce, UserId, PROTOCOL_VERSION};

use crate::tlv::{self, types, Tlv, TlvReader};
use crate::{CodecError, Result};

/// Packet kind discriminant carried in the `MESSAGE_TYPE` TLV.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Data,
    Greet,
    Error,
}

impl PacketKind {
    pub fn to_u16(self) -> u16 {
        match self {
            PacketKind::Data => 0x0001,
            PacketKind::Greet => 0x0002,
            PacketKind::Error => 0x0003,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0x0001 => Ok(PacketKind::Data),
            0x0002 => Ok(PacketKind::Greet),
            0x0003 => Ok(PacketKind::Error),
            other => Err(CodecError::Malformed(format!(
                "unknown message type {other:#06x}"
            ))),
        }
    }
}

/// Key agreement kind of a greet packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agreement {
    Initial,
    Auxiliary,
}

/// Flow direction of a greet packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Upflow,
    Downflow,
}

/// Server-order metadata attached to membership operation packets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMetadata {
    /// Packet id of the previous final packet.
    pub prev_pf: [u8; 32],
    /// Chain hash after the previous final packet.
    pub prev_ch: [u8; 32],
    /// Claimed sender of the previous final packet.
    pub prev_sender: UserId,
    /// Claimed latest transcript parents at the time of sending.
    pub parent_mids: Vec<MessageId>,
}

/// A decoded greet packet: one CLIQUES message and one ASKE message merged
/// into a single signed envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetPacket {
    pub source: UserId,
    /// Empty on broadcast.
    pub dest: Option<UserId>,
    pub agreement: Agreement,
    pub flow: Flow,
    pub members: Vec<UserId>,
    pub int_keys: Vec<DhPoint>,
    pub nonces: Vec<Nonce>,
    pub pub_keys: Vec<VerifyingKey>,
    pub session_signature: Option<Signature>,
    /// Present on packets that open or close a membership operation.
    pub metadata: Option<OpMetadata>,
}

/// A parsed signed envelope, signature not yet verified.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Leading sidkey hint, present on data messages only.
    pub sidkey_hint: Option<u8>,
    pub signature: Signature,
    /// The exact bytes the signature covers.
    pub signed_bytes: Vec<u8>,
    pub kind: PacketKind,
    /// TLVs following `MESSAGE_TYPE`.
    pub body: Vec<Tlv>,
}

impl Envelope {
    /// Parse an unarmored TLV stream into a signed envelope.
    pub fn parse(tlv_bytes: &[u8]) -> Result<Self> {
        let tlvs = tlv::decode(tlv_bytes)?;
        let mut reader = TlvReader::new(&tlvs);

        let sidkey_hint = match reader.take(types::SIDKEY_HINT) {
            Some([hint]) => Some(*hint),
            Some(other) => {
                return Err(CodecError::Malformed(format!(
                    "sidkey hint must be 1 byte, got {}",
                    other.len()
                )))
            }
            None => None,
        };

        let signature = Signature::from_slice(reader.expect(types::SIGNATURE)?)
            .map_err(|_| CodecError::Malformed("signature must be 64 bytes".into()))?;

        // Everything after the signature TLV is covered by it.
        let hint_len = if sidkey_hint.is_some() { 4 + 1 } else { 0 };
        let sig_len = 4 + 64;
        let signed_bytes = tlv_bytes[hint_len + sig_len..].to_vec();

        let version = reader.expect(types::PROTOCOL_VERSION)?;
        if version != [PROTOCOL_VERSION] {
            return Err(CodecError::UnsupportedVersion(
                version.first().copied().unwrap_or(0),
            ));
        }

        let kind_bytes = reader.expect(types::MESSAGE_TYPE)?;
        let kind_arr: [u8; 2] = kind_bytes
            .try_into()
            .map_err(|_| CodecError::Malformed("message type must be 2 bytes".into()))?;
        let kind = PacketKind::from_u16(u16::from_be_bytes(kind_arr))?;

        let mut body = Vec::new();
        while let Some(ty) = reader.peek() {
            // Re-read through the reader to keep position bookkeeping simple.
            let value = reader.expect(ty)?;
            body.push(Tlv::new(ty, value));
        }

        Ok(Self {
            sidkey_hint,
            signature,
            signed_bytes,
            kind,
            body,
        })
    }

    /// Verify the envelope signature against a sender key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        key.verify(&self.signed_bytes, &self.signature)
            .map_err(|_| CodecError::Verification)
    }
}

/// Serialize and sign a packet: `[hint?] ‖ SIGNATURE ‖ version ‖ kind ‖ body`.
pub fn seal(
    sidkey_hint: Option<u8>,
    kind: PacketKind,
    body: &[Tlv],
    signing_key: &SigningKey,
) -> Result<Vec<u8>> {
    let mut covered = vec![
        Tlv::new(types::PROTOCOL_VERSION, vec![PROTOCOL_VERSION]),
        Tlv::new(types::MESSAGE_TYPE, kind.to_u16().to_be_bytes().to_vec()),
    ];
    covered.extend_from_slice(body);
    let covered_bytes = tlv::encode(&covered)?;

    let signature = signing_key.sign(&covered_bytes);

    let mut out = Vec::new();
    if let Some(hint) = sidkey_hint {
        out.extend_from_slice(&tlv::encode(&[Tlv::new(types::SIDKEY_HINT, vec![hint])])?);
    }
    out.extend_from_slice(&tlv::encode(&[Tlv::new(
        types::SIGNATURE,
        signature.to_bytes().to_vec(),
    )])?);
    out.extend_from_slice(&covered_bytes);
    Ok(out)
}

impl GreetPacket {
    /// Encode the greet fields as body TLVs, in pinned order.
    pub fn to_body(&self) -> Vec<Tlv> {
        let mut body = vec![
            Tlv::new(types::SOURCE, self.source.as_bytes().to_vec()),
            match &self.dest {
                Some(dest) => Tlv::new(types::DEST, dest.as_bytes().to_vec()),
                None => Tlv::empty(types::DEST),
            },
            Tlv::new(
                types::AGREEMENT,
                vec![match self.agreement {
                    Agreement::Initial => 0x00,
                    Agreement::Auxiliary => 0x01,
                }],
            ),
            Tlv::new(
                types::FLOW,
                vec![match self.flow {
                    Flow::Upflow => 0x00,
                    Flow::Downflow => 0x01,
                }],
            ),
        ];
        for member in &self.members {
            body.push(Tlv::new(types::MEMBER, member.as_bytes().to_vec()));
        }
        for key in &self.int_keys {
            body.push(Tlv::new(types::INT_KEY, key.to_bytes().to_vec()));
        }
        for nonce in &self.nonces {
            body.push(Tlv::new(types::NONCE, nonce.to_vec()));
        }
        for key in &self.pub_keys {
            body.push(Tlv::new(types::PUB_KEY, key.to_bytes().to_vec()));
        }
        if let Some(sig) = &self.session_signature {
            body.push(Tlv::new(types::SESSION_SIGNATURE, sig.to_bytes().to_vec()));
        }
        if let Some(meta) = &self.metadata {
            body.push(Tlv::new(types::PREV_PF, meta.prev_pf.to_vec()));
            body.push(Tlv::new(types::PREV_CH, meta.prev_ch.to_vec()));
            body.push(Tlv::new(
                types::PREV_SENDER,
                meta.prev_sender.as_bytes().to_vec(),
            ));
            for mid in &meta.parent_mids {
                body.push(Tlv::new(types::PARENT_MID, mid.as_bytes().to_vec()));
            }
        }
        body
    }

    /// Seal a greet packet with the sender's ephemeral signing key.
    pub fn seal(&self, signing_key: &SigningKey) -> Result<Vec<u8>> {
        seal(None, PacketKind::Greet, &self.to_body(), signing_key)
    }

    /// Decode greet fields from an envelope body.
    pub fn from_body(body: &[Tlv]) -> Result<Self> {
        let mut reader = TlvReader::new(body);

        let source = utf8(reader.expect(types::SOURCE)?)?;
        let dest_raw = reader.expect(types::DEST)?;
        let dest = if dest_raw.is_empty() {
            None
        } else {
            Some(utf8(dest_raw)?)
        };
        let agreement = match reader.expect(types::AGREEMENT)? {
            [0x00] => Agreement::Initial,
            [0x01] => Agreement::Auxiliary,
            other => {
                return Err(CodecError::Malformed(format!(
                    "bad agreement byte {other:02x?}"
                )))
            }
        };
        let flow = match reader.expect(types::FLOW)? {
            [0x00] => Flow::Upflow,
            [0x01] => Flow::Downflow,
            other => return Err(CodecError::Malformed(format!("bad flow byte {other:02x?}"))),
        };

        let members = reader
            .take_all(types::MEMBER)
            .into_iter()
            .map(utf8)
            .collect::<Result<Vec<_>>>()?;
        let int_keys = reader
            .take_all(types::INT_KEY)
            .into_iter()
            .map(|v| DhPoint::from_slice(v).map_err(|e| CodecError::Malformed(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        let nonces = reader
            .take_all(types::NONCE)
            .into_iter()
            .map(bytes32)
            .collect::<Result<Vec<_>>>()?;
        let pub_keys = reader
            .take_all(types::PUB_KEY)
            .into_iter()
            .map(|v| {
                let arr = bytes32(v)?;
                VerifyingKey::from_bytes(&arr).map_err(|e| CodecError::Malformed(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let session_signature = reader
            .take(types::SESSION_SIGNATURE)
            .map(|v| {
                Signature::from_slice(v)
                    .map_err(|_| CodecError::Malformed("session signature must be 64 bytes".into()))
            })
            .transpose()?;

        let metadata = match reader.take(types::PREV_PF) {
            Some(prev_pf) => {
                let prev_pf = bytes32(prev_pf)?;
                let prev_ch = bytes32(reader.expect(types::PREV_CH)?)?;
                let prev_sender = utf8(reader.expect(types::PREV_SENDER)?)?;
                let parent_mids = reader
                    .take_all(types::PARENT_MID)
                    .into_iter()
                    .map(utf8)
                    .collect::<Result<Vec<_>>>()?;
                Some(OpMetadata {
                    prev_pf,
                    prev_ch,
                    prev_sender,
                    parent_mids,
                })
            }
            None => None,
        };

        if !reader.finished() {
            return Err(CodecError::Malformed("trailing TLVs in greet packet".into()));
        }

        Ok(Self {
            source,
            dest,
            agreement,
            flow,
            members,
            int_keys,
            nonces,
            pub_keys,
            session_signature,
            metadata,
        })
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CodecError::Malformed("identifier is not UTF-8".into()))
}

fn bytes32(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| CodecError::Malformed(format!("expected 32 bytes, got {}", bytes.len())))
}
