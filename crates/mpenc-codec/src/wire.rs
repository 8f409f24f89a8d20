//! Wire armor and plaintext negotiation strings.
//!
//! A packet on the wire is the literal string
//! `"?mpENC:" ‖ base64(tlv stream) ‖ "."`. Plaintext query and
//! auto-response strings negotiate with legacy peers and pass through the
//! codec untouched.

use base64::Engine;

use crate::{CodecError, Result};

/// Armor prefix for binary packets.
pub const WIRE_PREFIX: &str = "?mpENC:";

/// Armor terminator.
pub const WIRE_SUFFIX: &str = ".";

/// Plaintext query inviting a peer to start an mpENC session.
pub const QUERY_MESSAGE: &str = "?mpENC?v1?";

/// Plaintext auto-response sent when unencrypted chat arrives mid-session.
pub const PLAIN_AUTO_RESPONSE: &str =
    "This chat is secured with mpENC; plaintext messages are not shown to the group.";

/// Classification of an inbound channel string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireInbound {
    /// A binary mpENC packet (decoded TLV stream bytes).
    Packet(Vec<u8>),
    /// An mpENC session query from a legacy-capable peer.
    Query,
    /// Anything else; passed through untouched.
    Plain(String),
}

/// Armor a TLV stream for the wire.
pub fn armor(tlv_bytes: &[u8]) -> String {
    let mut out = String::with_capacity(WIRE_PREFIX.len() + tlv_bytes.len() * 4 / 3 + 8);
    out.push_str(WIRE_PREFIX);
    out.push_str(&base64::engine::general_purpose::STANDARD.encode(tlv_bytes));
    out.push_str(WIRE_SUFFIX);
    out
}

/// Strip the armor from a wire string and return the TLV stream bytes.
pub fn unarmor(wire: &str) -> Result<Vec<u8>> {
    let body = wire
        .strip_prefix(WIRE_PREFIX)
        .and_then(|rest| rest.strip_suffix(WIRE_SUFFIX))
        .ok_or_else(|| CodecError::Malformed("missing wire armor".into()))?;
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| CodecError::Malformed(format!("bad base64: {e}")))
}

/// Classify an inbound channel string.
pub fn classify(wire: &str) -> WireInbound {
    if wire == QUERY_MESSAGE {
        return WireInbound::Query;
    }
    if wire.starts_with(WIRE_PREFIX) {
        match unarmor(wire) {
            Ok(bytes) => return WireInbound::Packet(bytes),
            Err(_) => return WireInbound::Plain(wire.to_string()),
        }
    }
    WireInbound::Plain(wire.to_string())
}
