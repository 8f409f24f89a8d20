//! Server-ordered acceptance of membership packets.
//!
//! Membership operations are delimited by an initial packet (pI) and a
//! final packet (pF); exclusion and refresh close in a single packet that
//! is both. Every accepted boundary packet gets a packet id and extends a
//! chained hash, so any two members that accepted the same prefix computed
//! identical chains:
//!
//! ```text
//! pid = SHA-256(sender ‖ "\n" ‖ sort(others) ‖ "\n\n" ‖ packet)
//! chain[i] = SHA-256(chain[i-1] ‖ pid ‖ type)
//! ```
//!
//! Initial packets carry the previous final's pid and chain hash; final
//! packets carry their operation's initial pid in the same slot. A member
//! that has not yet synced adopts the chain from the first initial packet
//! that includes it and whose claimed previous final has not been ruled
//! out.

use std::collections::BTreeSet;

use mpenc_codec::packet::OpMetadata;
use mpenc_crypto::hash;
use mpenc_types::{Hash, UserId, SERVER_SENDER};

/// Content of the locally-generated leave pseudo-packet.
const LEAVE_MARKER: &[u8] = b"\xffleave";

/// Position of a packet within a membership operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    Final,
    Both,
}

impl PacketType {
    fn byte(self) -> u8 {
        match self {
            PacketType::Initial => 0x01,
            PacketType::Final => 0x02,
            PacketType::Both => 0x03,
        }
    }

    pub fn has_initial(self) -> bool {
        matches!(self, PacketType::Initial | PacketType::Both)
    }

    pub fn has_final(self) -> bool {
        matches!(self, PacketType::Final | PacketType::Both)
    }
}

/// Packet id over the wire packet and its channel context.
pub fn packet_id(sender: &UserId, channel_members: &[UserId], packet: &[u8]) -> Hash {
    let mut others: Vec<&UserId> = channel_members.iter().filter(|m| *m != sender).collect();
    others.sort();
    let mut parts: Vec<&[u8]> = vec![sender.as_bytes(), b"\n"];
    for (i, other) in others.iter().enumerate() {
        if i > 0 {
            parts.push(b"\n");
        }
        parts.push(other.as_bytes());
    }
    parts.push(b"\n\n");
    parts.push(packet);
    hash::sha256_parts(&parts)
}

/// Next chain hash from the previous one and an accepted packet.
pub fn chain_hash(prev: &Hash, pid: &Hash, ptype: PacketType) -> Hash {
    hash::sha256_parts(&[prev, pid, &[ptype.byte()]])
}

/// Tracker for server-ordered membership packets.
pub struct ServerOrder {
    packet_ids: Vec<Hash>,
    chain_hashes: Vec<Hash>,
    chain_unacked: Vec<BTreeSet<UserId>>,
    op_initial: Vec<Hash>,
    op_metadata: Vec<OpMetadata>,
    op_metadata_authenticated: Vec<bool>,
    op_final: Vec<Hash>,
    synced: bool,
    prev_pf: Hash,
    prev_ch: Hash,
    seen: BTreeSet<Hash>,
    ruled_out: BTreeSet<Hash>,
    rejected: Vec<(UserId, Hash)>,
}

impl Default for ServerOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerOrder {
    /// An unsynced tracker; the chain bootstraps from the first relevant
    /// initial packet.
    pub fn new() -> Self {
        Self {
            packet_ids: Vec::new(),
            chain_hashes: Vec::new(),
            chain_unacked: Vec::new(),
            op_initial: Vec::new(),
            op_metadata: Vec::new(),
            op_metadata_authenticated: Vec::new(),
            op_final: Vec::new(),
            synced: false,
            prev_pf: [0u8; 32],
            prev_ch: [0u8; 32],
            seen: BTreeSet::new(),
            ruled_out: BTreeSet::new(),
            rejected: Vec::new(),
        }
    }

    /// A tracker for a channel we created ourselves: synced, empty history.
    pub fn new_channel() -> Self {
        let mut order = Self::new();
        order.synced = true;
        order
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// An operation is ongoing iff more initials than finals were accepted.
    pub fn has_ongoing_op(&self) -> bool {
        self.op_initial.len() > self.op_final.len()
    }

    /// The metadata base for the next packet we send: the last final pid
    /// (or the ongoing op's initial pid for a closing packet) and the
    /// current chain hash.
    pub fn metadata_base(&self) -> (Hash, Hash) {
        (self.prev_pf, self.prev_ch)
    }

    /// The ongoing operation's initial pid, if any.
    pub fn ongoing_initial(&self) -> Option<&Hash> {
        if self.has_ongoing_op() {
            self.op_initial.last()
        } else {
            None
        }
    }

    pub fn packet_ids(&self) -> &[Hash] {
        &self.packet_ids
    }

    pub fn chain_hashes(&self) -> &[Hash] {
        &self.chain_hashes
    }

    /// Senders whose boundary packets were rejected, with the pids.
    pub fn rejected(&self) -> &[(UserId, Hash)] {
        &self.rejected
    }

    /// Members that have not yet confirmed a given accepted packet.
    pub fn unacked_for(&self, pid: &Hash) -> Option<&BTreeSet<UserId>> {
        let idx = self.packet_ids.iter().position(|p| p == pid)?;
        self.chain_unacked.get(idx)
    }

    /// Record that a member confirmed the chain up to our current view.
    pub fn ack_chain(&mut self, member: &UserId) {
        for unacked in &mut self.chain_unacked {
            unacked.remove(member);
        }
    }

    /// Mark the ongoing operation's metadata as verified against the
    /// packet signature.
    pub fn authenticate_metadata(&mut self) {
        if let Some(last) = self.op_metadata_authenticated.last_mut() {
            *last = true;
        }
    }

    fn record(
        &mut self,
        ptype: PacketType,
        pid: Hash,
        sender: &UserId,
        channel_members: &[UserId],
    ) {
        self.seen.insert(pid);
        let prev = self.chain_hashes.last().copied().unwrap_or(self.prev_ch);
        self.chain_hashes.push(chain_hash(&prev, &pid, ptype));
        self.packet_ids.push(pid);
        self.chain_unacked.push(
            channel_members
                .iter()
                .filter(|m| *m != sender)
                .cloned()
                .collect(),
        );
        if ptype.has_final() {
            self.prev_pf = pid;
            self.prev_ch = *self.chain_hashes.last().unwrap_or(&[0u8; 32]);
            self.op_final.push(pid);
        }
    }

    fn reject(&mut self, sender: &UserId, pid: Hash, reason: &str) -> bool {
        tracing::warn!(sender = %sender, pid = %hex::encode(pid), reason, "rejecting membership packet");
        self.rejected.push((sender.clone(), pid));
        false
    }

    /// Try to accept an operation-opening packet. Returns whether the
    /// packet was accepted; rejected packets note their sender.
    pub fn accept_initial(
        &mut self,
        ptype: PacketType,
        pid: Hash,
        sender: &UserId,
        channel_members: &[UserId],
        metadata: &OpMetadata,
        includes_self: bool,
    ) -> bool {
        debug_assert!(ptype.has_initial());
        if !self.synced {
            if includes_self && !self.ruled_out.contains(&metadata.prev_pf) {
                // Bootstrap our chain onto the sender's claimed position.
                self.synced = true;
                self.prev_pf = metadata.prev_pf;
                self.prev_ch = metadata.prev_ch;
                tracing::debug!(pid = %hex::encode(pid), "bootstrapping chain from first relevant initial packet");
            } else {
                self.ruled_out.insert(metadata.prev_pf);
                return self.reject(sender, pid, "not synced");
            }
        }
        if self.seen.contains(&pid) {
            return self.reject(sender, pid, "duplicate packet");
        }
        if self.has_ongoing_op() {
            return self.reject(sender, pid, "operation already ongoing");
        }
        if metadata.prev_pf != self.prev_pf {
            return self.reject(sender, pid, "does not follow our last final packet");
        }

        self.op_initial.push(pid);
        self.op_metadata.push(metadata.clone());
        self.op_metadata_authenticated.push(false);
        self.record(ptype, pid, sender, channel_members);
        true
    }

    /// Try to accept an operation-closing packet. The claimed previous
    /// boundary must be the ongoing operation's initial pid.
    pub fn accept_final(
        &mut self,
        pid: Hash,
        sender: &UserId,
        channel_members: &[UserId],
        claimed_prev_pi: &Hash,
    ) -> bool {
        if !self.synced {
            return self.reject(sender, pid, "not synced");
        }
        if self.seen.contains(&pid) {
            return self.reject(sender, pid, "duplicate packet");
        }
        let Some(ongoing) = self.ongoing_initial().copied() else {
            return self.reject(sender, pid, "no ongoing operation");
        };
        if *claimed_prev_pi != ongoing {
            return self.reject(sender, pid, "does not close the ongoing operation");
        }
        self.record(PacketType::Final, pid, sender, channel_members);
        true
    }

    /// Accept a locally-generated leave pseudo-packet for members the
    /// channel evicted. Returns its pid.
    pub fn accept_leave(&mut self, leavers: &[UserId], channel_members: &[UserId]) -> Hash {
        let mut sorted: Vec<&UserId> = leavers.iter().collect();
        sorted.sort();
        let mut content = LEAVE_MARKER.to_vec();
        for leaver in sorted {
            content.push(b'\n');
            content.extend_from_slice(leaver.as_bytes());
        }
        let server = SERVER_SENDER.to_string();
        let pid = packet_id(&server, channel_members, &content);

        let ptype = if self.has_ongoing_op() {
            PacketType::Final
        } else {
            PacketType::Both
        };
        if ptype == PacketType::Both {
            self.op_initial.push(pid);
            self.op_metadata.push(OpMetadata {
                prev_pf: self.prev_pf,
                prev_ch: self.prev_ch,
                prev_sender: server.clone(),
                parent_mids: Vec::new(),
            });
            self.op_metadata_authenticated.push(true);
        }
        self.record(ptype, pid, &server, channel_members);
        tracing::debug!(leavers = ?leavers, pid = %hex::encode(pid), "accepted leave pseudo-packet");
        pid
    }
}
