//! Arena-backed causal DAG store.
//!
//! Messages are stored in an append-only arena indexed by message id, so
//! cyclic references are structurally impossible. Each node keeps a
//! context map (per author, the highest author-index among its ancestors
//! including itself) which answers the causal order in O(1), and an
//! `unack_by` set tracking which intended recipients have yet to author a
//! descendant.
//!
//! Acks do not cross messages the acking member could not read: the
//! ancestor walk on insert only descends through nodes whose readers (or
//! author) include the new message's author.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use mpenc_types::{MessageId, UserId};

use crate::{Result, TranscriptError};

/// Body of a transcript message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Decrypted chat payload.
    Payload(Vec<u8>),
    /// Explicit acknowledgement carrying no payload.
    Ack,
}

/// A message to be appended to the transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub mid: MessageId,
    pub author: UserId,
    /// Immediate causal predecessors; must form an anti-chain.
    pub parents: BTreeSet<MessageId>,
    /// Intended recipients, not including the author.
    pub readers: BTreeSet<UserId>,
    pub body: MessageBody,
}

/// Events produced by appending a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Every intended recipient of the message has now acked it.
    FullyAcked(MessageId),
}

pub(crate) struct Node {
    pub(crate) msg: Message,
    pub(crate) author_index: u32,
    pub(crate) parent_idxs: Vec<usize>,
    pub(crate) children: Vec<usize>,
    /// Per author, the highest author-index among ancestors and self.
    pub(crate) context: BTreeMap<UserId, u32>,
    pub(crate) unack_by: BTreeSet<UserId>,
    pub(crate) fully_acked: bool,
}

impl Node {
    /// Whether a member could read this message.
    pub(crate) fn visible_to(&self, member: &UserId) -> bool {
        self.msg.author == *member || self.msg.readers.contains(member)
    }
}

/// The append-only transcript DAG.
#[derive(Default)]
pub struct Transcript {
    pub(crate) nodes: Vec<Node>,
    pub(crate) index: HashMap<MessageId, usize>,
    pub(crate) by_author: HashMap<UserId, Vec<usize>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, mid: &MessageId) -> bool {
        self.index.contains_key(mid)
    }

    pub(crate) fn node(&self, mid: &MessageId) -> Result<&Node> {
        self.index
            .get(mid)
            .map(|&idx| &self.nodes[idx])
            .ok_or_else(|| TranscriptError::Unknown(mid.clone()))
    }

    pub fn author(&self, mid: &MessageId) -> Result<&UserId> {
        Ok(&self.node(mid)?.msg.author)
    }

    pub fn parents(&self, mid: &MessageId) -> Result<&BTreeSet<MessageId>> {
        Ok(&self.node(mid)?.msg.parents)
    }

    pub fn readers(&self, mid: &MessageId) -> Result<&BTreeSet<UserId>> {
        Ok(&self.node(mid)?.msg.readers)
    }

    pub fn body(&self, mid: &MessageId) -> Result<&MessageBody> {
        Ok(&self.node(mid)?.msg.body)
    }

    /// Intended recipients that have not yet authored a descendant.
    pub fn unack_by(&self, mid: &MessageId) -> Result<&BTreeSet<UserId>> {
        Ok(&self.node(mid)?.unack_by)
    }

    pub fn is_fully_acked(&self, mid: &MessageId) -> Result<bool> {
        Ok(self.node(mid)?.fully_acked)
    }

    /// The sequence of messages a member has authored, oldest first.
    pub fn messages_by(&self, author: &UserId) -> Vec<&MessageId> {
        self.by_author
            .get(author)
            .map(|idxs| idxs.iter().map(|&i| &self.nodes[i].msg.mid).collect())
            .unwrap_or_default()
    }

    /// Current maximal messages (no accepted descendants), sorted by id.
    pub fn heads(&self) -> Vec<&MessageId> {
        let mut heads: Vec<&MessageId> = self
            .nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .map(|n| &n.msg.mid)
            .collect();
        heads.sort();
        heads
    }

    /// Append a message whose parents are all present.
    ///
    /// Enforces the transcript contract: unknown duplicates, anti-chain
    /// parents, the author's total order, and parent visibility. Returns
    /// the full-ack events triggered by the append.
    pub fn add(&mut self, msg: Message) -> Result<Vec<TranscriptEvent>> {
        if self.contains(&msg.mid) {
            return Err(TranscriptError::Duplicate(msg.mid));
        }
        let mut parent_idxs = Vec::with_capacity(msg.parents.len());
        for parent in &msg.parents {
            let idx = *self
                .index
                .get(parent)
                .ok_or_else(|| TranscriptError::MissingParent(parent.clone()))?;
            parent_idxs.push(idx);
        }

        // Parents must be pairwise incomparable (transitive reduction).
        for (i, &p) in parent_idxs.iter().enumerate() {
            for &q in &parent_idxs[i + 1..] {
                if self.le_idx(p, q) {
                    return Err(TranscriptError::NotAntiChain(
                        self.nodes[p].msg.mid.clone(),
                        self.nodes[q].msg.mid.clone(),
                    ));
                }
                if self.le_idx(q, p) {
                    return Err(TranscriptError::NotAntiChain(
                        self.nodes[q].msg.mid.clone(),
                        self.nodes[p].msg.mid.clone(),
                    ));
                }
            }
        }

        // The author may only reference messages it could read.
        for &p in &parent_idxs {
            if !self.nodes[p].visible_to(&msg.author) {
                return Err(TranscriptError::Visibility(format!(
                    "{} cites {} without being a reader",
                    msg.author, self.nodes[p].msg.mid
                )));
            }
        }

        // Merge the parents' contexts.
        let mut context: BTreeMap<UserId, u32> = BTreeMap::new();
        for &p in &parent_idxs {
            let parent = &self.nodes[p];
            for (author, &idx) in &parent.context {
                context
                    .entry(author.clone())
                    .and_modify(|cur| *cur = (*cur).max(idx))
                    .or_insert(idx);
            }
        }

        // The author's own messages are totally ordered: the previous one
        // must be visible from the new one.
        let author_index = self
            .by_author
            .get(&msg.author)
            .map(|v| v.len() as u32)
            .unwrap_or(0);
        if author_index > 0 {
            match context.get(&msg.author) {
                Some(&seen) if seen + 1 == author_index => {}
                Some(&seen) => {
                    return Err(TranscriptError::AuthorOrder(format!(
                        "{} has authored {author_index} messages but cites index {seen}",
                        msg.author
                    )))
                }
                None => {
                    return Err(TranscriptError::AuthorOrder(format!(
                        "{} does not cite its previous message",
                        msg.author
                    )))
                }
            }
        }
        context.insert(msg.author.clone(), author_index);

        let new_idx = self.nodes.len();
        let unack_by = msg.readers.clone();
        let fully_acked = unack_by.is_empty();
        let mut events = Vec::new();
        if fully_acked {
            events.push(TranscriptEvent::FullyAcked(msg.mid.clone()));
        }

        for &p in &parent_idxs {
            self.nodes[p].children.push(new_idx);
        }
        self.index.insert(msg.mid.clone(), new_idx);
        self.by_author
            .entry(msg.author.clone())
            .or_default()
            .push(new_idx);
        let author = msg.author.clone();
        self.nodes.push(Node {
            msg,
            author_index,
            parent_idxs: parent_idxs.clone(),
            children: Vec::new(),
            context,
            unack_by,
            fully_acked,
        });

        // Propagate the implicit ack through messages the author could
        // have read.
        let mut stack = parent_idxs;
        let mut visited = BTreeSet::new();
        while let Some(idx) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            let node = &mut self.nodes[idx];
            if node.unack_by.remove(&author) && node.unack_by.is_empty() && !node.fully_acked {
                node.fully_acked = true;
                events.push(TranscriptEvent::FullyAcked(node.msg.mid.clone()));
            }
            if self.nodes[idx].visible_to(&author) {
                stack.extend(self.nodes[idx].parent_idxs.iter().copied());
            }
        }

        Ok(events)
    }
}

/// Buffer for messages that arrived before their parents.
///
/// Accepted-but-unready messages wait here; `drain_ready` releases them in
/// a topological order as their parents enter the transcript.
#[derive(Default)]
pub struct PendingBuffer {
    pending: Vec<Message>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue a message until all of its parents are present.
    pub fn push(&mut self, msg: Message) {
        self.pending.push(msg);
    }

    /// Remove and return every buffered message whose parents are all in
    /// the transcript, repeatedly, so releases cascade.
    pub fn drain_ready(&mut self, transcript: &Transcript) -> Vec<Message> {
        let mut ready = Vec::new();
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < self.pending.len() {
                let all_present = self.pending[i].parents.iter().all(|p| {
                    transcript.contains(p)
                        || ready.iter().any(|r: &Message| &r.mid == p)
                });
                if all_present {
                    ready.push(self.pending.remove(i));
                    progressed = true;
                } else {
                    i += 1;
                }
            }
            if !progressed {
                break;
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(mid: &str, author: &str, parents: &[&str], readers: &[&str]) -> Message {
        Message {
            mid: mid.to_string(),
            author: author.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            readers: readers.iter().map(|r| r.to_string()).collect(),
            body: MessageBody::Payload(b"m".to_vec()),
        }
    }

    #[test]
    fn test_add_root_message() {
        let mut t = Transcript::new();
        let events = t.add(msg("O", "alice", &[], &["bob"])).expect("add");
        assert!(events.is_empty());
        assert_eq!(t.unack_by(&"O".into()).expect("unack").len(), 1);
        assert_eq!(t.heads(), vec![&"O".to_string()]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut t = Transcript::new();
        t.add(msg("O", "alice", &[], &["bob"])).expect("add");
        assert!(matches!(
            t.add(msg("O", "alice", &[], &["bob"])),
            Err(TranscriptError::Duplicate(_))
        ));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let mut t = Transcript::new();
        assert!(matches!(
            t.add(msg("A", "alice", &["O"], &["bob"])),
            Err(TranscriptError::MissingParent(_))
        ));
    }

    #[test]
    fn test_causal_ack_table() {
        // The scenario from the protocol contract: B acks both A and O.
        let mut t = Transcript::new();
        t.add(msg("O", "alice", &[], &["bob"])).expect("add O");
        t.add(msg("A", "alice", &["O"], &["bob"])).expect("add A");
        let events = t.add(msg("B", "bob", &["A"], &["alice"])).expect("add B");

        assert!(t.unack_by(&"A".into()).expect("unack").is_empty());
        assert!(t.unack_by(&"O".into()).expect("unack").is_empty());
        assert_eq!(events.len(), 2);
        assert!(events.contains(&TranscriptEvent::FullyAcked("A".into())));
        assert!(events.contains(&TranscriptEvent::FullyAcked("O".into())));
    }

    #[test]
    fn test_fully_acked_fires_exactly_once() {
        let mut t = Transcript::new();
        t.add(msg("O", "alice", &[], &["bob", "carol"])).expect("add");
        let events = t.add(msg("B", "bob", &["O"], &["alice", "carol"])).expect("add");
        assert!(events.is_empty());

        let events = t
            .add(msg("C", "carol", &["B"], &["alice", "bob"]))
            .expect("add");
        assert_eq!(events, vec![TranscriptEvent::FullyAcked("O".into())]);
        assert!(t.is_fully_acked(&"O".into()).expect("acked"));

        // A later descendant completes B but must not re-fire O.
        let events = t
            .add(msg("A2", "alice", &["C"], &["bob", "carol"]))
            .expect("add");
        assert_eq!(events, vec![TranscriptEvent::FullyAcked("B".into())]);
    }

    #[test]
    fn test_ack_does_not_cross_unreadable_message() {
        // carol cannot read M1, so her descendant must not ack O through it.
        let mut t = Transcript::new();
        t.add(msg("O", "alice", &[], &["bob", "carol"])).expect("add");
        t.add(msg("M1", "bob", &["O"], &["alice"])).expect("add");
        // carol cites M1... which she could not read.
        assert!(matches!(
            t.add(msg("C", "carol", &["M1"], &["alice", "bob"])),
            Err(TranscriptError::Visibility(_))
        ));

        // Citing O directly works, and acks only O.
        t.add(msg("C", "carol", &["O"], &["alice", "bob"]))
            .expect("add");
        assert_eq!(
            t.unack_by(&"O".into()).expect("unack").clone(),
            BTreeSet::new()
        );
    }

    #[test]
    fn test_ack_blocked_behind_invisible_intermediate() {
        // alice -> O (readers bob, carol); bob -> M1 citing O (readers bob only
        // via carol-less readership); carol's message cites both O and M2 where
        // M2 is readable: the walk must not descend through nodes carol cannot
        // read.
        let mut t = Transcript::new();
        t.add(msg("O", "alice", &[], &["bob"])).expect("add");
        t.add(msg("M1", "bob", &["O"], &["alice"])).expect("add");
        // alice acks via her own next message; carol never could.
        let events = t
            .add(msg("A1", "alice", &["M1"], &["bob"]))
            .expect("add");
        assert_eq!(events, vec![TranscriptEvent::FullyAcked("M1".into())]);
        // O was authored by alice herself; bob acked it via M1 already.
        assert!(t.unack_by(&"O".into()).expect("unack").is_empty());
    }

    #[test]
    fn test_antichain_enforced() {
        let mut t = Transcript::new();
        t.add(msg("O", "alice", &[], &["bob"])).expect("add");
        t.add(msg("A", "alice", &["O"], &["bob"])).expect("add");
        // O <= A, so {O, A} is not an anti-chain.
        assert!(matches!(
            t.add(msg("B", "bob", &["O", "A"], &["alice"])),
            Err(TranscriptError::NotAntiChain(_, _))
        ));
    }

    #[test]
    fn test_author_total_order_enforced() {
        let mut t = Transcript::new();
        t.add(msg("A1", "alice", &[], &["bob"])).expect("add");
        t.add(msg("B1", "bob", &["A1"], &["alice"])).expect("add");
        // alice's second message must cite A1 (directly or transitively).
        assert!(matches!(
            t.add(msg("A2", "alice", &[], &["bob"])),
            Err(TranscriptError::AuthorOrder(_))
        ));
        // Citing B1 sees A1 transitively.
        t.add(msg("A2", "alice", &["B1"], &["bob"])).expect("add");
    }

    #[test]
    fn test_unack_subset_of_readers() {
        let mut t = Transcript::new();
        t.add(msg("O", "alice", &[], &["bob", "carol"])).expect("add");
        t.add(msg("B", "bob", &["O"], &["alice", "carol"])).expect("add");
        let unack = t.unack_by(&"O".into()).expect("unack");
        let readers = t.readers(&"O".into()).expect("readers");
        assert!(unack.is_subset(readers));
    }

    #[test]
    fn test_heads_track_frontier() {
        let mut t = Transcript::new();
        t.add(msg("O", "alice", &[], &["bob"])).expect("add");
        t.add(msg("A", "alice", &["O"], &["bob"])).expect("add");
        t.add(msg("B", "bob", &["A"], &["alice"])).expect("add");
        assert_eq!(t.heads(), vec![&"B".to_string()]);
    }

    #[test]
    fn test_pending_buffer_releases_in_order() {
        let mut t = Transcript::new();
        let mut buffer = PendingBuffer::new();

        // B arrives before its parent A.
        buffer.push(msg("B", "bob", &["A"], &["alice"]));
        assert!(buffer.drain_ready(&t).is_empty());

        t.add(msg("A", "alice", &[], &["bob"])).expect("add");
        let ready = buffer.drain_ready(&t);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].mid, "B");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pending_buffer_cascades() {
        let t = {
            let mut t = Transcript::new();
            t.add(msg("O", "alice", &[], &["bob"])).expect("add");
            t
        };
        let mut buffer = PendingBuffer::new();
        buffer.push(msg("B", "bob", &["A"], &["alice"]));
        buffer.push(msg("A", "alice", &["O"], &["bob"]));

        let ready = buffer.drain_ready(&t);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].mid, "A");
        assert_eq!(ready[1].mid, "B");
    }
}
