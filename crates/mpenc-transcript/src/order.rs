//! The causal partial order over the transcript.
//!
//! `le(m0, m1)` holds iff `m0` is `m1` or reachable from `m1` via parents.
//! Each node's context map answers this in O(1): messages by one author
//! form a chain, so `m0 ≤ m1` exactly when `m1`'s context records an
//! author-index of `author(m0)` at least `m0`'s. This subsumes both the
//! author-total-order shortcut and the reader shortcut; the breadth-first
//! ancestor walk remains for traversals that need the actual paths.

use std::collections::BTreeSet;

use mpenc_types::MessageId;

use crate::graph::Transcript;
use crate::Result;

impl Transcript {
    pub(crate) fn le_idx(&self, a: usize, b: usize) -> bool {
        if a == b {
            return true;
        }
        let node_a = &self.nodes[a];
        let node_b = &self.nodes[b];
        match node_b.context.get(&node_a.msg.author) {
            Some(&seen) => seen >= node_a.author_index,
            None => false,
        }
    }

    /// Whether `m0` causally precedes (or is) `m1`.
    pub fn le(&self, m0: &MessageId, m1: &MessageId) -> Result<bool> {
        let a_idx = *self
            .index
            .get(m0)
            .ok_or_else(|| crate::TranscriptError::Unknown(m0.clone()))?;
        let b_idx = *self
            .index
            .get(m1)
            .ok_or_else(|| crate::TranscriptError::Unknown(m1.clone()))?;
        Ok(self.le_idx(a_idx, b_idx))
    }

    /// Strict precedence: `m0 ≤ m1` and `m0 ≠ m1`.
    pub fn lt(&self, m0: &MessageId, m1: &MessageId) -> Result<bool> {
        Ok(m0 != m1 && self.le(m0, m1)?)
    }

    /// Breadth-first walk over the proper ancestors of a message.
    pub(crate) fn ancestor_idxs(&self, start: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut visited = BTreeSet::new();
        let mut queue: Vec<usize> = self.nodes[start].parent_idxs.clone();
        while let Some(idx) = queue.pop() {
            if !visited.insert(idx) {
                continue;
            }
            out.push(idx);
            queue.extend(self.nodes[idx].parent_idxs.iter().copied());
        }
        out
    }

    /// The maximal ancestors of `mid` satisfying a predicate.
    ///
    /// Walks breadth-first from the parents; matching nodes are collected
    /// without descending further, then reduced to the maximal anti-chain.
    pub fn pre_pred(
        &self,
        mid: &MessageId,
        pred: impl Fn(&MessageId) -> bool,
    ) -> Result<Vec<MessageId>> {
        let start = *self
            .index
            .get(mid)
            .ok_or_else(|| crate::TranscriptError::Unknown(mid.clone()))?;

        let mut hits: Vec<usize> = Vec::new();
        let mut visited = BTreeSet::new();
        let mut queue: std::collections::VecDeque<usize> =
            self.nodes[start].parent_idxs.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            if pred(&self.nodes[idx].msg.mid) {
                hits.push(idx);
            } else {
                queue.extend(self.nodes[idx].parent_idxs.iter().copied());
            }
        }

        // Different branches may have collected comparable hits.
        let mut maximal: Vec<usize> = Vec::new();
        for &h in &hits {
            if hits.iter().any(|&other| other != h && self.le_idx(h, other)) {
                continue;
            }
            if !maximal.contains(&h) {
                maximal.push(h);
            }
        }
        let mut out: Vec<MessageId> = maximal
            .into_iter()
            .map(|i| self.nodes[i].msg.mid.clone())
            .collect();
        out.sort();
        Ok(out)
    }
}
