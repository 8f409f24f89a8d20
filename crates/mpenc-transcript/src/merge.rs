//! Deterministic 3-way merge of membership views across branches.
//!
//! A message's membership view is its author plus readers. When branches
//! fork and rejoin, the view expected at the join point is computed by
//! patching one branch with the other branch's changes relative to their
//! common ancestor: `merged = B.patch(P.diff(A))`. Branches that add and
//! remove the same member concurrently cannot be reconciled and are fatal.
//!
//! Merge results are memoised by sorted parent set in a small LRU; the
//! cache can be disabled for property testing.

use std::collections::{BTreeSet, VecDeque};

use mpenc_types::{MessageId, UserId};

use crate::graph::Transcript;
use crate::{Result, TranscriptError};

/// Bound on memoised merge results.
const MERGE_CACHE_SIZE: usize = 256;

/// Recursion guard for nested common-ancestor resolution.
const MAX_MERGE_DEPTH: usize = 64;

/// A membership set.
pub type MemberView = BTreeSet<UserId>;

/// LRU memo of merge results keyed by sorted parent set.
pub struct MergeCache {
    entries: VecDeque<(Vec<MessageId>, MemberView)>,
    enabled: bool,
}

impl Default for MergeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeCache {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            enabled: true,
        }
    }

    /// A cache that never stores; useful for property testing.
    pub fn disabled() -> Self {
        Self {
            entries: VecDeque::new(),
            enabled: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&mut self, key: &[MessageId]) -> Option<MemberView> {
        if !self.enabled {
            return None;
        }
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        let entry = self.entries.remove(pos)?;
        let view = entry.1.clone();
        self.entries.push_back(entry);
        Some(view)
    }

    fn put(&mut self, key: Vec<MessageId>, view: MemberView) {
        if !self.enabled {
            return;
        }
        if self.entries.len() >= MERGE_CACHE_SIZE {
            self.entries.pop_front();
        }
        self.entries.push_back((key, view));
    }
}

/// The membership view of a single message: author plus readers.
pub fn view_of(transcript: &Transcript, mid: &MessageId) -> Result<MemberView> {
    let mut view: MemberView = transcript.readers(mid)?.clone();
    view.insert(transcript.author(mid)?.clone());
    Ok(view)
}

/// Patch `b` with the changes from `base` to `a`.
///
/// Each membership change must originate on exactly one branch: a member
/// added or removed on both sides concurrently cannot be attributed and
/// is fatal.
pub fn three_way(base: &MemberView, a: &MemberView, b: &MemberView) -> Result<MemberView> {
    let added_a: MemberView = a.difference(base).cloned().collect();
    let removed_a: MemberView = base.difference(a).cloned().collect();
    let added_b: MemberView = b.difference(base).cloned().collect();
    let removed_b: MemberView = base.difference(b).cloned().collect();

    let mut conflicts: Vec<&UserId> = added_a.intersection(&added_b).collect();
    conflicts.extend(removed_a.intersection(&removed_b));
    if !conflicts.is_empty() {
        return Err(TranscriptError::MergeConflict(format!(
            "same change on both branches for {conflicts:?}"
        )));
    }

    let mut merged: MemberView = b.difference(&removed_a).cloned().collect();
    merged.extend(added_a);
    Ok(merged)
}

/// Merge the membership views of a parent set.
///
/// The base is the view at the parents' common-ancestor frontier, resolved
/// recursively when the frontier itself is branched.
pub fn merge_parents(
    transcript: &Transcript,
    parents: &[MessageId],
    cache: &mut MergeCache,
) -> Result<MemberView> {
    let mut key: Vec<MessageId> = parents.to_vec();
    key.sort();
    key.dedup();
    if let Some(view) = cache.get(&key) {
        return Ok(view);
    }
    let view = merge_inner(transcript, &key, 0)?;
    cache.put(key, view.clone());
    Ok(view)
}

fn merge_inner(transcript: &Transcript, parents: &[MessageId], depth: usize) -> Result<MemberView> {
    if depth > MAX_MERGE_DEPTH {
        return Err(TranscriptError::MergeConflict(
            "merge recursion limit exceeded".into(),
        ));
    }
    match parents {
        [] => Ok(MemberView::new()),
        [single] => view_of(transcript, single),
        _ => {
            let frontier = common_ancestor_frontier(transcript, parents)?;
            let base = if frontier.is_empty() {
                MemberView::new()
            } else {
                merge_inner(transcript, &frontier, depth + 1)?
            };
            let mut merged = view_of(transcript, &parents[0])?;
            for parent in &parents[1..] {
                let view = view_of(transcript, parent)?;
                merged = three_way(&base, &view, &merged)?;
            }
            Ok(merged)
        }
    }
}

/// Maximal messages visible from every parent.
fn common_ancestor_frontier(
    transcript: &Transcript,
    parents: &[MessageId],
) -> Result<Vec<MessageId>> {
    // Per author, the lowest index every parent has seen; those messages
    // are exactly the common ancestors' tips per author chain.
    let mut common: Option<Vec<(UserId, u32)>> = None;
    for parent in parents {
        let node = transcript.node(parent)?;
        let view: Vec<(UserId, u32)> = match &common {
            None => node
                .context
                .iter()
                .map(|(a, &i)| (a.clone(), i))
                .collect(),
            Some(prev) => prev
                .iter()
                .filter_map(|(a, i)| node.context.get(a).map(|&j| (a.clone(), (*i).min(j))))
                .collect(),
        };
        common = Some(view);
    }
    let Some(common) = common else {
        return Ok(Vec::new());
    };

    let mut candidates: Vec<MessageId> = Vec::new();
    for (author, idx) in common {
        let mids = transcript.messages_by(&author);
        if let Some(mid) = mids.get(idx as usize) {
            candidates.push((*mid).clone());
        }
    }
    // Keep only the maximal candidates.
    let mut maximal = Vec::new();
    for mid in &candidates {
        let dominated = candidates
            .iter()
            .any(|other| other != mid && transcript.le(mid, other).unwrap_or(false));
        if !dominated {
            maximal.push(mid.clone());
        }
    }
    maximal.sort();
    maximal.dedup();
    Ok(maximal)
}
