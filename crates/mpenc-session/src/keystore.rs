//! Session key generations for trial decryption.
//!
//! Every completed key agreement yields a generation: the session id, the
//! membership, the members' ephemeral verification keys, and the group
//! keys derived under that session id, newest first (a refresh rotates
//! the key without changing the id). Inbound data messages carry only a one-
//! byte hint, so receivers trial-decrypt across the matching generations.

use std::collections::BTreeMap;

use mpenc_codec::message;
use mpenc_crypto::ed25519::VerifyingKey;
use mpenc_types::{GroupKey, Hash, UserId};

/// Retained generations; older sessions age out.
const MAX_GENERATIONS: usize = 8;

/// Keys of one completed agreement.
pub struct KeyGeneration {
    pub session_id: Hash,
    pub members: Vec<UserId>,
    /// Group keys under this session id, newest first.
    pub group_keys: Vec<GroupKey>,
    pub ephemeral_keys: BTreeMap<UserId, VerifyingKey>,
}

/// Ordered store of key generations, newest first.
#[derive(Default)]
pub struct SessionKeyStore {
    generations: Vec<KeyGeneration>,
}

impl SessionKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    /// The newest generation, if any agreement completed yet.
    pub fn current(&self) -> Option<&KeyGeneration> {
        self.generations.first()
    }

    /// Record a completed agreement. A repeated session id with a fresh
    /// group key prepends the key to the existing generation.
    pub fn update(
        &mut self,
        session_id: Hash,
        members: Vec<UserId>,
        group_key: GroupKey,
        ephemeral_keys: BTreeMap<UserId, VerifyingKey>,
    ) {
        if let Some(current) = self.generations.first_mut() {
            if current.session_id == session_id {
                if !current.group_keys.contains(&group_key) {
                    current.group_keys.insert(0, group_key);
                }
                current.members = members;
                current.ephemeral_keys = ephemeral_keys;
                return;
            }
        }
        self.generations.insert(
            0,
            KeyGeneration {
                session_id,
                members,
                group_keys: vec![group_key],
                ephemeral_keys,
            },
        );
        self.generations.truncate(MAX_GENERATIONS);
    }

    /// Candidate `(generation, group key)` pairs whose hint matches.
    pub fn candidates(&self, hint: u8) -> Vec<(&KeyGeneration, &GroupKey)> {
        let mut out = Vec::new();
        for generation in &self.generations {
            for key in &generation.group_keys {
                if message::sidkey_hint(&generation.session_id, key) == hint {
                    out.push((generation, key));
                }
            }
        }
        out
    }

    /// A sender's ephemeral verification key, searched newest first.
    pub fn sender_key(&self, sender: &UserId) -> Option<&VerifyingKey> {
        self.generations
            .iter()
            .find_map(|g| g.ephemeral_keys.get(sender))
    }
}
