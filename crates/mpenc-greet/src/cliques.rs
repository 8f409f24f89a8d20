//! CLIQUES group key agreement over Curve25519.
//!
//! Each member contributes a private scalar; the intermediate-key vector
//! holds, at position `i`, the running product of every contribution
//! except member `i`'s. During an upflow the last element (the cardinal)
//! is the product of every contribution so far; whichever member appends
//! the final contribution turns the cardinal into the shared group key and
//! broadcasts the remaining vector.
//!
//! Auxiliary operations (join, exclude, refresh) rotate the initiator's
//! scalar: the retiring scalar is folded into the member's own slot before
//! a fresh one multiplies every other slot, so the invariant
//! `group_key = priv · int_keys[my_index]` is preserved across rotations.

use mpenc_codec::packet::{Agreement, Flow};
use mpenc_crypto::x25519::{DhPoint, DhScalar};
use mpenc_types::{GroupKey, UserId};

use crate::{GreetError, Result};

/// One CLIQUES sub-protocol message, later merged into a greet packet.
#[derive(Clone, Debug)]
pub struct CliquesMessage {
    pub source: UserId,
    /// Next upflow recipient, or `None` for a broadcast downflow.
    pub dest: Option<UserId>,
    pub agreement: Agreement,
    pub flow: Flow,
    pub members: Vec<UserId>,
    pub int_keys: Vec<DhPoint>,
}

/// Per-member CLIQUES state.
pub struct CliquesMember {
    id: UserId,
    members: Vec<UserId>,
    priv_key: Option<DhScalar>,
    int_keys: Vec<DhPoint>,
    group_key: Option<DhPoint>,
}

fn check_no_duplicates(members: &[UserId]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for member in members {
        if !seen.insert(member) {
            return Err(GreetError::Argument(format!("duplicate member {member}")));
        }
    }
    Ok(())
}

impl CliquesMember {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            priv_key: None,
            int_keys: Vec::new(),
            group_key: None,
        }
    }

    pub fn id(&self) -> &UserId {
        &self.id
    }

    pub fn members(&self) -> &[UserId] {
        &self.members
    }

    /// The derived 32-byte shared secret, once the downflow completed.
    pub fn group_key(&self) -> Option<GroupKey> {
        self.group_key.as_ref().map(DhPoint::to_bytes)
    }

    fn my_pos(&self) -> Result<usize> {
        self.members
            .iter()
            .position(|m| m == &self.id)
            .ok_or_else(|| GreetError::Protocol(format!("{} not in member list", self.id)))
    }

    /// Fold the retiring scalar into our own slot, then multiply a fresh
    /// scalar into every other slot. Returns the new cardinal.
    fn renew_priv_key(&mut self) -> Result<DhPoint> {
        let my_pos = self.my_pos()?;
        if let Some(old) = self.priv_key.take() {
            self.int_keys[my_pos] = old.mult(&self.int_keys[my_pos]);
        }
        let fresh = DhScalar::random();
        for (i, key) in self.int_keys.iter_mut().enumerate() {
            if i != my_pos {
                *key = fresh.mult(key);
            }
        }
        let cardinal = fresh.mult(&self.int_keys[my_pos]);
        self.priv_key = Some(fresh);
        Ok(cardinal)
    }

    /// Begin Initial Key Agreement with the given other members.
    pub fn ika(&mut self, other_members: &[UserId]) -> Result<CliquesMessage> {
        if other_members.is_empty() {
            return Err(GreetError::Argument("no members to agree with".into()));
        }
        let mut members = vec![self.id.clone()];
        members.extend_from_slice(other_members);
        check_no_duplicates(&members)?;

        self.priv_key = None;
        self.group_key = None;
        let seed = CliquesMessage {
            source: self.id.clone(),
            dest: Some(self.id.clone()),
            agreement: Agreement::Initial,
            flow: Flow::Upflow,
            members,
            int_keys: Vec::new(),
        };
        self.upflow(&seed)
    }

    /// Consume an upflow and produce the next message in the chain.
    pub fn upflow(&mut self, message: &CliquesMessage) -> Result<CliquesMessage> {
        check_no_duplicates(&message.members)?;
        if !message.members.contains(&self.id) {
            return Err(GreetError::Protocol(format!(
                "{} not in upflow member list",
                self.id
            )));
        }
        if message.int_keys.len() > message.members.len() {
            return Err(GreetError::Protocol("too many intermediate keys".into()));
        }

        if message.agreement == Agreement::Initial {
            // An initial upflow starts a fresh chain; a scalar left over
            // from an abandoned attempt must not be folded into it.
            self.priv_key = None;
            self.group_key = None;
        }
        self.members = message.members.clone();
        self.int_keys = message.int_keys.clone();
        if self.int_keys.is_empty() {
            self.int_keys.push(DhPoint::generator());
        }
        let my_pos = self.my_pos()?;
        if self.int_keys.len() != my_pos + 1 {
            return Err(GreetError::Protocol(format!(
                "upflow holds {} keys for position {my_pos}",
                self.int_keys.len()
            )));
        }

        let cardinal = self.renew_priv_key()?;

        if my_pos == self.members.len() - 1 {
            // Our contribution completes the chain.
            self.group_key = Some(cardinal);
            tracing::debug!(member = %self.id, size = self.members.len(), "upflow complete, broadcasting downflow");
            Ok(CliquesMessage {
                source: self.id.clone(),
                dest: None,
                agreement: message.agreement,
                flow: Flow::Downflow,
                members: self.members.clone(),
                int_keys: self.int_keys.clone(),
            })
        } else {
            self.int_keys.push(cardinal);
            Ok(CliquesMessage {
                source: self.id.clone(),
                dest: Some(self.members[my_pos + 1].clone()),
                agreement: message.agreement,
                flow: Flow::Upflow,
                members: self.members.clone(),
                int_keys: self.int_keys.clone(),
            })
        }
    }

    /// Consume a broadcast downflow and derive the group key.
    ///
    /// For the initial agreement the member list must equal the local one
    /// (order-insensitive). Auxiliary downflows may add members (join) or
    /// drop members other than self (exclude); the local list is
    /// reconciled to the sender's. Idempotent for an identical payload.
    pub fn downflow(&mut self, message: &CliquesMessage) -> Result<()> {
        check_no_duplicates(&message.members)?;
        if !message.members.contains(&self.id) {
            return Err(GreetError::Protocol(format!(
                "{} not in downflow member list",
                self.id
            )));
        }
        match message.agreement {
            Agreement::Initial => {
                let mut ours = self.members.clone();
                let mut theirs = message.members.clone();
                ours.sort();
                theirs.sort();
                if ours != theirs {
                    return Err(GreetError::Protocol(
                        "downflow member list does not match".into(),
                    ));
                }
            }
            Agreement::Auxiliary => {
                // Joins extend the list, exclusions shrink it; membership
                // is reconciled to the sender's view below.
            }
        }
        if message.int_keys.len() != message.members.len() {
            return Err(GreetError::Protocol(format!(
                "downflow holds {} keys for {} members",
                message.int_keys.len(),
                message.members.len()
            )));
        }
        let priv_key = self
            .priv_key
            .as_ref()
            .ok_or_else(|| GreetError::Protocol("downflow before own contribution".into()))?;

        if self.group_key.is_some() && self.int_keys == message.int_keys {
            return Ok(());
        }

        // Align our slot ordering to the sender's member ordering.
        self.members = message.members.clone();
        self.int_keys = message.int_keys.clone();
        let my_pos = self.my_pos()?;
        self.group_key = Some(priv_key.mult(&self.int_keys[my_pos]));
        Ok(())
    }

    /// Auxiliary Key Agreement: admit new members.
    pub fn aka_join(&mut self, new_members: &[UserId]) -> Result<CliquesMessage> {
        if new_members.is_empty() {
            return Err(GreetError::Argument("no members to join".into()));
        }
        if self.group_key.is_none() {
            return Err(GreetError::Protocol("join before initial agreement".into()));
        }
        for member in new_members {
            if self.members.contains(member) {
                return Err(GreetError::Argument(format!("{member} already a member")));
            }
        }
        let mut members = self.members.clone();
        members.extend_from_slice(new_members);
        check_no_duplicates(&members)?;
        self.members = members;

        let cardinal = self.renew_priv_key()?;
        self.int_keys.push(cardinal);
        self.group_key = None;

        tracing::debug!(member = %self.id, joining = ?new_members, "starting auxiliary join upflow");
        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: Some(new_members[0].clone()),
            agreement: Agreement::Auxiliary,
            flow: Flow::Upflow,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Auxiliary Key Agreement: evict members and rotate own scalar.
    pub fn aka_exclude(&mut self, exclude: &[UserId]) -> Result<CliquesMessage> {
        if exclude.is_empty() {
            return Err(GreetError::Argument("no members to exclude".into()));
        }
        check_no_duplicates(exclude)?;
        if exclude.contains(&self.id) {
            return Err(GreetError::Argument("cannot exclude self".into()));
        }
        for member in exclude {
            if !self.members.contains(member) {
                return Err(GreetError::Argument(format!("{member} is not a member")));
            }
        }
        if exclude.len() >= self.members.len() {
            return Err(GreetError::Argument("cannot exclude every member".into()));
        }

        let keep: Vec<bool> = self
            .members
            .iter()
            .map(|m| !exclude.contains(m))
            .collect();
        let mut members = Vec::new();
        let mut int_keys = Vec::new();
        for (i, kept) in keep.iter().enumerate() {
            if *kept {
                members.push(self.members[i].clone());
                int_keys.push(self.int_keys[i].clone());
            }
        }
        self.members = members;
        self.int_keys = int_keys;

        let cardinal = self.renew_priv_key()?;
        self.group_key = Some(cardinal);

        tracing::debug!(member = %self.id, excluded = ?exclude, "broadcasting exclusion downflow");
        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: None,
            agreement: Agreement::Auxiliary,
            flow: Flow::Downflow,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Rotate own scalar and rebroadcast, refreshing the group key.
    pub fn aka_refresh(&mut self) -> Result<CliquesMessage> {
        if self.group_key.is_none() {
            return Err(GreetError::Protocol("refresh before initial agreement".into()));
        }
        let cardinal = self.renew_priv_key()?;
        self.group_key = Some(cardinal);

        tracing::debug!(member = %self.id, "broadcasting key refresh downflow");
        Ok(CliquesMessage {
            source: self.id.clone(),
            dest: None,
            agreement: Agreement::Auxiliary,
            flow: Flow::Downflow,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Discard all key material, ending participation.
    pub fn quit(&mut self) {
        self.priv_key = None;
        self.group_key = None;
        self.int_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<UserId> {
        names.iter().map(|n| n.to_string()).collect()
    }

    /// Run a full IKA among the given members, returning their states.
    fn run_ika(names: &[&str]) -> Vec<CliquesMember> {
        let mut members: Vec<CliquesMember> =
            names.iter().map(|n| CliquesMember::new(*n)).collect();

        let mut message = members[0]
            .ika(&ids(&names[1..]))
            .expect("ika");
        for i in 1..members.len() {
            assert_eq!(message.dest.as_deref(), Some(names[i]));
            message = members[i].upflow(&message).expect("upflow");
        }
        assert_eq!(message.flow, Flow::Downflow);
        assert_eq!(message.dest, None);

        for member in &mut members {
            member.downflow(&message).expect("downflow");
        }
        members
    }

    fn assert_shared_key(members: &[CliquesMember]) -> GroupKey {
        let key = members[0].group_key().expect("group key");
        for member in members {
            assert_eq!(member.group_key().expect("group key"), key);
        }
        key
    }

    #[test]
    fn test_ika_pair() {
        let members = run_ika(&["alice", "bob"]);
        assert_shared_key(&members);
    }

    #[test]
    fn test_ika_three_members() {
        let members = run_ika(&["alice", "bob", "carol"]);
        assert_shared_key(&members);
    }

    #[test]
    fn test_ika_five_members() {
        let members = run_ika(&["u1", "u2", "u3", "u4", "u5"]);
        assert_shared_key(&members);
    }

    #[test]
    fn test_ika_rejects_empty() {
        let mut alice = CliquesMember::new("alice");
        assert!(matches!(alice.ika(&[]), Err(GreetError::Argument(_))));
    }

    #[test]
    fn test_ika_rejects_duplicates() {
        let mut alice = CliquesMember::new("alice");
        assert!(alice.ika(&ids(&["bob", "bob"])).is_err());
        assert!(alice.ika(&ids(&["alice"])).is_err());
    }

    #[test]
    fn test_downflow_idempotent() {
        let mut members = run_ika(&["alice", "bob"]);
        let key = assert_shared_key(&members);

        let replay = CliquesMessage {
            source: "bob".into(),
            dest: None,
            agreement: Agreement::Initial,
            flow: Flow::Downflow,
            members: members[0].members().to_vec(),
            int_keys: members[0].int_keys.clone(),
        };
        members[0].downflow(&replay).expect("replay downflow");
        assert_eq!(members[0].group_key().expect("key"), key);
    }

    #[test]
    fn test_downflow_rejects_wrong_members() {
        let mut members = run_ika(&["alice", "bob"]);
        let bogus = CliquesMessage {
            source: "bob".into(),
            dest: None,
            agreement: Agreement::Initial,
            flow: Flow::Downflow,
            members: ids(&["alice", "mallory"]),
            int_keys: members[0].int_keys.clone(),
        };
        assert!(members[0].downflow(&bogus).is_err());
    }

    #[test]
    fn test_join_two_members() {
        let mut members = run_ika(&["u1", "u2", "u3"]);
        let old_key = assert_shared_key(&members);

        let mut joiners = vec![CliquesMember::new("u4"), CliquesMember::new("u5")];
        let mut message = members[1].aka_join(&ids(&["u4", "u5"])).expect("join");
        message = joiners[0].upflow(&message).expect("u4 upflow");
        let downflow = joiners[1].upflow(&message).expect("u5 upflow");
        assert_eq!(downflow.flow, Flow::Downflow);

        for member in &mut members {
            member.downflow(&downflow).expect("downflow");
        }
        joiners[0].downflow(&downflow).expect("downflow");

        let all: Vec<CliquesMember> = members.into_iter().chain(joiners).collect();
        let new_key = all[0].group_key().expect("key");
        for member in &all {
            assert_eq!(member.group_key().expect("key"), new_key);
        }
        assert_ne!(new_key, old_key);
    }

    #[test]
    fn test_exclude_rotates_key() {
        let mut members = run_ika(&["u1", "u2", "u3", "u4"]);
        let old_key = assert_shared_key(&members);

        let downflow = members[3].aka_exclude(&ids(&["u1", "u3"])).expect("exclude");
        assert_eq!(downflow.members, ids(&["u2", "u4"]));

        members[1].downflow(&downflow).expect("downflow");
        let new_key = members[1].group_key().expect("key");
        assert_eq!(members[3].group_key().expect("key"), new_key);
        assert_ne!(new_key, old_key);
    }

    #[test]
    fn test_exclude_rejects_self_and_unknown() {
        let mut members = run_ika(&["u1", "u2", "u3"]);
        assert!(members[0].aka_exclude(&ids(&["u1"])).is_err());
        assert!(members[0].aka_exclude(&ids(&["u9"])).is_err());
        assert!(members[0].aka_exclude(&[]).is_err());
    }

    #[test]
    fn test_refresh_rotates_key() {
        let mut members = run_ika(&["u1", "u2", "u3"]);
        let old_key = assert_shared_key(&members);

        let downflow = members[0].aka_refresh().expect("refresh");
        for member in members.iter_mut().skip(1) {
            member.downflow(&downflow).expect("downflow");
        }
        let new_key = assert_shared_key(&members);
        assert_ne!(new_key, old_key);
    }

    #[test]
    fn test_refresh_then_messageable_key_invariant() {
        // group_key == priv · int_keys[my_index] after every operation.
        let mut members = run_ika(&["u1", "u2"]);
        let downflow = members[1].aka_refresh().expect("refresh");
        members[0].downflow(&downflow).expect("downflow");

        for member in &members {
            let my_pos = member.my_pos().expect("pos");
            let derived = member
                .priv_key
                .as_ref()
                .expect("priv")
                .mult(&member.int_keys[my_pos]);
            assert_eq!(member.group_key().expect("key"), derived.to_bytes());
        }
    }

    #[test]
    fn test_quit_wipes_state() {
        let mut members = run_ika(&["u1", "u2"]);
        members[0].quit();
        assert!(members[0].group_key().is_none());
        assert!(members[0].priv_key.is_none());
    }

    #[test]
    fn test_abandoned_attempt_does_not_taint_new_chain() {
        let mut alice = CliquesMember::new("alice");
        let mut bob = CliquesMember::new("bob");
        let mut carol = CliquesMember::new("carol");

        // Carol starts her own agreement, but the channel serialized
        // alice's first; carol's scalar from the lost attempt must not
        // leak into alice's chain.
        let _lost = carol.ika(&ids(&["alice", "bob"])).expect("ika");

        let mut message = alice.ika(&ids(&["bob", "carol"])).expect("ika");
        message = bob.upflow(&message).expect("upflow");
        let downflow = carol.upflow(&message).expect("upflow");

        alice.downflow(&downflow).expect("downflow");
        bob.downflow(&downflow).expect("downflow");
        let key = alice.group_key().expect("key");
        assert_eq!(bob.group_key().expect("key"), key);
        assert_eq!(carol.group_key().expect("key"), key);
    }
}
