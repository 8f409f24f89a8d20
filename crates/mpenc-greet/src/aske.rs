//! Authenticated Signature Key Exchange.
//!
//! Each member contributes a fresh nonce and an ephemeral Ed25519 signing
//! key through an upflow; the last contributor derives the session id and
//! opens the downflow, in which every member signs the session
//! acknowledgement with their long-term identity key:
//!
//! ```text
//! "acksig" ‖ member ‖ ephemeral_pub ‖ nonce ‖ session_id
//! ```
//!
//! The session id is the SHA-256 over the `(member ‖ nonce)` pairs sorted
//! by member id, so it depends only on the set of contributions.

use mpenc_codec::packet::Flow;
use mpenc_crypto::ed25519::{KeyPair, Signature, SigningKey, VerifyingKey};
use mpenc_crypto::{hash, random};
use mpenc_types::{Hash, Nonce, UserId};

use crate::{GreetError, KeyDirectory, Result};

const ACK_MAGIC: &[u8] = b"acksig";

/// One ASKE sub-protocol message, later merged into a greet packet.
#[derive(Clone, Debug)]
pub struct AskeMessage {
    pub source: UserId,
    /// Next upflow recipient, or `None` for a broadcast downflow.
    pub dest: Option<UserId>,
    pub flow: Flow,
    pub members: Vec<UserId>,
    pub nonces: Vec<Nonce>,
    pub pub_keys: Vec<VerifyingKey>,
    pub session_signature: Option<Signature>,
}

/// Per-member ASKE state.
pub struct AskeMember {
    id: UserId,
    static_key: SigningKey,
    members: Vec<UserId>,
    nonce: Option<Nonce>,
    nonces: Vec<Nonce>,
    ephemeral: Option<KeyPair>,
    pub_keys: Vec<VerifyingKey>,
    session_id: Option<Hash>,
    authenticated: Vec<bool>,
}

/// Compute a session id from `(member, nonce)` pairs.
///
/// Invariant to input order; depends only on the pair multiset.
pub fn session_id(members: &[UserId], nonces: &[Nonce]) -> Hash {
    let mut pairs: Vec<(&UserId, &Nonce)> = members.iter().zip(nonces.iter()).collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let mut parts: Vec<&[u8]> = Vec::with_capacity(pairs.len() * 2);
    for (member, nonce) in &pairs {
        parts.push(member.as_bytes());
        parts.push(nonce.as_slice());
    }
    hash::sha256_parts(&parts)
}

fn ack_content(member: &UserId, eph_pub: &VerifyingKey, nonce: &Nonce, sid: &Hash) -> Vec<u8> {
    let mut content = Vec::with_capacity(ACK_MAGIC.len() + member.len() + 96);
    content.extend_from_slice(ACK_MAGIC);
    content.extend_from_slice(member.as_bytes());
    content.extend_from_slice(&eph_pub.to_bytes());
    content.extend_from_slice(nonce);
    content.extend_from_slice(sid);
    content
}

impl AskeMember {
    pub fn new(id: impl Into<UserId>, static_key: SigningKey) -> Self {
        Self {
            id: id.into(),
            static_key,
            members: Vec::new(),
            nonce: None,
            nonces: Vec::new(),
            ephemeral: None,
            pub_keys: Vec::new(),
            session_id: None,
            authenticated: Vec::new(),
        }
    }

    pub fn id(&self) -> &UserId {
        &self.id
    }

    pub fn members(&self) -> &[UserId] {
        &self.members
    }

    pub fn session_id(&self) -> Option<&Hash> {
        self.session_id.as_ref()
    }

    /// The session-ephemeral signing key, used to seal wire packets.
    pub fn ephemeral_signing_key(&self) -> Option<&SigningKey> {
        self.ephemeral.as_ref().map(|kp| &kp.signing_key)
    }

    /// The ephemeral verification key a member contributed this session.
    pub fn ephemeral_pub_key_of(&self, member: &UserId) -> Option<&VerifyingKey> {
        let idx = self.members.iter().position(|m| m == member)?;
        self.pub_keys.get(idx)
    }

    /// True once every member's session acknowledgement verified.
    pub fn is_session_acknowledged(&self) -> bool {
        self.session_id.is_some()
            && !self.authenticated.is_empty()
            && self.authenticated.iter().all(|&a| a)
    }

    fn my_pos(&self) -> Result<usize> {
        self.members
            .iter()
            .position(|m| m == &self.id)
            .ok_or_else(|| GreetError::Protocol(format!("{} not in member list", self.id)))
    }

    fn sign_session_ack(&self, sid: &Hash) -> Result<Signature> {
        let ephemeral = self
            .ephemeral
            .as_ref()
            .ok_or_else(|| GreetError::Authentication("no ephemeral key to bind".into()))?;
        let nonce = self
            .nonce
            .as_ref()
            .ok_or_else(|| GreetError::Authentication("no nonce to bind".into()))?;
        let content = ack_content(&self.id, &ephemeral.verifying_key, nonce, sid);
        Ok(self.static_key.sign(&content))
    }

    /// Initialize the exchange with the given other members.
    pub fn commit(&mut self, other_members: &[UserId]) -> Result<AskeMessage> {
        if other_members.is_empty() {
            return Err(GreetError::Argument("no members to commit with".into()));
        }
        let mut members = vec![self.id.clone()];
        members.extend_from_slice(other_members);

        self.session_id = None;
        self.nonce = None;
        self.ephemeral = None;
        let seed = AskeMessage {
            source: self.id.clone(),
            dest: Some(self.id.clone()),
            flow: Flow::Upflow,
            members,
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
        };
        self.upflow(&seed)
    }

    /// Append own nonce and ephemeral key; close the upflow if last.
    pub fn upflow(&mut self, message: &AskeMessage) -> Result<AskeMessage> {
        let mut seen = std::collections::BTreeSet::new();
        for member in &message.members {
            if !seen.insert(member) {
                return Err(GreetError::Argument(format!("duplicate member {member}")));
            }
        }
        if message.nonces.len() != message.pub_keys.len() {
            return Err(GreetError::Protocol("nonce/key vectors out of step".into()));
        }
        if message.nonces.len() >= message.members.len() {
            return Err(GreetError::Protocol("upflow already complete".into()));
        }
        self.members = message.members.clone();
        let my_pos = self.my_pos()?;
        if my_pos != message.nonces.len() {
            return Err(GreetError::Protocol(format!(
                "upflow reached position {} but {} holds position {my_pos}",
                message.nonces.len(),
                self.id
            )));
        }

        let nonce = random::bytes32();
        let ephemeral = KeyPair::generate();
        self.nonces = message.nonces.clone();
        self.pub_keys = message.pub_keys.clone();
        self.nonces.push(nonce);
        self.pub_keys.push(ephemeral.verifying_key.clone());
        self.nonce = Some(nonce);
        self.ephemeral = Some(ephemeral);

        if self.nonces.len() == self.members.len() {
            let sid = session_id(&self.members, &self.nonces);
            self.session_id = Some(sid);
            self.authenticated = vec![false; self.members.len()];
            self.authenticated[my_pos] = true;
            let signature = self.sign_session_ack(&sid)?;
            tracing::debug!(member = %self.id, sid = %hex::encode(sid), "session id established, broadcasting acknowledgement");
            Ok(AskeMessage {
                source: self.id.clone(),
                dest: None,
                flow: Flow::Downflow,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.pub_keys.clone(),
                session_signature: Some(signature),
            })
        } else {
            Ok(AskeMessage {
                source: self.id.clone(),
                dest: Some(self.members[my_pos + 1].clone()),
                flow: Flow::Upflow,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.pub_keys.clone(),
                session_signature: None,
            })
        }
    }

    /// Verify a session acknowledgement and, on first sight of a new
    /// session id, adopt it and answer with our own acknowledgement.
    pub fn downflow(
        &mut self,
        message: &AskeMessage,
        directory: &dyn KeyDirectory,
    ) -> Result<Option<AskeMessage>> {
        if message.nonces.len() != message.members.len()
            || message.pub_keys.len() != message.members.len()
        {
            return Err(GreetError::Protocol("downflow vectors out of step".into()));
        }
        let my_idx = message
            .members
            .iter()
            .position(|m| m == &self.id)
            .ok_or_else(|| GreetError::Protocol(format!("{} not in downflow", self.id)))?;
        let src_idx = message
            .members
            .iter()
            .position(|m| m == &message.source)
            .ok_or_else(|| GreetError::Protocol("downflow source is not a member".into()))?;

        let sid = session_id(&message.members, &message.nonces);
        let signature = message
            .session_signature
            .as_ref()
            .ok_or_else(|| GreetError::Authentication("downflow without session signature".into()))?;
        let static_pub = directory.lookup(&message.source).ok_or_else(|| {
            GreetError::Authentication(format!("no long-term key for {}", message.source))
        })?;
        let content = ack_content(
            &message.source,
            &message.pub_keys[src_idx],
            &message.nonces[src_idx],
            &sid,
        );
        static_pub
            .verify(&content, signature)
            .map_err(|_| GreetError::Authentication(format!("bad session signature from {}", message.source)))?;

        if self.session_id != Some(sid) {
            // First sight of this session id: adopt the vectors, reset the
            // acknowledgement ledger, and answer with our own signature.
            let (Some(own_nonce), Some(ephemeral)) = (self.nonce.as_ref(), self.ephemeral.as_ref())
            else {
                return Err(GreetError::Protocol(
                    "downflow before own contribution".into(),
                ));
            };
            if message.nonces[my_idx] != *own_nonce
                || message.pub_keys[my_idx] != ephemeral.verifying_key
            {
                return Err(GreetError::Protocol(
                    "downflow misrepresents our contribution".into(),
                ));
            }
            self.members = message.members.clone();
            self.nonces = message.nonces.clone();
            self.pub_keys = message.pub_keys.clone();
            self.session_id = Some(sid);
            self.authenticated = vec![false; self.members.len()];
            self.authenticated[my_idx] = true;
            self.authenticated[src_idx] = true;

            let signature = self.sign_session_ack(&sid)?;
            Ok(Some(AskeMessage {
                source: self.id.clone(),
                dest: None,
                flow: Flow::Downflow,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.pub_keys.clone(),
                session_signature: Some(signature),
            }))
        } else {
            self.authenticated[src_idx] = true;
            Ok(None)
        }
    }

    /// Extend the exchange to admit new members; resumes as an upflow.
    pub fn join(&mut self, new_members: &[UserId]) -> Result<AskeMessage> {
        if new_members.is_empty() {
            return Err(GreetError::Argument("no members to join".into()));
        }
        if self.session_id.is_none() {
            return Err(GreetError::Protocol("join before initial exchange".into()));
        }
        for member in new_members {
            if self.members.contains(member) {
                return Err(GreetError::Argument(format!("{member} already a member")));
            }
        }
        self.members.extend_from_slice(new_members);

        Ok(AskeMessage {
            source: self.id.clone(),
            dest: Some(new_members[0].clone()),
            flow: Flow::Upflow,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.pub_keys.clone(),
            session_signature: None,
        })
    }

    /// Drop members and re-acknowledge under the recomputed session id.
    pub fn exclude(&mut self, exclude: &[UserId]) -> Result<AskeMessage> {
        if exclude.is_empty() {
            return Err(GreetError::Argument("no members to exclude".into()));
        }
        if exclude.contains(&self.id) {
            return Err(GreetError::Argument("cannot exclude self".into()));
        }
        for member in exclude {
            if !self.members.contains(member) {
                return Err(GreetError::Argument(format!("{member} is not a member")));
            }
        }

        let keep: Vec<usize> = (0..self.members.len())
            .filter(|&i| !exclude.contains(&self.members[i]))
            .collect();
        self.members = keep.iter().map(|&i| self.members[i].clone()).collect();
        self.nonces = keep.iter().map(|&i| self.nonces[i]).collect();
        self.pub_keys = keep.iter().map(|&i| self.pub_keys[i].clone()).collect();

        let sid = session_id(&self.members, &self.nonces);
        self.session_id = Some(sid);
        self.authenticated = vec![false; self.members.len()];
        let my_pos = self.my_pos()?;
        self.authenticated[my_pos] = true;
        let signature = self.sign_session_ack(&sid)?;

        Ok(AskeMessage {
            source: self.id.clone(),
            dest: None,
            flow: Flow::Downflow,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.pub_keys.clone(),
            session_signature: Some(signature),
        })
    }

    /// Discard session state; the ephemeral private key is wiped, never
    /// published.
    pub fn quit(&mut self) {
        self.ephemeral = None;
        self.nonce = None;
        self.session_id = None;
        self.authenticated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Directory(HashMap<UserId, VerifyingKey>);

    impl KeyDirectory for Directory {
        fn lookup(&self, user: &UserId) -> Option<VerifyingKey> {
            self.0.get(user).cloned()
        }
    }

    fn fixture(names: &[&str]) -> (Vec<AskeMember>, Directory) {
        let mut members = Vec::new();
        let mut directory = HashMap::new();
        for name in names {
            let kp = KeyPair::generate();
            directory.insert(name.to_string(), kp.verifying_key.clone());
            members.push(AskeMember::new(*name, kp.signing_key));
        }
        (members, Directory(directory))
    }

    /// Run commit + upflows + the full downflow mesh.
    fn run_exchange(members: &mut [AskeMember], directory: &Directory) {
        let others: Vec<UserId> = members[1..].iter().map(|m| m.id().clone()).collect();
        let mut message = members[0].commit(&others).expect("commit");
        for member in &mut members[1..] {
            message = member.upflow(&message).expect("upflow");
        }
        assert_eq!(message.flow, Flow::Downflow);

        let mut downflows = vec![message];
        while let Some(message) = downflows.pop() {
            for member in members.iter_mut() {
                if member.id() == &message.source {
                    continue;
                }
                if let Some(response) = member.downflow(&message, directory).expect("downflow") {
                    downflows.push(response);
                }
            }
        }
    }

    #[test]
    fn test_three_member_exchange_acknowledges() {
        let (mut members, directory) = fixture(&["alice", "bob", "carol"]);
        run_exchange(&mut members, &directory);

        let sid = *members[0].session_id().expect("sid");
        for member in &members {
            assert_eq!(member.session_id(), Some(&sid));
            assert!(member.is_session_acknowledged(), "{} unacked", member.id());
        }
    }

    #[test]
    fn test_session_id_order_invariant() {
        let members_a = vec!["alice".to_string(), "bob".to_string()];
        let members_b = vec!["bob".to_string(), "alice".to_string()];
        let n1 = [1u8; 32];
        let n2 = [2u8; 32];
        assert_eq!(
            session_id(&members_a, &[n1, n2]),
            session_id(&members_b, &[n2, n1])
        );
        assert_ne!(
            session_id(&members_a, &[n1, n2]),
            session_id(&members_a, &[n2, n1])
        );
    }

    #[test]
    fn test_upflow_rejects_duplicates() {
        let (mut members, _) = fixture(&["alice"]);
        let seed = AskeMessage {
            source: "alice".into(),
            dest: Some("alice".into()),
            flow: Flow::Upflow,
            members: vec!["alice".into(), "alice".into()],
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
        };
        assert!(members[0].upflow(&seed).is_err());
    }

    #[test]
    fn test_upflow_rejects_non_member() {
        let (mut members, _) = fixture(&["mallory"]);
        let seed = AskeMessage {
            source: "alice".into(),
            dest: Some("mallory".into()),
            flow: Flow::Upflow,
            members: vec!["alice".into(), "bob".into()],
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
        };
        assert!(members[0].upflow(&seed).is_err());
    }

    #[test]
    fn test_downflow_rejects_forged_signature() {
        let (mut members, directory) = fixture(&["alice", "bob"]);
        let others = vec!["bob".to_string()];
        let message = members[0].commit(&others).expect("commit");
        let mut downflow = members[1].upflow(&message).expect("upflow");

        // Replace bob's signature with one from an unrelated key.
        let forged = KeyPair::generate().signing_key.sign(b"not the ack");
        downflow.session_signature = Some(forged);
        assert!(matches!(
            members[0].downflow(&downflow, &directory),
            Err(GreetError::Authentication(_))
        ));
    }

    #[test]
    fn test_downflow_requires_directory_entry() {
        let (mut members, _) = fixture(&["alice", "bob"]);
        let others = vec!["bob".to_string()];
        let message = members[0].commit(&others).expect("commit");
        let downflow = members[1].upflow(&message).expect("upflow");

        let empty = Directory(HashMap::new());
        assert!(matches!(
            members[0].downflow(&downflow, &empty),
            Err(GreetError::Authentication(_))
        ));
    }

    #[test]
    fn test_second_downflow_returns_none() {
        let (mut members, directory) = fixture(&["alice", "bob", "carol"]);
        let others: Vec<UserId> = members[1..].iter().map(|m| m.id().clone()).collect();
        let m1 = members[0].commit(&others).expect("commit");
        let m2 = members[1].upflow(&m1).expect("upflow");
        let downflow = members[2].upflow(&m2).expect("upflow");

        let alice_ack = members[0]
            .downflow(&downflow, &directory)
            .expect("downflow")
            .expect("first sight yields a response");
        // Carol already holds the sid; alice's ack is recorded silently.
        let response = members[2].downflow(&alice_ack, &directory).expect("downflow");
        assert!(response.is_none());
    }

    #[test]
    fn test_exclude_recomputes_session_id() {
        let (mut members, directory) = fixture(&["alice", "bob", "carol"]);
        run_exchange(&mut members, &directory);
        let old_sid = *members[0].session_id().expect("sid");

        let downflow = members[0].exclude(&["carol".to_string()]).expect("exclude");
        let new_sid = *members[0].session_id().expect("sid");
        assert_ne!(old_sid, new_sid);
        assert!(!members[0].is_session_acknowledged());

        let response = members[1]
            .downflow(&downflow, &directory)
            .expect("downflow")
            .expect("new sid yields response");
        members[0]
            .downflow(&response, &directory)
            .expect("downflow");
        assert!(members[0].is_session_acknowledged());
        assert!(members[1].is_session_acknowledged());
    }

    #[test]
    fn test_exclude_rejects_self() {
        let (mut members, directory) = fixture(&["alice", "bob"]);
        run_exchange(&mut members, &directory);
        assert!(members[0].exclude(&["alice".to_string()]).is_err());
    }

    #[test]
    fn test_join_extends_upflow() {
        let (mut members, directory) = fixture(&["alice", "bob"]);
        run_exchange(&mut members, &directory);

        let (mut joiners, joiner_dir) = fixture(&["carol"]);
        let mut directory_all = directory;
        directory_all
            .0
            .extend(joiner_dir.0.iter().map(|(k, v)| (k.clone(), v.clone())));

        let upflow = members[0].join(&["carol".to_string()]).expect("join");
        assert_eq!(upflow.dest.as_deref(), Some("carol"));
        let downflow = joiners[0].upflow(&upflow).expect("upflow");
        assert_eq!(downflow.flow, Flow::Downflow);
        assert_eq!(downflow.members.len(), 3);

        let mut responses = Vec::new();
        for member in members.iter_mut() {
            if let Some(r) = member.downflow(&downflow, &directory_all).expect("downflow") {
                responses.push(r);
            }
        }
        for response in responses {
            for member in members.iter_mut().chain(joiners.iter_mut()) {
                if member.id() != &response.source {
                    member.downflow(&response, &directory_all).expect("downflow");
                }
            }
        }
        for member in members.iter().chain(joiners.iter()) {
            assert!(member.is_session_acknowledged(), "{} unacked", member.id());
        }
    }

    #[test]
    fn test_quit_wipes_ephemeral() {
        let (mut members, directory) = fixture(&["alice", "bob"]);
        run_exchange(&mut members, &directory);
        members[0].quit();
        assert!(members[0].ephemeral_signing_key().is_none());
        assert!(members[0].session_id().is_none());
    }
}
