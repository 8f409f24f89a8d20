//! Composite greet state machine.
//!
//! Merges the CLIQUES and ASKE flows into single signed packets and walks
//! the membership state machine:
//!
//! ```text
//! NULL ─start→ INIT_UPFLOW ─last-upflow→ INIT_DOWNFLOW ─all-acked→ READY
//! READY ─include→ AUX_UPFLOW ─last-upflow→ AUX_DOWNFLOW ─all-acked→ READY
//! READY ─exclude/refresh→ AUX_DOWNFLOW ─all-acked→ READY
//! any   ─recover→ INIT_UPFLOW (recovering)
//! any   ─quit→ QUIT
//! ```
//!
//! Merging two sub-protocol messages into one packet requires equal source
//! and dest; a mismatch is a protocol violation. On QUIT the ephemeral
//! signing key is wiped without being published.

use serde::{Deserialize, Serialize};

use mpenc_codec::packet::{Agreement, Envelope, Flow, GreetPacket};
use mpenc_codec::wire;
use mpenc_crypto::ed25519::SigningKey;
use mpenc_types::{GroupKey, Hash, UserId};

use crate::aske::{AskeMember, AskeMessage};
use crate::cliques::{CliquesMember, CliquesMessage};
use crate::{GreetError, KeyDirectory, Result};

/// Greet protocol states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreetState {
    Null,
    InitUpflow,
    InitDownflow,
    AuxUpflow,
    AuxDownflow,
    Ready,
    Quit,
}

/// Result of processing one inbound greet packet.
#[derive(Debug, Default)]
pub struct GreetOutcome {
    /// A packet to broadcast in response, if any.
    pub response: Option<GreetPacket>,
    /// The packet completed the key agreement for us.
    pub became_ready: bool,
    /// The packet evicted us from the group.
    pub quit: bool,
}

/// Per-member greet protocol driver.
pub struct Greeter {
    id: UserId,
    static_key: SigningKey,
    state: GreetState,
    recovering: bool,
    cliques: CliquesMember,
    aske: AskeMember,
}

impl Greeter {
    pub fn new(id: impl Into<UserId>, static_key: SigningKey) -> Self {
        let id = id.into();
        Self {
            cliques: CliquesMember::new(id.clone()),
            aske: AskeMember::new(id.clone(), static_key.clone()),
            id,
            static_key,
            state: GreetState::Null,
            recovering: false,
        }
    }

    pub fn id(&self) -> &UserId {
        &self.id
    }

    pub fn state(&self) -> GreetState {
        self.state
    }

    pub fn recovering(&self) -> bool {
        self.recovering
    }

    pub fn members(&self) -> &[UserId] {
        self.cliques.members()
    }

    pub fn group_key(&self) -> Option<GroupKey> {
        self.cliques.group_key()
    }

    pub fn session_id(&self) -> Option<&Hash> {
        self.aske.session_id()
    }

    /// The ephemeral verification key a member bound to this session.
    pub fn ephemeral_pub_key_of(
        &self,
        member: &UserId,
    ) -> Option<&mpenc_crypto::ed25519::VerifyingKey> {
        self.aske.ephemeral_pub_key_of(member)
    }

    /// Our own session-ephemeral signing key; data messages are sealed
    /// with it.
    pub fn ephemeral_signing_key(&self) -> Option<&SigningKey> {
        self.aske.ephemeral_signing_key()
    }

    /// Seal a greet packet with the session-ephemeral signing key.
    pub fn seal(&self, packet: &GreetPacket) -> Result<String> {
        let key = self
            .aske
            .ephemeral_signing_key()
            .ok_or_else(|| GreetError::Authentication("no ephemeral signing key".into()))?;
        Ok(wire::armor(&packet.seal(key)?))
    }

    /// Verify a greet envelope against the sender's ephemeral key, taken
    /// from the packet's own vectors or from established session state.
    pub fn verify_envelope(&self, envelope: &Envelope, packet: &GreetPacket) -> Result<()> {
        let from_packet = packet
            .members
            .iter()
            .position(|m| m == &packet.source)
            .and_then(|idx| packet.pub_keys.get(idx));
        let key = from_packet
            .or_else(|| self.aske.ephemeral_pub_key_of(&packet.source))
            .ok_or_else(|| {
                GreetError::Authentication(format!("no ephemeral key for {}", packet.source))
            })?;
        envelope
            .verify(key)
            .map_err(|_| GreetError::Authentication(format!("bad packet signature from {}", packet.source)))
    }

    fn require_state(&self, allowed: &[GreetState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(GreetError::Protocol(format!(
                "cannot {action} in state {:?}",
                self.state
            )))
        }
    }

    /// Start the initial key agreement with the given other members.
    pub fn start(&mut self, other_members: &[UserId]) -> Result<GreetPacket> {
        self.require_state(&[GreetState::Null], "start")?;
        let cl = self.cliques.ika(other_members)?;
        let ask = self.aske.commit(other_members)?;
        let packet = merge(Some(cl), Some(ask), Agreement::Initial)?;
        self.state = GreetState::InitUpflow;
        tracing::info!(member = %self.id, others = ?other_members, "starting initial key agreement");
        Ok(packet)
    }

    /// Admit new members via an auxiliary upflow.
    pub fn include(&mut self, new_members: &[UserId]) -> Result<GreetPacket> {
        self.require_state(&[GreetState::Ready], "include")?;
        let cl = self.cliques.aka_join(new_members)?;
        let ask = self.aske.join(new_members)?;
        let packet = merge(Some(cl), Some(ask), Agreement::Auxiliary)?;
        self.state = GreetState::AuxUpflow;
        tracing::info!(member = %self.id, joining = ?new_members, "including members");
        Ok(packet)
    }

    /// Evict members via an auxiliary downflow.
    pub fn exclude(&mut self, members: &[UserId]) -> Result<GreetPacket> {
        self.require_state(&[GreetState::Ready], "exclude")?;
        let cl = self.cliques.aka_exclude(members)?;
        let ask = self.aske.exclude(members)?;
        let packet = merge(Some(cl), Some(ask), Agreement::Auxiliary)?;
        self.state = GreetState::AuxDownflow;
        self.maybe_ready();
        tracing::info!(member = %self.id, excluded = ?members, "excluding members");
        Ok(packet)
    }

    /// Rotate the group key without changing membership.
    pub fn refresh(&mut self) -> Result<GreetPacket> {
        self.require_state(&[GreetState::Ready], "refresh")?;
        let cl = self.cliques.aka_refresh()?;
        let packet = merge(Some(cl), None, Agreement::Auxiliary)?;
        self.state = GreetState::AuxDownflow;
        self.maybe_ready();
        tracing::info!(member = %self.id, "refreshing group key");
        Ok(packet)
    }

    /// Abandon a stuck agreement and restart from the current membership.
    pub fn recover(&mut self) -> Result<GreetPacket> {
        let others: Vec<UserId> = self
            .members()
            .iter()
            .filter(|m| *m != &self.id)
            .cloned()
            .collect();
        if others.is_empty() {
            return Err(GreetError::Protocol("nobody to recover with".into()));
        }
        self.cliques = CliquesMember::new(self.id.clone());
        self.aske = AskeMember::new(self.id.clone(), self.static_key.clone());
        self.state = GreetState::Null;
        self.recovering = true;
        tracing::warn!(member = %self.id, "recovering session via full re-agreement");
        self.start(&others)
    }

    /// Leave the session; terminal.
    pub fn quit(&mut self) {
        self.cliques.quit();
        self.aske.quit();
        self.state = GreetState::Quit;
        tracing::info!(member = %self.id, "quit session");
    }

    /// Process an inbound greet packet addressed to us (or broadcast).
    pub fn process(
        &mut self,
        packet: &GreetPacket,
        directory: &dyn KeyDirectory,
    ) -> Result<GreetOutcome> {
        if packet.source == self.id {
            // Our own broadcast reflected by the channel.
            return Ok(GreetOutcome::default());
        }
        if let Some(dest) = &packet.dest {
            if dest != &self.id {
                return Ok(GreetOutcome::default());
            }
        }
        if self.state == GreetState::Quit {
            tracing::debug!(member = %self.id, source = %packet.source, "dropping packet after quit");
            return Ok(GreetOutcome::default());
        }

        match packet.flow {
            Flow::Upflow => self.process_upflow(packet),
            Flow::Downflow => self.process_downflow(packet, directory),
        }
    }

    fn process_upflow(&mut self, packet: &GreetPacket) -> Result<GreetOutcome> {
        match packet.agreement {
            Agreement::Initial => {
                // An initial upflow reaching an established member is a
                // recovery re-agreement; drop current state and take part.
                if !matches!(self.state, GreetState::Null | GreetState::InitUpflow) {
                    tracing::warn!(member = %self.id, source = %packet.source, "initial upflow mid-session, treating as recovery");
                    self.cliques = CliquesMember::new(self.id.clone());
                    self.aske = AskeMember::new(self.id.clone(), self.static_key.clone());
                    self.state = GreetState::Null;
                    self.recovering = true;
                }
            }
            Agreement::Auxiliary => {
                // Auxiliary upflows only ever reach joining members.
                self.require_state(&[GreetState::Null], "accept auxiliary upflow")?
            }
        }

        let cl = self.cliques.upflow(&to_cliques(packet))?;
        let ask = self.aske.upflow(&to_aske(packet))?;
        let response = merge(Some(cl), Some(ask), packet.agreement)?;

        self.state = match (response.flow, packet.agreement) {
            (Flow::Upflow, Agreement::Initial) => GreetState::InitUpflow,
            (Flow::Upflow, Agreement::Auxiliary) => GreetState::AuxUpflow,
            (Flow::Downflow, Agreement::Initial) => GreetState::InitDownflow,
            (Flow::Downflow, Agreement::Auxiliary) => GreetState::AuxDownflow,
        };

        Ok(GreetOutcome {
            response: Some(response),
            became_ready: false,
            quit: false,
        })
    }

    fn process_downflow(
        &mut self,
        packet: &GreetPacket,
        directory: &dyn KeyDirectory,
    ) -> Result<GreetOutcome> {
        if !packet.members.is_empty() && !packet.members.contains(&self.id) {
            if self.state == GreetState::Null {
                // Traffic for a session we never joined.
                return Err(GreetError::Protocol(
                    "downflow for a session we are not part of".into(),
                ));
            }
            // An operation that dropped us; the excluded side just leaves.
            self.quit();
            return Ok(GreetOutcome {
                response: None,
                became_ready: false,
                quit: true,
            });
        }
        self.require_state(
            &[
                GreetState::InitUpflow,
                GreetState::InitDownflow,
                GreetState::AuxUpflow,
                GreetState::AuxDownflow,
                GreetState::Ready,
            ],
            "accept downflow",
        )?;

        let was_ready = self.state == GreetState::Ready;

        if !packet.int_keys.is_empty() {
            self.cliques.downflow(&to_cliques(packet))?;
        }
        let response = if !packet.nonces.is_empty() {
            self.aske
                .downflow(&to_aske(packet), directory)?
                .map(|ask| merge(None, Some(ask), packet.agreement))
                .transpose()?
        } else {
            None
        };

        self.state = match packet.agreement {
            Agreement::Initial => GreetState::InitDownflow,
            Agreement::Auxiliary => GreetState::AuxDownflow,
        };
        self.maybe_ready();

        Ok(GreetOutcome {
            response,
            became_ready: self.state == GreetState::Ready && !was_ready,
            quit: false,
        })
    }

    fn maybe_ready(&mut self) {
        if self.aske.is_session_acknowledged() && self.cliques.group_key().is_some() {
            self.state = GreetState::Ready;
            self.recovering = false;
        }
    }
}

fn to_cliques(packet: &GreetPacket) -> CliquesMessage {
    CliquesMessage {
        source: packet.source.clone(),
        dest: packet.dest.clone(),
        agreement: packet.agreement,
        flow: packet.flow,
        members: packet.members.clone(),
        int_keys: packet.int_keys.clone(),
    }
}

fn to_aske(packet: &GreetPacket) -> AskeMessage {
    AskeMessage {
        source: packet.source.clone(),
        dest: packet.dest.clone(),
        flow: packet.flow,
        members: packet.members.clone(),
        nonces: packet.nonces.clone(),
        pub_keys: packet.pub_keys.clone(),
        session_signature: packet.session_signature.clone(),
    }
}

/// Merge sub-protocol messages into one greet packet.
///
/// Both halves must agree on source and dest; a mismatch is fatal.
fn merge(
    cl: Option<CliquesMessage>,
    ask: Option<AskeMessage>,
    agreement: Agreement,
) -> Result<GreetPacket> {
    match (cl, ask) {
        (Some(cl), Some(ask)) => {
            if cl.source != ask.source || cl.dest != ask.dest {
                return Err(GreetError::Protocol(
                    "sub-protocol source/dest mismatch".into(),
                ));
            }
            if cl.flow != ask.flow {
                return Err(GreetError::Protocol("sub-protocol flow mismatch".into()));
            }
            Ok(GreetPacket {
                source: cl.source,
                dest: cl.dest,
                agreement,
                flow: cl.flow,
                members: cl.members,
                int_keys: cl.int_keys,
                nonces: ask.nonces,
                pub_keys: ask.pub_keys,
                session_signature: ask.session_signature,
                metadata: None,
            })
        }
        (Some(cl), None) => Ok(GreetPacket {
            source: cl.source,
            dest: cl.dest,
            agreement,
            flow: cl.flow,
            members: cl.members,
            int_keys: cl.int_keys,
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
            metadata: None,
        }),
        (None, Some(ask)) => Ok(GreetPacket {
            source: ask.source,
            dest: ask.dest,
            agreement,
            flow: ask.flow,
            members: ask.members,
            int_keys: Vec::new(),
            nonces: ask.nonces,
            pub_keys: ask.pub_keys,
            session_signature: ask.session_signature,
            metadata: None,
        }),
        (None, None) => Err(GreetError::Protocol("nothing to merge".into())),
    }
}
