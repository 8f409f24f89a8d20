//! The session controller.
//!
//! User actions flow through the greet state machine into signed wire
//! packets; inbound traffic is classified, gated by the server-order
//! tracker where it carries membership-operation metadata, and either fed
//! back into the greeter or decrypted into the transcript. Authentication
//! and decryption failures drop the offending packet; internal
//! inconsistencies move the session to the error state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use mpenc_codec::message::{self, DataBody, DataContent, SealedData};
use mpenc_codec::packet::{Envelope, Flow, GreetPacket, OpMetadata, PacketKind};
use mpenc_codec::wire::{self, WireInbound};
use mpenc_crypto::ed25519::SigningKey;
use mpenc_greet::greeter::{GreetState, Greeter};
use mpenc_greet::serverorder::{self, PacketType, ServerOrder};
use mpenc_greet::{GreetError, KeyDirectory};
use mpenc_transcript::graph::{Message, MessageBody, PendingBuffer, Transcript, TranscriptEvent};
use mpenc_transcript::merge::{merge_parents, MergeCache};
use mpenc_transcript::TranscriptError;
use mpenc_types::events::SessionEvent;
use mpenc_types::{MessageId, UserId, SERVER_SENDER};

use crate::channel::{ChannelRecv, ChannelSend, GroupChannel};
use crate::keystore::SessionKeyStore;
use crate::monitor::{ConsistencyMonitor, MonitorEvent};
use crate::timer::Timer;
use crate::{Result, SessionError};

/// Tunables for a session.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    /// Minimum padded payload size; 0 disables exponential padding.
    pub padding_size: usize,
    /// Ticks before an unacked message warns.
    pub full_ack_timeout: u32,
    /// Active-ack monitor interval sequence; `None` disables it.
    pub active_ack_intervals: Option<Vec<u32>>,
    /// Memoise 3-way membership merges.
    pub merge_cache: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            padding_size: message::DEFAULT_PADDING_SIZE,
            full_ack_timeout: 32,
            active_ack_intervals: None,
            merge_cache: true,
        }
    }
}

/// Lifecycle of a session controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Quit,
    Error,
}

/// One member's end of an mpENC chat session.
pub struct Session<C: GroupChannel, T: Timer> {
    id: UserId,
    config: SessionConfig,
    directory: Box<dyn KeyDirectory>,
    channel: C,
    timer: T,
    greeter: Greeter,
    server_order: ServerOrder,
    transcript: Transcript,
    pending: PendingBuffer,
    monitor: ConsistencyMonitor,
    keystore: SessionKeyStore,
    merge_cache: MergeCache,
    events: VecDeque<SessionEvent>,
    channel_members: BTreeSet<UserId>,
    last_final_sender: UserId,
    ongoing_op_sender: Option<UserId>,
    status: SessionStatus,
}

impl<C: GroupChannel, T: Timer> Session<C, T> {
    /// Create a session for a user who just entered the channel.
    ///
    /// `creator` marks the member that opened the channel: its tracker is
    /// born synced with empty history, everyone else bootstraps from the
    /// first membership packet that includes them.
    pub fn new(
        id: impl Into<UserId>,
        static_key: SigningKey,
        directory: Box<dyn KeyDirectory>,
        channel: C,
        timer: T,
        config: SessionConfig,
        creator: bool,
    ) -> Self {
        let id = id.into();
        let merge_cache = if config.merge_cache {
            MergeCache::new()
        } else {
            MergeCache::disabled()
        };
        Self {
            greeter: Greeter::new(id.clone(), static_key),
            server_order: if creator {
                ServerOrder::new_channel()
            } else {
                ServerOrder::new()
            },
            monitor: ConsistencyMonitor::new(id.clone(), config.full_ack_timeout),
            transcript: Transcript::new(),
            pending: PendingBuffer::new(),
            keystore: SessionKeyStore::new(),
            merge_cache,
            events: VecDeque::new(),
            channel_members: BTreeSet::new(),
            last_final_sender: SERVER_SENDER.to_string(),
            ongoing_op_sender: None,
            status: SessionStatus::Active,
            id,
            config,
            directory,
            channel,
            timer,
        }
    }

    pub fn id(&self) -> &UserId {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn state(&self) -> GreetState {
        self.greeter.state()
    }

    /// True while a full recovery re-agreement is in flight.
    pub fn recovering(&self) -> bool {
        self.greeter.recovering()
    }

    pub fn members(&self) -> &[UserId] {
        self.greeter.members()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn server_order(&self) -> &ServerOrder {
        &self.server_order
    }

    /// Mutable access to the channel half, e.g. for test fixtures.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Drain pending notification events.
    pub fn poll_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    fn push_event(&mut self, event: SessionEvent) {
        self.events.push_back(event);
    }

    fn op_metadata(&self) -> OpMetadata {
        let (prev_pf, prev_ch) = self.server_order.metadata_base();
        OpMetadata {
            prev_pf,
            prev_ch,
            prev_sender: self.last_final_sender.clone(),
            parent_mids: self.transcript.heads().into_iter().cloned().collect(),
        }
    }

    fn broadcast_greet(&mut self, packet: &GreetPacket) -> Result<()> {
        let pubtxt = self.greeter.seal(packet)?;
        let recipients = match &packet.dest {
            Some(dest) => [dest.clone()].into_iter().collect(),
            None => packet
                .members
                .iter()
                .filter(|m| *m != &self.id)
                .cloned()
                .collect(),
        };
        self.channel.send(ChannelSend::Packet { pubtxt, recipients });
        Ok(())
    }

    /// Start the initial key agreement with the given members.
    pub fn start(&mut self, other_members: &[UserId]) -> Result<()> {
        self.ensure_active()?;
        let mut packet = self.greeter.start(other_members)?;
        packet.metadata = Some(self.op_metadata());
        self.broadcast_greet(&packet)
    }

    /// Admit new members to a ready session.
    pub fn include(&mut self, new_members: &[UserId]) -> Result<()> {
        self.ensure_active()?;
        let mut packet = self.greeter.include(new_members)?;
        packet.metadata = Some(self.op_metadata());
        self.broadcast_greet(&packet)
    }

    /// Evict members from a ready session.
    pub fn exclude(&mut self, members: &[UserId]) -> Result<()> {
        self.ensure_active()?;
        let mut packet = self.greeter.exclude(members)?;
        packet.metadata = Some(self.op_metadata());
        self.broadcast_greet(&packet)?;
        self.store_keys();
        Ok(())
    }

    /// Rotate the group key.
    pub fn refresh(&mut self) -> Result<()> {
        self.ensure_active()?;
        let mut packet = self.greeter.refresh()?;
        packet.metadata = Some(self.op_metadata());
        self.broadcast_greet(&packet)?;
        self.store_keys();
        Ok(())
    }

    /// Abandon a stuck agreement and re-run it from the current members.
    pub fn recover(&mut self) -> Result<()> {
        self.ensure_active()?;
        let mut packet = self.greeter.recover()?;
        packet.metadata = Some(self.op_metadata());
        self.broadcast_greet(&packet)
    }

    /// Leave the session. Terminal; fires final ack warnings.
    pub fn quit(&mut self) -> Result<()> {
        if self.status != SessionStatus::Active {
            return Ok(());
        }
        for event in self.monitor.stop() {
            let mapped = map_monitor_event(event);
            self.push_event(mapped);
        }
        self.greeter.quit();
        self.channel.send(ChannelSend::Membership {
            enter: BTreeSet::new(),
            leave: [self.id.clone()].into_iter().collect(),
        });
        self.status = SessionStatus::Quit;
        Ok(())
    }

    /// Encrypt and send a chat payload.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.send_body(DataBody::Payload(payload.to_vec()))
    }

    /// Send an explicit acknowledgement of everything we have seen.
    pub fn ack(&mut self) -> Result<()> {
        self.send_body(DataBody::Ack)
    }

    fn send_body(&mut self, body: DataBody) -> Result<()> {
        self.ensure_active()?;
        if self.greeter.state() != GreetState::Ready {
            return Err(SessionError::NotReady(
                "key agreement not complete".into(),
            ));
        }
        let session_id = *self
            .greeter
            .session_id()
            .ok_or_else(|| SessionError::NotReady("no session id".into()))?;
        let group_key = self
            .greeter
            .group_key()
            .ok_or_else(|| SessionError::NotReady("no group key".into()))?;
        let signing_key = self
            .greeter
            .ephemeral_signing_key()
            .ok_or_else(|| SessionError::NotReady("no ephemeral key".into()))?;

        let content = DataContent {
            parents: self.transcript.heads().into_iter().cloned().collect(),
            body,
        };
        let pubtxt = message::encode_data_message(
            &content,
            &session_id,
            &group_key,
            signing_key,
            self.config.padding_size,
        )?;
        let recipients = self
            .greeter
            .members()
            .iter()
            .filter(|m| *m != &self.id)
            .cloned()
            .collect();
        self.channel.send(ChannelSend::Packet { pubtxt, recipients });
        Ok(())
    }

    /// Feed one inbound channel item through the session.
    pub fn recv(&mut self, inbound: ChannelRecv) -> Result<()> {
        if self.status != SessionStatus::Active {
            return Ok(());
        }
        match inbound {
            ChannelRecv::Packet { pubtxt, sender, .. } => match wire::classify(&pubtxt) {
                WireInbound::Query => {
                    self.push_event(SessionEvent::QueryReceived { sender });
                    Ok(())
                }
                WireInbound::Plain(body) => {
                    self.push_event(SessionEvent::PlaintextReceived { sender, body });
                    Ok(())
                }
                WireInbound::Packet(bytes) => self.recv_wire(&pubtxt, sender, &bytes),
            },
            ChannelRecv::Membership {
                enter,
                leave,
                members,
            } => {
                self.recv_membership(&enter, &leave, members);
                Ok(())
            }
        }
    }

    /// Advance the timer one tick and surface monitor events.
    pub fn tick(&mut self) {
        self.timer.tick();
        let Self {
            monitor,
            timer,
            transcript,
            events,
            ..
        } = self;
        for event in monitor.drain(timer, |mid| transcript.unack_by(mid).ok().cloned()) {
            events.push_back(map_monitor_event(event));
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            SessionStatus::Active => Ok(()),
            SessionStatus::Quit => Err(SessionError::NotReady("session has quit".into())),
            SessionStatus::Error => Err(SessionError::NotReady("session is in error state".into())),
        }
    }

    fn drop_packet(&mut self, sender: &UserId, reason: String) {
        tracing::warn!(sender = %sender, reason = %reason, "dropping packet");
        self.push_event(SessionEvent::PacketDropped {
            sender: sender.clone(),
            reason,
        });
    }

    fn fatal(&mut self, reason: String) -> SessionError {
        tracing::error!(reason = %reason, "fatal session error");
        self.status = SessionStatus::Error;
        SessionError::Fatal(reason)
    }

    fn recv_wire(&mut self, pubtxt: &str, sender: UserId, bytes: &[u8]) -> Result<()> {
        let envelope = match Envelope::parse(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.drop_packet(&sender, message::drop_reason(&sender, &e));
                return Ok(());
            }
        };
        match envelope.kind {
            PacketKind::Greet => self.recv_greet(pubtxt, sender, &envelope),
            PacketKind::Data => self.recv_data(pubtxt, sender, bytes),
            PacketKind::Error => {
                // A peer announced a failure; surface it and move on.
                self.drop_packet(&sender, "peer reported a protocol error".into());
                Ok(())
            }
        }
    }

    fn recv_greet(&mut self, pubtxt: &str, sender: UserId, envelope: &Envelope) -> Result<()> {
        let packet = match GreetPacket::from_body(&envelope.body) {
            Ok(packet) => packet,
            Err(e) => {
                self.drop_packet(&sender, e.to_string());
                return Ok(());
            }
        };
        if packet.source != sender {
            self.drop_packet(&sender, "greet source does not match channel sender".into());
            return Ok(());
        }
        if let Err(e) = self.greeter.verify_envelope(envelope, &packet) {
            self.drop_packet(&sender, e.to_string());
            return Ok(());
        }

        // Boundary packets pass the server-order gate before the greeter
        // sees them.
        if let Some(meta) = packet.metadata.clone() {
            if !self.gate_boundary(pubtxt, &sender, &packet, &meta) {
                return Ok(());
            }
        }
        if packet.flow == Flow::Downflow {
            self.server_order.ack_chain(&sender);
        }

        let previous_members: BTreeSet<UserId> =
            self.greeter.members().iter().cloned().collect();
        let outcome = match self.greeter.process(&packet, self.directory.as_ref()) {
            Ok(outcome) => outcome,
            Err(GreetError::Authentication(e)) => {
                self.drop_packet(&sender, format!("authentication failed: {e}"));
                return Ok(());
            }
            Err(e) => {
                self.drop_packet(&sender, e.to_string());
                return Ok(());
            }
        };

        if let Some(mut response) = outcome.response {
            // A downflow answering an open operation closes it; carry the
            // operation's initial pid so receivers can match it.
            if response.flow == Flow::Downflow && !response.int_keys.is_empty() {
                if let Some(&pi) = self.server_order.ongoing_initial() {
                    let prev_ch = self
                        .server_order
                        .chain_hashes()
                        .last()
                        .copied()
                        .unwrap_or([0u8; 32]);
                    response.metadata = Some(OpMetadata {
                        prev_pf: pi,
                        prev_ch,
                        prev_sender: self
                            .ongoing_op_sender
                            .clone()
                            .unwrap_or_else(|| SERVER_SENDER.to_string()),
                        parent_mids: self.transcript.heads().into_iter().cloned().collect(),
                    });
                }
            }
            self.broadcast_greet(&response)?;
        }

        if outcome.quit {
            self.status = SessionStatus::Quit;
            for event in self.monitor.stop() {
                let mapped = map_monitor_event(event);
                self.push_event(mapped);
            }
            self.push_event(SessionEvent::MembersChanged {
                members: packet.members.clone(),
            });
            return Ok(());
        }

        if self.greeter.state() == GreetState::Ready {
            self.store_keys();
            let current: BTreeSet<UserId> = self.greeter.members().iter().cloned().collect();
            if outcome.became_ready {
                self.push_event(SessionEvent::SessionReady {
                    members: self.greeter.members().to_vec(),
                });
            }
            if current != previous_members {
                self.push_event(SessionEvent::MembersChanged {
                    members: self.greeter.members().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Apply the server-order acceptance rules to a boundary packet.
    /// Returns whether processing may continue.
    fn gate_boundary(
        &mut self,
        pubtxt: &str,
        sender: &UserId,
        packet: &GreetPacket,
        meta: &OpMetadata,
    ) -> bool {
        let channel_members: Vec<UserId> = if self.channel_members.is_empty() {
            packet.members.clone()
        } else {
            self.channel_members.iter().cloned().collect()
        };
        let pid = serverorder::packet_id(sender, &channel_members, pubtxt.as_bytes());
        let includes_self = packet.members.contains(&self.id);

        let accepted = if packet.flow == Flow::Upflow {
            let ok = self.server_order.accept_initial(
                PacketType::Initial,
                pid,
                sender,
                &channel_members,
                meta,
                includes_self,
            );
            if ok {
                self.ongoing_op_sender = Some(sender.clone());
            }
            ok
        } else if self.server_order.ongoing_initial() == Some(&meta.prev_pf) {
            let ok = self
                .server_order
                .accept_final(pid, sender, &channel_members, &meta.prev_pf);
            if ok {
                self.last_final_sender = sender.clone();
                self.ongoing_op_sender = None;
            }
            ok
        } else {
            // A downflow opening and closing an operation in one packet
            // (exclude, refresh).
            let ok = self.server_order.accept_initial(
                PacketType::Both,
                pid,
                sender,
                &channel_members,
                meta,
                includes_self,
            );
            if ok {
                self.last_final_sender = sender.clone();
                self.ongoing_op_sender = None;
            }
            ok
        };

        if accepted {
            self.server_order.authenticate_metadata();
        } else {
            self.drop_packet(sender, "membership packet rejected by server order".into());
        }
        accepted
    }

    fn recv_data(&mut self, pubtxt: &str, sender: UserId, bytes: &[u8]) -> Result<()> {
        let sealed = match SealedData::parse(bytes) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.drop_packet(&sender, e.to_string());
                return Ok(());
            }
        };
        let Some(sender_key) = self.keystore.sender_key(&sender) else {
            self.drop_packet(&sender, "no session key for sender".into());
            return Ok(());
        };
        if sealed.verify(sender_key).is_err() {
            self.drop_packet(&sender, "data packet signature invalid".into());
            return Ok(());
        }

        // Trial-decrypt across the generations matching the hint.
        let mut opened = None;
        for (generation, key) in self.keystore.candidates(sealed.sidkey_hint) {
            if let Ok(content) = sealed.open(&generation.session_id, key) {
                opened = Some((content, generation.members.clone()));
                break;
            }
        }
        let Some((content, generation_members)) = opened else {
            self.drop_packet(&sender, "no session key decrypts the message".into());
            return Ok(());
        };

        let mid = message::message_id(pubtxt);
        self.push_event(SessionEvent::MsgAccepted { mid: mid.clone() });

        let readers: BTreeSet<UserId> = generation_members
            .into_iter()
            .filter(|m| m != &sender)
            .collect();
        let msg = Message {
            mid,
            author: sender,
            parents: content.parents.into_iter().collect(),
            readers,
            body: match content.body {
                DataBody::Payload(data) => MessageBody::Payload(data),
                DataBody::Ack => MessageBody::Ack,
            },
        };
        self.ingest(msg)
    }

    /// Move a verified message through the delivery buffer into the
    /// transcript, firing readiness and ack events.
    fn ingest(&mut self, msg: Message) -> Result<()> {
        self.pending.push(msg);
        let ready = self.pending.drain_ready(&self.transcript);
        for msg in ready {
            let parents: Vec<MessageId> = msg.parents.iter().cloned().collect();
            if parents.len() > 1 {
                if let Err(TranscriptError::MergeConflict(e)) =
                    merge_parents(&self.transcript, &parents, &mut self.merge_cache)
                {
                    return Err(self.fatal(format!("membership merge conflict: {e}")));
                }
            }

            let mid = msg.mid.clone();
            let author = msg.author.clone();
            match self.transcript.add(msg) {
                Ok(acked) => {
                    self.push_event(SessionEvent::MsgReady { mid: mid.clone() });
                    match self.config.active_ack_intervals.clone() {
                        Some(intervals) => self.monitor.expect_with_active(
                            &mut self.timer,
                            mid,
                            intervals.into_iter(),
                        ),
                        None => self.monitor.expect(&mut self.timer, mid),
                    }
                    for event in acked {
                        let TranscriptEvent::FullyAcked(acked_mid) = event;
                        self.monitor.on_full_ack(&acked_mid);
                        self.push_event(SessionEvent::MsgFullyAcked { mid: acked_mid });
                    }
                }
                Err(e) => {
                    self.drop_packet(&author, e.to_string());
                }
            }
        }
        Ok(())
    }

    fn recv_membership(
        &mut self,
        _enter: &BTreeSet<UserId>,
        leave: &BTreeSet<UserId>,
        members: BTreeSet<UserId>,
    ) {
        if !leave.is_empty() {
            // The pseudo-packet context is the membership before eviction.
            let mut before: Vec<UserId> = members.union(leave).cloned().collect();
            before.sort();
            let leavers: Vec<UserId> = leave.iter().cloned().collect();
            self.server_order.accept_leave(&leavers, &before);
        }
        self.channel_members = members;
    }

    /// Record the current agreement's keys for decryption and signature
    /// verification.
    fn store_keys(&mut self) {
        let (Some(session_id), Some(group_key)) =
            (self.greeter.session_id().copied(), self.greeter.group_key())
        else {
            return;
        };
        let members = self.greeter.members().to_vec();
        let mut ephemeral_keys = BTreeMap::new();
        for member in &members {
            if let Some(key) = self.greeter.ephemeral_pub_key_of(member) {
                ephemeral_keys.insert(member.clone(), key.clone());
            }
        }
        self.keystore
            .update(session_id, members, group_key, ephemeral_keys);
    }
}

fn map_monitor_event(event: MonitorEvent) -> SessionEvent {
    match event {
        MonitorEvent::FullAckWarn { mid, last } => SessionEvent::FullAckWarn { mid, last },
        MonitorEvent::Unacked { mid } => SessionEvent::Unacked { mid },
        MonitorEvent::UnackByOwn { mid } => SessionEvent::UnackByOwn { mid },
    }
}
