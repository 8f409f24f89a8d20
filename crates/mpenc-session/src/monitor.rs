//! Consistency monitoring of expected acknowledgements.
//!
//! Every expectation key carries a warning timer: if the key is not fully
//! acked within its timeout, `FullAckWarn { last: false }` fires. A key
//! may additionally carry an active-ack monitor driven by a caller-chosen
//! interval sequence, reporting `Unacked` each tick and `UnackByOwn` when
//! the local user itself still owes the ack. Full ack cancels both timers;
//! `stop` fires a terminal warning for every remaining key.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use mpenc_types::{MessageId, UserId};

use crate::timer::{Timer, TimerHandle};

/// Events reported by the monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The key was not fully acked in time; `last` marks the terminal
    /// warning emitted on stop.
    FullAckWarn { mid: MessageId, last: bool },
    /// Active-ack tick: the key is still awaiting acknowledgements.
    Unacked { mid: MessageId },
    /// Active-ack tick: the local user itself owes the acknowledgement.
    UnackByOwn { mid: MessageId },
}

enum Due {
    Warn(MessageId),
    Active(MessageId),
}

struct Entry {
    warn: TimerHandle,
    active: Option<ActiveAck>,
}

struct ActiveAck {
    handle: TimerHandle,
    intervals: Box<dyn Iterator<Item = u32>>,
}

/// Tracks ack expectations for the local user.
pub struct ConsistencyMonitor {
    owner: UserId,
    full_ack_timeout: u32,
    entries: HashMap<MessageId, Entry>,
    due: Rc<RefCell<VecDeque<Due>>>,
}

impl ConsistencyMonitor {
    pub fn new(owner: impl Into<UserId>, full_ack_timeout: u32) -> Self {
        Self {
            owner: owner.into(),
            full_ack_timeout,
            entries: HashMap::new(),
            due: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Ticks before an unacked key warns; uniform across keys.
    pub fn full_ack_timeout(&self, _mid: &MessageId) -> u32 {
        self.full_ack_timeout
    }

    pub fn is_watching(&self, mid: &MessageId) -> bool {
        self.entries.contains_key(mid)
    }

    /// Start expecting a full ack for a key.
    pub fn expect(&mut self, timer: &mut dyn Timer, mid: MessageId) {
        if self.entries.contains_key(&mid) {
            return;
        }
        let due = self.due.clone();
        let warn_mid = mid.clone();
        let warn = timer.after(
            self.full_ack_timeout(&mid),
            Box::new(move || due.borrow_mut().push_back(Due::Warn(warn_mid))),
        );
        self.entries.insert(mid, Entry { warn, active: None });
    }

    /// Start expecting a full ack with an active-ack monitor attached.
    pub fn expect_with_active(
        &mut self,
        timer: &mut dyn Timer,
        mid: MessageId,
        intervals: impl Iterator<Item = u32> + 'static,
    ) {
        self.expect(timer, mid.clone());
        let Some(entry) = self.entries.get_mut(&mid) else {
            return;
        };
        let mut intervals: Box<dyn Iterator<Item = u32>> = Box::new(intervals);
        if let Some(first) = intervals.next() {
            let due = self.due.clone();
            let active_mid = mid.clone();
            let handle = timer.after(
                first,
                Box::new(move || due.borrow_mut().push_back(Due::Active(active_mid))),
            );
            entry.active = Some(ActiveAck { handle, intervals });
        }
    }

    /// The key became fully acked; all its timers are cancelled.
    pub fn on_full_ack(&mut self, mid: &MessageId) {
        if let Some(entry) = self.entries.remove(mid) {
            entry.warn.cancel();
            if let Some(active) = entry.active {
                active.handle.cancel();
            }
        }
    }

    /// Convert fired timers into events, rescheduling active-ack monitors.
    ///
    /// `unack_by` reports the outstanding recipients of a key, or `None`
    /// when the key is not in the transcript yet.
    pub fn drain(
        &mut self,
        timer: &mut dyn Timer,
        unack_by: impl Fn(&MessageId) -> Option<BTreeSet<UserId>>,
    ) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        loop {
            let next = self.due.borrow_mut().pop_front();
            let Some(due) = next else { break };
            match due {
                Due::Warn(mid) => {
                    if self.entries.contains_key(&mid) {
                        tracing::warn!(mid = %mid, "message not fully acked within timeout");
                        events.push(MonitorEvent::FullAckWarn { mid, last: false });
                    }
                }
                Due::Active(mid) => {
                    let Some(entry) = self.entries.get_mut(&mid) else {
                        continue;
                    };
                    events.push(MonitorEvent::Unacked { mid: mid.clone() });
                    if let Some(outstanding) = unack_by(&mid) {
                        if outstanding.contains(&self.owner) {
                            events.push(MonitorEvent::UnackByOwn { mid: mid.clone() });
                        }
                    }
                    if let Some(active) = entry.active.as_mut() {
                        if let Some(next) = active.intervals.next() {
                            let due = self.due.clone();
                            let active_mid = mid.clone();
                            active.handle = timer.after(
                                next,
                                Box::new(move || {
                                    due.borrow_mut().push_back(Due::Active(active_mid))
                                }),
                            );
                        } else {
                            entry.active = None;
                        }
                    }
                }
            }
        }
        events
    }

    /// Cancel everything; every remaining key warns terminally.
    pub fn stop(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        let mut mids: Vec<MessageId> = self.entries.keys().cloned().collect();
        mids.sort();
        for mid in mids {
            if let Some(entry) = self.entries.remove(&mid) {
                entry.warn.cancel();
                if let Some(active) = entry.active {
                    active.handle.cancel();
                }
            }
            events.push(MonitorEvent::FullAckWarn { mid, last: true });
        }
        self.due.borrow_mut().clear();
        events
    }
}
