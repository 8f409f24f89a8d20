//! Tick-based timer abstraction.
//!
//! The core is single-threaded cooperative; every scheduled callback is
//! cancellable and must not block. Tests inject [`VirtualTimer`] and drive
//! it deterministically; deployments wrap the platform monotonic clock
//! behind the same trait.

use std::cell::Cell;
use std::rc::Rc;

/// A scheduled callback.
pub type TimerCallback = Box<dyn FnOnce()>;

/// Cancellation handle for a scheduled callback.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            cancelled: Rc::new(Cell::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Scheduler contract: run a callback after a number of ticks.
pub trait Timer {
    fn after(&mut self, ticks: u32, cb: TimerCallback) -> TimerHandle;

    /// Advance one tick. Self-driven clocks ignore this; the virtual
    /// timer fires its due callbacks here.
    fn tick(&mut self) {}
}

struct Scheduled {
    deadline: u64,
    handle: TimerHandle,
    cb: TimerCallback,
}

/// Deterministic timer driven by explicit ticks.
#[derive(Default)]
pub struct VirtualTimer {
    now: u64,
    queue: Vec<Scheduled>,
}

impl VirtualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    fn step(&mut self) {
        self.now += 1;
        let due: Vec<Scheduled> = {
            let mut rest = Vec::new();
            let mut due = Vec::new();
            for item in self.queue.drain(..) {
                if item.deadline <= self.now {
                    due.push(item);
                } else {
                    rest.push(item);
                }
            }
            self.queue = rest;
            due
        };
        for item in due {
            if !item.handle.is_cancelled() {
                (item.cb)();
            }
        }
    }

    /// Advance several ticks.
    pub fn advance(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Number of callbacks still scheduled (including cancelled ones not
    /// yet reaped).
    pub fn scheduled(&self) -> usize {
        self.queue.len()
    }
}

impl Timer for VirtualTimer {
    fn after(&mut self, ticks: u32, cb: TimerCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        self.queue.push(Scheduled {
            deadline: self.now + u64::from(ticks.max(1)),
            handle: handle.clone(),
            cb,
        });
        handle
    }

    /// Advance one tick, firing every due, uncancelled callback in
    /// scheduling order.
    fn tick(&mut self) {
        self.step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_fires_after_ticks() {
        let fired = Rc::new(Cell::new(false));
        let mut timer = VirtualTimer::new();
        let fired_in_cb = fired.clone();
        timer.after(3, Box::new(move || fired_in_cb.set(true)));

        timer.advance(2);
        assert!(!fired.get());
        timer.tick();
        assert!(fired.get());
    }

    #[test]
    fn test_cancel_suppresses_callback() {
        let fired = Rc::new(Cell::new(false));
        let mut timer = VirtualTimer::new();
        let fired_in_cb = fired.clone();
        let handle = timer.after(1, Box::new(move || fired_in_cb.set(true)));
        handle.cancel();

        timer.advance(2);
        assert!(!fired.get());
    }

    #[test]
    fn test_zero_ticks_rounds_up() {
        let fired = Rc::new(Cell::new(false));
        let mut timer = VirtualTimer::new();
        let fired_in_cb = fired.clone();
        timer.after(0, Box::new(move || fired_in_cb.set(true)));
        timer.tick();
        assert!(fired.get());
    }

    #[test]
    fn test_firing_order_is_schedule_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut timer = VirtualTimer::new();
        for tag in ["first", "second"] {
            let order = order.clone();
            timer.after(1, Box::new(move || order.borrow_mut().push(tag)));
        }
        timer.tick();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }
}
