//! One-shot timers owned by the bus.
//!
//! A module arms a timer through [`Context::start_timer`][crate::Context::start_timer].
//! When the deadline passes, the bus enqueues
//! [`Message::TimerExpired`][devstate_types::Message::TimerExpired] addressed
//! to the owning module. Timers never repeat.

use std::time::Instant;

use thiserror::Error;

use crate::registry::ModuleId;

/// Maximum number of simultaneously pending timers.
pub const MAX_TIMERS: usize = 256;

/// Handle returned by [`Timers::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// `true` when an expiry notification's raw id names this timer.
    pub fn matches(self, raw: u64) -> bool {
        self.0 == raw
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("all timer slots are in use")]
    Exhausted,
    #[error("the daemon core cannot own timers")]
    NoOwner,
}

#[derive(Debug, Clone, Copy)]
struct PendingTimer {
    id: TimerId,
    owner: ModuleId,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct Timers {
    next_id: u64,
    pending: Vec<PendingTimer>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, owner: ModuleId, deadline: Instant) -> Result<TimerId, TimerError> {
        if self.pending.len() >= MAX_TIMERS {
            return Err(TimerError::Exhausted);
        }
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.pending.push(PendingTimer {
            id,
            owner,
            deadline,
        });
        Ok(id)
    }

    /// Cancel a pending timer. Cancelling a fired or unknown timer is a no-op.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|t| t.id != id);
        before != self.pending.len()
    }

    pub fn cancel_owned_by(&mut self, owner: ModuleId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|t| t.owner != owner);
        before - self.pending.len()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.iter().any(|t| t.id == id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|t| t.deadline).min()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(TimerId, ModuleId)> {
        let mut due: Vec<PendingTimer> = Vec::new();
        self.pending.retain(|t| {
            if t.deadline <= now {
                due.push(*t);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|t| (t.deadline, t.id));
        due.into_iter().map(|t| (t.id, t.owner)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Binding, Module, ModuleRegistry};
    use crate::{Context, Endpoint};
    use devstate_types::Message;
    use std::time::Duration;

    struct Dummy;

    impl Module for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }
        fn message_handlers(&self) -> Vec<Binding> {
            Vec::new()
        }
        fn handle(&mut self, _ctx: &mut Context<'_>, _from: &Endpoint, _msg: &Message) {}
    }

    fn owners() -> (ModuleId, ModuleId) {
        let mut reg = ModuleRegistry::new();
        (
            reg.insert(Box::new(Dummy), 0).unwrap(),
            reg.insert(Box::new(Dummy), 0).unwrap(),
        )
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let (a, _) = owners();
        let t0 = Instant::now();
        let mut timers = Timers::new();
        let late = timers.start(a, t0 + Duration::from_secs(5)).unwrap();
        let early = timers.start(a, t0 + Duration::from_secs(1)).unwrap();

        assert!(timers.take_due(t0).is_empty());
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_secs(1)));

        let fired = timers.take_due(t0 + Duration::from_secs(10));
        assert_eq!(fired, vec![(early, a), (late, a)]);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancel_is_idempotent() {
        let (a, _) = owners();
        let mut timers = Timers::new();
        let id = timers.start(a, Instant::now()).unwrap();
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(!timers.is_pending(id));
    }

    #[test]
    fn capacity_is_bounded() {
        let (a, _) = owners();
        let mut timers = Timers::new();
        let at = Instant::now();
        for _ in 0..MAX_TIMERS {
            timers.start(a, at).unwrap();
        }
        assert_eq!(timers.start(a, at), Err(TimerError::Exhausted));
    }

    #[test]
    fn cancel_owned_by_leaves_others() {
        let (a, b) = owners();
        let mut timers = Timers::new();
        let at = Instant::now();
        timers.start(a, at).unwrap();
        timers.start(a, at).unwrap();
        let keep = timers.start(b, at).unwrap();
        assert_eq!(timers.cancel_owned_by(a), 2);
        assert!(timers.is_pending(keep));
    }
}
