//! Hold timeout scheduling
//!
//! The detector arms a single one-shot timer when a hold candidate is
//! captured. Firings are delivered by the host on the same logical
//! sequence as key events, so the trait hands out identifiers instead of
//! taking callbacks; a firing whose identifier no longer matches the
//! armed timer is stale and must be ignored by the receiver.

use std::time::{Duration, Instant};

/// Identifier for an armed timeout.
///
/// Scheduler implementations choose the values; the detector only ever
/// compares them. Identifiers are never reused within a scheduler, so a
/// canceled or superseded timer can never be confused with a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub u64);

/// One-shot timeout source for the hold detector
pub trait Scheduler {
    /// Arm a one-shot timeout, replacing any previously armed one
    fn arm(&mut self, delay: Duration) -> TimerId;

    /// Cancel an armed timeout; canceling an unknown or already-fired
    /// timer is a no-op
    fn cancel(&mut self, timer: TimerId);

    /// Take the armed timer if its deadline has passed
    fn due(&mut self, now: Instant) -> Option<TimerId>;

    /// Deadline of the armed timer, if any
    fn next_deadline(&self) -> Option<Instant>;
}

/// Wall-clock scheduler polled from the event tap's run loop
#[derive(Debug, Default)]
pub struct DeadlineScheduler {
    next_id: u64,
    armed: Option<(TimerId, Instant)>,
}

impl DeadlineScheduler {
    /// Create a scheduler with nothing armed
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for DeadlineScheduler {
    fn arm(&mut self, delay: Duration) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.armed = Some((id, Instant::now() + delay));
        id
    }

    fn cancel(&mut self, timer: TimerId) {
        if self.armed.map(|(id, _)| id) == Some(timer) {
            self.armed = None;
        }
    }

    fn due(&mut self, now: Instant) -> Option<TimerId> {
        match self.armed {
            Some((id, deadline)) if deadline <= now => {
                self.armed = None;
                Some(id)
            }
            _ => None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.armed.map(|(_, deadline)| deadline)
    }
}
