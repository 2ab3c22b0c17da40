//! Leading-edge throttle with one trailing call.
//!
//! The first call in a window runs immediately. Calls made inside the window
//! collapse into a single trailing call at the end of it.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Run,
    /// Run at the given instant unless superseded.
    Defer(Instant),
}

#[derive(Debug, Clone)]
pub struct Throttle {
    limit: Duration,
    last_ran: Option<Instant>,
    trailing: Option<Instant>,
}

impl Throttle {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            last_ran: None,
            trailing: None,
        }
    }

    pub fn call(&mut self, now: Instant) -> ThrottleDecision {
        match self.last_ran {
            Some(last) if now.duration_since(last) < self.limit => {
                let at = last + self.limit;
                self.trailing = Some(at);
                ThrottleDecision::Defer(at)
            }
            _ => {
                self.last_ran = Some(now);
                self.trailing = None;
                ThrottleDecision::Run
            }
        }
    }

    /// Deadline of the pending trailing call.
    pub fn trailing_deadline(&self) -> Option<Instant> {
        self.trailing
    }

    /// Consume the trailing call if it is due.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.trailing {
            Some(at) if now >= at => {
                self.trailing = None;
                self.last_ran = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.last_ran = None;
        self.trailing = None;
    }
}
