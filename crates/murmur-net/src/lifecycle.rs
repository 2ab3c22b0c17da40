//! Connection lifecycle state machine.
//!
//! Pure bookkeeping for status, attempt counting and session gating. The
//! manager task drives it from transport events and timers; keeping it free
//! of I/O makes every transition testable on its own.

use std::time::Duration;

use murmur_shared::ConnectionStatus;

use crate::backoff::ReconnectPolicy;

/// What the manager should do after the transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Schedule another attempt after `delay` (before jitter).
    Reconnect { attempt: u32, delay: Duration },
    /// The attempt cap was reached; stop retrying.
    Failed,
    /// Nothing to do (logged out, or the close was already handled).
    Idle,
}

#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    status: ConnectionStatus,
    attempt_count: u32,
    authenticated: bool,
    policy: ReconnectPolicy,
}

impl ConnectionLifecycle {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt_count: 0,
            authenticated: false,
            policy,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Whether a `connect()` request would open the transport right now.
    pub fn can_connect(&self) -> bool {
        self.authenticated
            && !matches!(
                self.status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            )
            && self.attempt_count < self.policy.max_attempts()
    }

    /// Move to `Connecting` if a connect is allowed. Returns `false` for the
    /// no-op cases (already connected or connecting, attempt cap reached, no
    /// session).
    pub fn begin_connect(&mut self) -> bool {
        if !self.can_connect() {
            return false;
        }
        self.status = ConnectionStatus::Connecting;
        true
    }

    pub fn on_open(&mut self) {
        self.status = ConnectionStatus::Connected;
        self.attempt_count = 0;
    }

    /// Handle a transport close or a failed connect attempt.
    pub fn on_close(&mut self) -> CloseOutcome {
        if !matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        ) {
            return CloseOutcome::Idle;
        }

        self.status = ConnectionStatus::Disconnected;
        if !self.authenticated {
            return CloseOutcome::Idle;
        }

        self.attempt_count += 1;
        if self.attempt_count >= self.policy.max_attempts() {
            self.status = ConnectionStatus::Failed;
            return CloseOutcome::Failed;
        }

        CloseOutcome::Reconnect {
            attempt: self.attempt_count,
            delay: self.policy.delay_for_attempt(self.attempt_count),
        }
    }

    /// A session became available. Backoff always starts fresh.
    pub fn login(&mut self) {
        self.authenticated = true;
        self.attempt_count = 0;
        if self.status == ConnectionStatus::Failed {
            self.status = ConnectionStatus::Disconnected;
        }
    }

    /// The session ended; the transport must be torn down by the caller.
    pub fn logout(&mut self) {
        self.authenticated = false;
        self.attempt_count = 0;
        self.status = ConnectionStatus::Disconnected;
    }
}
