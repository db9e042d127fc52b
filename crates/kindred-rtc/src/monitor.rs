//! Connectivity tracking and the bounded auto-recovery policy.

use std::time::Duration;

use kindred_common::config::RecoverySettings;
use serde::Serialize;

use crate::session::ConnectionState;

/// How many times a dropped connection is renegotiated, and how long to wait
/// before each attempt. `max_attempts = 0` disables auto-recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RecoveryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(1500),
        }
    }
}

impl From<&RecoverySettings> for RecoveryPolicy {
    fn from(s: &RecoverySettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            backoff: Duration::from_millis(s.backoff_ms),
        }
    }
}

/// What to do after a connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing to do.
    Wait,
    /// Renegotiate after the delay.
    Renegotiate { attempt: u32, after: Duration },
    /// Budget exhausted; the state stays surfaced for the caller.
    GiveUp,
}

/// Coarse status for display and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Interrupted,
    Ended,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::New | ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Disconnected => ConnectionStatus::Interrupted,
            ConnectionState::Failed | ConnectionState::Closed => ConnectionStatus::Ended,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionMonitor {
    policy: RecoveryPolicy,
    state: ConnectionState,
    attempts: u32,
}

/// A forwarded transition and the verdict for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub recovery: Recovery,
}

impl ConnectionMonitor {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::New,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.into()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record an engine report. Returns `None` for a repeat of the current
    /// state or anything reported after a terminal state.
    ///
    /// Only the side that `leads` recovery spends the budget; the other side
    /// always gets [`Recovery::Wait`] and waits for the peer's new offer.
    pub fn observe(&mut self, next: ConnectionState, leads: bool) -> Option<Transition> {
        if next == self.state || self.state.is_terminal() {
            return None;
        }
        let from = std::mem::replace(&mut self.state, next);

        let recovery = match next {
            ConnectionState::Connected => {
                self.attempts = 0;
                Recovery::Wait
            }
            state if state.is_retryable() && leads && self.policy.is_enabled() => {
                if self.attempts < self.policy.max_attempts {
                    self.attempts += 1;
                    Recovery::Renegotiate {
                        attempt: self.attempts,
                        after: self.policy.backoff.saturating_mul(self.attempts),
                    }
                } else {
                    Recovery::GiveUp
                }
            }
            _ => Recovery::Wait,
        };

        Some(Transition { from, to: next, recovery })
    }
}
