//! Penalty bookkeeping for one account.
//!
//! Two independent counters:
//!
//! - `penalty_count`: poll opportunities to skip. Grows by one per timeout or
//!   transient failure up to `max_penalty`, and jumps to
//!   `auth_failure_penalty` when authentication keeps failing.
//! - `auth_failures`: consecutive authentication-class failures. Reaching
//!   `auth_tries_until_penalty` applies the long penalty and resets it.
//!
//! A successful poll resets both.

use tracing::{debug, info};

/// Default cap for linear backoff.
pub const DEFAULT_MAX_PENALTY: u32 = 4;

/// Default consecutive auth failures before the long penalty.
pub const DEFAULT_AUTH_TRIES_UNTIL_PENALTY: u32 = 3;

/// Default long penalty, in skipped cycles.
pub const DEFAULT_AUTH_FAILURE_PENALTY: u32 = 10;

/// Configuration for the penalty tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyConfig {
    pub max_penalty: u32,
    pub auth_tries_until_penalty: u32,
    pub auth_failure_penalty: u32,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            max_penalty: DEFAULT_MAX_PENALTY,
            auth_tries_until_penalty: DEFAULT_AUTH_TRIES_UNTIL_PENALTY,
            auth_failure_penalty: DEFAULT_AUTH_FAILURE_PENALTY,
        }
    }
}

/// Result of recording an authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEscalation {
    /// Below the threshold; carries the current count.
    Counted(u32),
    /// Threshold reached; carries the penalty now in force.
    Penalized(u32),
}

#[derive(Debug, Clone)]
pub struct PenaltyTracker {
    penalty_count: u32,
    auth_failures: u32,
    config: PenaltyConfig,
}

impl PenaltyTracker {
    pub fn new() -> Self {
        Self::with_config(PenaltyConfig::default())
    }

    pub fn with_config(config: PenaltyConfig) -> Self {
        Self {
            penalty_count: 0,
            auth_failures: 0,
            config,
        }
    }

    pub fn penalty_count(&self) -> u32 {
        self.penalty_count
    }

    pub fn auth_failures(&self) -> u32 {
        self.auth_failures
    }

    pub fn is_penalized(&self) -> bool {
        self.penalty_count > 0
    }

    /// Consume one penalty cycle if any are pending.
    ///
    /// Returns the remaining count after the decrement, or `None` if the
    /// account is not penalized.
    pub fn take_penalty_cycle(&mut self) -> Option<u32> {
        if self.penalty_count == 0 {
            return None;
        }
        self.penalty_count -= 1;
        Some(self.penalty_count)
    }

    pub fn record_success(&mut self) {
        self.penalty_count = 0;
        self.auth_failures = 0;
    }

    /// A poll timed out or could not start. Leaves the auth counter alone.
    pub fn record_timeout(&mut self) -> u32 {
        self.bump();
        self.penalty_count
    }

    /// A poll failed for a non-authentication reason.
    pub fn record_transient_failure(&mut self) -> u32 {
        self.auth_failures = 0;
        self.bump();
        self.penalty_count
    }

    /// A poll failed authentication.
    pub fn record_auth_failure(&mut self) -> AuthEscalation {
        self.auth_failures += 1;
        if self.auth_failures >= self.config.auth_tries_until_penalty {
            self.auth_failures = 0;
            self.penalty_count = self.config.auth_failure_penalty;
            info!(
                penalty = self.penalty_count,
                "Repeated authentication failures, applying long penalty"
            );
            AuthEscalation::Penalized(self.penalty_count)
        } else {
            debug!(auth_failures = self.auth_failures, "Authentication failure counted");
            AuthEscalation::Counted(self.auth_failures)
        }
    }

    /// Drop pending penalty cycles, e.g. when new credentials arrive.
    pub fn clear_penalty(&mut self) {
        self.penalty_count = 0;
    }

    fn bump(&mut self) {
        if self.penalty_count < self.config.max_penalty {
            self.penalty_count += 1;
        }
    }
}

impl Default for PenaltyTracker {
    fn default() -> Self {
        Self::new()
    }
}
