//! Retry budget and exponential backoff.

use std::time::Duration;

use rand::Rng;

use crate::error::SessionError;

/// Attempt limits and timing for the session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    /// Login attempts allowed before giving up
    pub max_login_attempts: u32,
    /// Reconnects allowed before giving up
    pub max_reconnect_attempts: u32,
    /// First backoff delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Watchdog period
    pub heartbeat_interval: Duration,
    /// Period handed to the client's confirmation poller
    pub confirmation_interval: Duration,
    /// Bounded wait for shutdown completion
    pub shutdown_timeout: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_login_attempts: 10,
            max_reconnect_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            heartbeat_interval: Duration::from_secs(60),
            confirmation_interval: Duration::from_secs(20),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryBudget {
    /// Reject budgets that cannot drive a session
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.base_delay.is_zero() {
            return Err(SessionError::InvalidBudget("base_delay must be positive".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(SessionError::InvalidBudget(format!(
                "max_delay {:?} is below base_delay {:?}",
                self.max_delay, self.base_delay
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(SessionError::InvalidBudget(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if self.max_login_attempts == 0 {
            return Err(SessionError::InvalidBudget(
                "max_login_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Capped exponential backoff: `min(base * 2^(n-1), max)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    /// Create a policy without jitter
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Build from a budget
    pub fn from_budget(budget: &RetryBudget) -> Self {
        Self::new(budget.base_delay, budget.max_delay)
    }

    /// Add up to `fraction` of the delay as random jitter, still capped at `max_delay`
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// First delay in the sequence
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Deterministic delay for attempt `n` (1-based, 0 is treated as 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay actually used for scheduling; jittered when configured
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
        (delay + extra).min(self.max_delay)
    }
}
