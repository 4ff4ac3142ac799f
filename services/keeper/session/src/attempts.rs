//! Attempt counters checked against the retry budget

use tracing::{debug, warn};

use crate::error::{AttemptKind, SessionError};
use crate::retry::RetryBudget;

/// Tracks login and reconnect attempts since the last successful login
#[derive(Debug, Clone)]
pub struct AttemptTracker {
    /// Login attempts started since the last success
    login: u32,
    /// Reconnects scheduled since the last success
    reconnect: u32,
    /// Login ceiling
    max_login: u32,
    /// Reconnect ceiling
    max_reconnect: u32,
}

impl AttemptTracker {
    /// Create a tracker for the given budget
    pub fn new(budget: &RetryBudget) -> Self {
        Self {
            login: 0,
            reconnect: 0,
            max_login: budget.max_login_attempts,
            max_reconnect: budget.max_reconnect_attempts,
        }
    }

    /// Record a login attempt about to start.
    ///
    /// Fails without incrementing when the budget is already spent, so the
    /// counter never exceeds `max_login_attempts`.
    pub fn record_login(&mut self) -> Result<u32, SessionError> {
        if self.login >= self.max_login {
            warn!("Login budget exhausted after {} attempts", self.login);
            return Err(SessionError::AttemptLimitExceeded {
                kind: AttemptKind::Login,
                limit: self.max_login,
            });
        }
        self.login += 1;
        debug!("Recorded login attempt {}/{}", self.login, self.max_login);
        Ok(self.login)
    }

    /// Record a reconnect about to be scheduled
    pub fn record_reconnect(&mut self) -> Result<u32, SessionError> {
        if self.reconnect >= self.max_reconnect {
            warn!("Reconnect budget exhausted after {} attempts", self.reconnect);
            return Err(SessionError::AttemptLimitExceeded {
                kind: AttemptKind::Reconnect,
                limit: self.max_reconnect,
            });
        }
        self.reconnect += 1;
        debug!("Recorded reconnect {}/{}", self.reconnect, self.max_reconnect);
        Ok(self.reconnect)
    }

    /// Whether no further login may be started
    pub fn login_exhausted(&self) -> bool {
        self.login >= self.max_login
    }

    /// Clear both counters (successful login)
    pub fn reset(&mut self) -> bool {
        let had_failures = self.login > 1 || self.reconnect > 0;
        if had_failures {
            debug!(
                "Session recovered after {} login attempts and {} reconnects",
                self.login, self.reconnect
            );
        }
        self.login = 0;
        self.reconnect = 0;
        had_failures
    }

    /// Login attempts since the last success
    pub fn login_attempts(&self) -> u32 {
        self.login
    }

    /// Reconnects since the last success
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect
    }

    /// Configured login ceiling
    pub fn max_login_attempts(&self) -> u32 {
        self.max_login
    }

    /// Configured reconnect ceiling
    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect
    }
}
