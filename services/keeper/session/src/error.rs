//! Session error and termination types.

use std::fmt;

use thiserror::Error;

use crate::classifier::FailureCode;

/// Which attempt budget was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    /// `max_login_attempts`
    Login,
    /// `max_reconnect_attempts`
    Reconnect,
}

impl fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptKind::Login => write!(f, "login"),
            AttemptKind::Reconnect => write!(f, "reconnect"),
        }
    }
}

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Attempt budget exhausted
    #[error("{kind} attempt limit exceeded after {limit} attempts")]
    AttemptLimitExceeded {
        /// Exhausted budget
        kind: AttemptKind,
        /// Configured limit
        limit: u32,
    },

    /// Login rejected by the remote service
    #[error("authentication failure ({code}): {message}")]
    AuthenticationFailure {
        /// Service result code
        code: FailureCode,
        /// Free text from the client
        message: String,
    },

    /// Connection dropped while connected
    #[error("connection lost")]
    ConnectionLost,

    /// Controller task is gone (terminated or dropped)
    #[error("session controller unavailable")]
    ControllerUnavailable,

    /// Budget values that cannot drive a session
    #[error("invalid retry budget: {0}")]
    InvalidBudget(String),
}

/// Why the session ended. Surfaced to the process owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Controlled shutdown (signal or explicit request)
    ShutdownRequested,
    /// Gave up after exhausting retries
    AttemptLimitExceeded {
        /// Exhausted budget
        kind: AttemptKind,
        /// Configured limit
        limit: u32,
    },
    /// Permanent rejection
    Fatal {
        /// Service result code
        code: FailureCode,
        /// Free text from the client
        message: String,
    },
    /// The client's event stream closed underneath the controller
    ClientClosed,
}

impl TerminationReason {
    /// Process exit code for this reason
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::ShutdownRequested => 0,
            TerminationReason::AttemptLimitExceeded { .. } => 2,
            TerminationReason::Fatal { .. } => 3,
            TerminationReason::ClientClosed => 4,
        }
    }

    /// Whether this was a clean, requested exit
    pub fn is_clean(&self) -> bool {
        matches!(self, TerminationReason::ShutdownRequested)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::ShutdownRequested => write!(f, "shutdown requested"),
            TerminationReason::AttemptLimitExceeded { kind, limit } => {
                write!(f, "gave up: {} attempt limit ({}) exhausted", kind, limit)
            }
            TerminationReason::Fatal { code, message } => {
                write!(f, "permanent rejection ({}): {}", code, message)
            }
            TerminationReason::ClientClosed => write!(f, "client event stream closed"),
        }
    }
}

impl TryFrom<SessionError> for TerminationReason {
    type Error = SessionError;

    /// Only an exhausted budget ends the session on its own
    fn try_from(err: SessionError) -> Result<Self, Self::Error> {
        match err {
            SessionError::AttemptLimitExceeded { kind, limit } => {
                Ok(TerminationReason::AttemptLimitExceeded { kind, limit })
            }
            other => Err(other),
        }
    }
}
