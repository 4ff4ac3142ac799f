//! Data-driven failure classification.
//!
//! The classifier is a lookup table from [`FailureCode`] to [`Disposition`].
//! Codes that are not in the table fall back to a default disposition
//! (`Ignorable` unless configured otherwise). Swapping the table changes the
//! reconnect policy without touching the state machine.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Result code reported by the auth client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    /// Session is not logged on
    NotLoggedOn,
    /// No network connection
    NoConnection,
    /// Password rejected
    InvalidPassword,
    /// Remote did not answer in time
    Timeout,
    /// Connection could not be opened
    ConnectFailed,
    /// Connection opened but the handshake failed
    HandshakeFailed,
    /// Remote closed the connection
    RemoteDisconnect,
    /// Account does not exist
    AccountNotFound,
    /// Remote service unavailable
    ServiceUnavailable,
    /// Too many requests
    RateLimitExceeded,
    /// One-time code rejected
    InvalidLoginAuthCode,
    /// Account temporarily locked
    AccountLocked,
    /// Remote rejected an item type during login-time sync
    InvalidItemType,
    /// Logged in from another location
    LoggedInElsewhere,
    /// Account permanently banned
    Banned,
    /// Credentials cannot be parsed by the remote at all
    MalformedCredentials,
    /// Any other service-defined code
    Other(u32),
}

impl FailureCode {
    /// Every named code, in declaration order
    pub const NAMED: [FailureCode; 16] = [
        FailureCode::NotLoggedOn,
        FailureCode::NoConnection,
        FailureCode::InvalidPassword,
        FailureCode::Timeout,
        FailureCode::ConnectFailed,
        FailureCode::HandshakeFailed,
        FailureCode::RemoteDisconnect,
        FailureCode::AccountNotFound,
        FailureCode::ServiceUnavailable,
        FailureCode::RateLimitExceeded,
        FailureCode::InvalidLoginAuthCode,
        FailureCode::AccountLocked,
        FailureCode::InvalidItemType,
        FailureCode::LoggedInElsewhere,
        FailureCode::Banned,
        FailureCode::MalformedCredentials,
    ];

    /// Stable kebab-case name used in configuration and logs
    pub fn name(&self) -> String {
        let s = match self {
            FailureCode::NotLoggedOn => "not-logged-on",
            FailureCode::NoConnection => "no-connection",
            FailureCode::InvalidPassword => "invalid-password",
            FailureCode::Timeout => "timeout",
            FailureCode::ConnectFailed => "connect-failed",
            FailureCode::HandshakeFailed => "handshake-failed",
            FailureCode::RemoteDisconnect => "remote-disconnect",
            FailureCode::AccountNotFound => "account-not-found",
            FailureCode::ServiceUnavailable => "service-unavailable",
            FailureCode::RateLimitExceeded => "rate-limit-exceeded",
            FailureCode::InvalidLoginAuthCode => "invalid-login-auth-code",
            FailureCode::AccountLocked => "account-locked",
            FailureCode::InvalidItemType => "invalid-item-type",
            FailureCode::LoggedInElsewhere => "logged-in-elsewhere",
            FailureCode::Banned => "banned",
            FailureCode::MalformedCredentials => "malformed-credentials",
            FailureCode::Other(code) => return format!("code-{}", code),
        };
        s.to_string()
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Unrecognised failure code name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown failure code: {0}")]
pub struct UnknownFailureCode(pub String);

impl FromStr for FailureCode {
    type Err = UnknownFailureCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        if let Some(named) = Self::NAMED.iter().find(|c| c.name() == normalized) {
            return Ok(*named);
        }
        let raw = normalized.strip_prefix("code-").unwrap_or(&normalized);
        raw.parse::<u32>()
            .map(FailureCode::Other)
            .map_err(|_| UnknownFailureCode(s.to_string()))
    }
}

/// What the controller should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reconnect after backoff
    Retryable,
    /// Terminate the session
    Fatal,
    /// Log and carry on
    Ignorable,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Retryable => write!(f, "retryable"),
            Disposition::Fatal => write!(f, "fatal"),
            Disposition::Ignorable => write!(f, "ignorable"),
        }
    }
}

/// Lookup table mapping failure codes to dispositions
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    table: HashMap<FailureCode, Disposition>,
    fallback: Disposition,
}

impl ErrorClassifier {
    /// Create a classifier from an explicit table
    pub fn new(table: HashMap<FailureCode, Disposition>) -> Self {
        Self {
            table,
            fallback: Disposition::Ignorable,
        }
    }

    /// Codes that authorize reconnection by default
    pub fn default_retryable() -> &'static [FailureCode] {
        &[
            FailureCode::NotLoggedOn,
            FailureCode::NoConnection,
            FailureCode::InvalidPassword,
            FailureCode::Timeout,
            FailureCode::ConnectFailed,
            FailureCode::HandshakeFailed,
            FailureCode::RemoteDisconnect,
            FailureCode::AccountNotFound,
            FailureCode::ServiceUnavailable,
            FailureCode::RateLimitExceeded,
            FailureCode::InvalidLoginAuthCode,
            FailureCode::AccountLocked,
            FailureCode::InvalidItemType,
        ]
    }

    /// Codes that end the session by default
    pub fn default_fatal() -> &'static [FailureCode] {
        &[FailureCode::Banned, FailureCode::MalformedCredentials]
    }

    /// Change the disposition for codes missing from the table
    pub fn with_fallback(mut self, fallback: Disposition) -> Self {
        self.fallback = fallback;
        self
    }

    /// Set (or replace) a single entry
    pub fn set(&mut self, code: FailureCode, disposition: Disposition) {
        self.table.insert(code, disposition);
    }

    /// Apply a batch of overrides on top of the current table
    pub fn with_overrides<I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (FailureCode, Disposition)>,
    {
        for (code, disposition) in overrides {
            self.set(code, disposition);
        }
        self
    }

    /// Classify a failure code
    pub fn classify(&self, code: FailureCode) -> Disposition {
        self.table.get(&code).copied().unwrap_or(self.fallback)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let table = Self::default_retryable()
            .iter()
            .map(|code| (*code, Disposition::Retryable))
            .chain(
                Self::default_fatal()
                    .iter()
                    .map(|code| (*code, Disposition::Fatal)),
            )
            .collect();
        Self::new(table)
    }
}
