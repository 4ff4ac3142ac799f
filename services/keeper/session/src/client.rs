//! Auth client boundary.
//!
//! The controller never speaks the remote protocol. It drives an [`AuthClient`]
//! and consumes the [`ClientEvent`]s that client emits on an mpsc channel.
//! Credential exchange, one-time-code generation and token issuance all live
//! behind this trait.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::classifier::FailureCode;
use crate::error::SessionError;

/// Account material supplied by the process owner
#[derive(Clone)]
pub struct Credentials {
    /// Account login name
    pub account_name: String,
    /// Account password
    pub password: String,
    /// Secret the client derives one-time codes from
    pub shared_secret: String,
    /// Secret used by the confirmation poller
    pub identity_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_name", &self.account_name)
            .field("password", &"<redacted>")
            .field("shared_secret", &"<redacted>")
            .field("identity_secret", &"<redacted>")
            .finish()
    }
}

/// Freshly generated login request
#[derive(Clone)]
pub struct LogOnDetails {
    /// Account login name
    pub account_name: String,
    /// Account password
    pub password: String,
    /// One-time code for this attempt
    pub two_factor_code: String,
}

impl fmt::Debug for LogOnDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOnDetails")
            .field("account_name", &self.account_name)
            .field("password", &"<redacted>")
            .field("two_factor_code", &"<redacted>")
            .finish()
    }
}

/// Authenticated web session material (session id plus cookies)
#[derive(Clone, PartialEq, Eq)]
pub struct WebSessionToken {
    /// Opaque web session id
    pub session_id: String,
    /// Cookies for authenticated HTTP access
    pub cookies: Vec<String>,
}

impl fmt::Debug for WebSessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSessionToken")
            .field("session_id", &self.session_id)
            .field("cookies", &format_args!("<{} redacted>", self.cookies.len()))
            .finish()
    }
}

/// Lifecycle events emitted by the auth client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Login accepted
    LoggedOn,
    /// Login or runtime error
    Error {
        /// Service result code
        code: FailureCode,
        /// Free text
        message: String,
    },
    /// Connection dropped
    Disconnected {
        /// Service result code
        code: FailureCode,
        /// Free text
        message: String,
    },
    /// Web session issued or refreshed
    WebSession {
        /// New token
        token: WebSessionToken,
    },
}

/// Where a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// While a login attempt was in flight
    Login,
    /// While connected
    Runtime,
    /// Connection drop
    Disconnect,
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureSource::Login => write!(f, "login"),
            FailureSource::Runtime => write!(f, "runtime"),
            FailureSource::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// A single failure, consumed once by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    /// Service result code
    pub code: FailureCode,
    /// Free text
    pub message: String,
    /// Origin of the failure
    pub source: FailureSource,
}

impl FailureEvent {
    /// Create a failure event
    pub fn new(code: FailureCode, message: impl Into<String>, source: FailureSource) -> Self {
        Self {
            code,
            message: message.into(),
            source,
        }
    }
}

impl From<&FailureEvent> for SessionError {
    /// Drops become `ConnectionLost`; everything else is an authentication failure
    fn from(event: &FailureEvent) -> Self {
        match event.source {
            FailureSource::Disconnect => SessionError::ConnectionLost,
            FailureSource::Login | FailureSource::Runtime => SessionError::AuthenticationFailure {
                code: event.code,
                message: event.message.clone(),
            },
        }
    }
}

/// Errors returned synchronously by client calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Remote rejected the request with a result code
    #[error("rejected ({code}): {message}")]
    Rejected {
        /// Service result code
        code: FailureCode,
        /// Free text
        message: String,
    },

    /// Request could not be sent
    #[error("transport error: {0}")]
    Transport(String),

    /// One-time code could not be derived from the shared secret
    #[error("auth code generation failed: {0}")]
    AuthCode(String),
}

impl ClientError {
    /// Result code to classify this error by
    pub fn code(&self) -> FailureCode {
        match self {
            ClientError::Rejected { code, .. } => *code,
            ClientError::Transport(_) => FailureCode::ConnectFailed,
            ClientError::AuthCode(_) => FailureCode::MalformedCredentials,
        }
    }
}

/// Capability the controller drives to authenticate
#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Derive a one-time login code from the shared secret
    fn auth_code(&self, shared_secret: &str) -> Result<String, ClientError>;

    /// Begin a login. The outcome arrives later as a [`ClientEvent`].
    async fn log_on(&self, details: LogOnDetails) -> Result<(), ClientError>;

    /// End the session
    async fn log_off(&self) -> Result<(), ClientError>;

    /// Show the account as online (persona and presence) after a login
    async fn announce_online(&self) -> Result<(), ClientError>;

    /// Start (or restart) periodic trade confirmation polling
    async fn start_confirmation_polling(
        &self,
        interval: Duration,
        identity_secret: &str,
    ) -> Result<(), ClientError>;
}

/// Collaborator that needs the authenticated web session (trade manager, community client)
pub trait TokenSink: Send + Sync + fmt::Debug {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Replace the token in use. May be called many times per connected period.
    fn apply_token(&self, token: &WebSessionToken);
}
