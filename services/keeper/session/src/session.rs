//! The session record owned by the controller.
//!
//! Nothing outside [`crate::controller`] mutates a [`Session`]. Other tasks see
//! its state only through the published `watch` channel.

use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::attempts::AttemptTracker;
use crate::retry::RetryBudget;

/// Lifecycle state of the logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Initial, nothing in flight
    Disconnected,
    /// A login attempt is in flight
    Authenticating,
    /// Logged on
    Connected,
    /// Waiting out a backoff delay
    Reconnecting,
    /// Absorbing end state
    Terminated,
}

impl SessionState {
    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Disconnected, Authenticating) => true,
            (Reconnecting, Authenticating) => true,
            (Authenticating, Connected) | (Reconnecting, Connected) => true,
            (Authenticating, Reconnecting) | (Connected, Reconnecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Authenticating => write!(f, "AUTHENTICATING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Delayed `start()` that can be revoked
#[derive(Debug)]
pub struct ScheduledReconnect {
    /// Matches the epoch carried by the start command the task will send
    pub epoch: u64,
    /// When the task will fire
    pub due: Instant,
    /// Timer task
    pub handle: JoinHandle<()>,
}

/// Logical connection record
#[derive(Debug)]
pub struct Session {
    /// Current state
    pub(crate) state: SessionState,
    /// Login and reconnect counters
    pub(crate) attempts: AttemptTracker,
    /// Delay chosen for the most recent reconnect (base after success)
    pub(crate) current_backoff_delay: Duration,
    /// Last time liveness was confirmed
    pub(crate) last_liveness: Instant,
    /// Set when a reconnect is scheduled, cleared when the next attempt begins
    pub(crate) reconnect_scheduled: bool,
    /// Outstanding reconnect timer
    pub(crate) pending_reconnect: Option<ScheduledReconnect>,
    /// Monotonic counter for scheduled reconnects
    pub(crate) reconnect_epoch: u64,
    /// Confirmation polling already requested this connected period
    pub(crate) confirmations_started: bool,
    /// Correlation id for the current connected period
    pub(crate) session_id: Option<Uuid>,
}

impl Session {
    /// Fresh record in `Disconnected`
    pub fn new(budget: &RetryBudget) -> Self {
        Self {
            state: SessionState::Disconnected,
            attempts: AttemptTracker::new(budget),
            current_backoff_delay: budget.base_delay,
            last_liveness: Instant::now(),
            reconnect_scheduled: false,
            pending_reconnect: None,
            reconnect_epoch: 0,
            confirmations_started: false,
            session_id: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Login attempts since the last success
    pub fn login_attempts(&self) -> u32 {
        self.attempts.login_attempts()
    }

    /// Reconnects since the last success
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.reconnect_attempts()
    }

    /// Most recent backoff delay
    pub fn current_backoff_delay(&self) -> Duration {
        self.current_backoff_delay
    }

    /// Last confirmed liveness
    pub fn last_liveness(&self) -> Instant {
        self.last_liveness
    }

    /// Whether a reconnect is pending
    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect_scheduled
    }

    /// Time left until the pending reconnect fires
    pub fn next_attempt_in(&self) -> Option<Duration> {
        self.pending_reconnect
            .as_ref()
            .map(|pending| pending.due.saturating_duration_since(Instant::now()))
    }

    /// Correlation id for the current connected period
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Mark liveness now
    pub(crate) fn note_liveness(&mut self) {
        self.last_liveness = Instant::now();
    }

    /// Abort the outstanding reconnect timer, if any
    pub(crate) fn cancel_pending_reconnect(&mut self) -> bool {
        match self.pending_reconnect.take() {
            Some(pending) => {
                pending.handle.abort();
                debug!("Cancelled scheduled reconnect (epoch {})", pending.epoch);
                true
            }
            None => false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_pending_reconnect();
    }
}
