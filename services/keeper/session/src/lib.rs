//! Session lifecycle control for a long-lived authenticated connection.
//!
//! This crate keeps a session against a remote real-time service alive
//! indefinitely: it drives login attempts through an [`AuthClient`], backs off
//! between retries, classifies failures into retryable / fatal / ignorable, and
//! runs a heartbeat watchdog for drops the client never reports.
//!
//! ## Features
//!
//! - **State machine**: explicit `Disconnected → Authenticating → Connected →
//!   Reconnecting → Terminated` lifecycle owned by a single task
//! - **Backoff**: capped exponential delay between reconnects
//! - **Classification**: table-driven failure dispositions
//! - **Heartbeat**: periodic watchdog over the published session state
//! - **Shutdown**: at-most-once teardown on SIGINT/SIGTERM with a bounded wait
//!
//! ## Example
//!
//! ```rust,no_run
//! use keeper_session::{
//!     AuthClient, Credentials, HeartbeatMonitor, RetryBudget, SessionController,
//!     ShutdownCoordinator,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example(client: Arc<dyn AuthClient>, events: mpsc::Receiver<keeper_session::ClientEvent>) -> anyhow::Result<()> {
//! let credentials = Credentials {
//!     account_name: "bot".to_string(),
//!     password: "secret".to_string(),
//!     shared_secret: "shared".to_string(),
//!     identity_secret: "identity".to_string(),
//! };
//! let budget = RetryBudget::default();
//!
//! let (controller, handle) = SessionController::new(client, credentials, budget.clone(), events)?;
//! let heartbeat = HeartbeatMonitor::new(handle.clone(), budget.heartbeat_interval).spawn();
//! let shutdown = ShutdownCoordinator::new(handle, budget.shutdown_timeout);
//!
//! let session = tokio::spawn(controller.run());
//! tokio::select! {
//!     reason = session => println!("session ended: {}", reason?),
//!     outcome = shutdown.wait_for_signal() => println!("shutdown: {:?}", outcome?),
//! }
//! heartbeat.abort();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attempts;
pub mod classifier;
pub mod client;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod retry;
pub mod session;
pub mod shutdown;

// Re-export main types
pub use attempts::AttemptTracker;
pub use classifier::{Disposition, ErrorClassifier, FailureCode, UnknownFailureCode};
pub use client::{
    AuthClient, ClientError, ClientEvent, Credentials, FailureEvent, FailureSource, LogOnDetails,
    TokenSink, WebSessionToken,
};
pub use controller::{LifecycleObserver, SessionController, SessionHandle, StartOrigin};
pub use error::{AttemptKind, SessionError, TerminationReason};
pub use heartbeat::{HeartbeatMonitor, HeartbeatStats, DEFAULT_HEARTBEAT_INTERVAL};
pub use retry::{RetryBudget, RetryPolicy};
pub use session::{Session, SessionState};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
