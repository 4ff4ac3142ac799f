//! Orderly, at-most-once session teardown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::controller::SessionHandle;
use crate::error::TerminationReason;

/// Result of a shutdown trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Controller confirmed termination
    Completed(TerminationReason),
    /// Controller did not confirm within the bound
    TimedOut,
    /// Controller already stopped
    ControllerGone,
    /// Another trigger got there first
    AlreadyInProgress,
}

/// Turns termination requests into a single controller shutdown
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    handle: SessionHandle,
    timeout: Duration,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    /// Create a coordinator waiting at most `timeout` for completion
    pub fn new(handle: SessionHandle, timeout: Duration) -> Self {
        Self {
            handle,
            timeout,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Shut the session down. Only the first caller does any work.
    pub async fn trigger(&self, source: &str) -> ShutdownOutcome {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Ignoring {}: shutdown already in progress", source);
            return ShutdownOutcome::AlreadyInProgress;
        }

        info!("Received {}. Shutting down gracefully...", source);

        let done = match self.handle.request_shutdown().await {
            Ok(done) => done,
            Err(_) => {
                warn!("Session controller already stopped");
                return ShutdownOutcome::ControllerGone;
            }
        };

        match tokio::time::timeout(self.timeout, done).await {
            Ok(Ok(reason)) => {
                info!("Session shutdown complete: {}", reason);
                ShutdownOutcome::Completed(reason)
            }
            Ok(Err(_)) => {
                warn!("Session controller dropped the shutdown request");
                ShutdownOutcome::ControllerGone
            }
            Err(_) => {
                warn!("Session shutdown did not complete within {:?}", self.timeout);
                ShutdownOutcome::TimedOut
            }
        }
    }

    /// Wait for SIGINT or SIGTERM, then shut down
    #[cfg(unix)]
    pub async fn wait_for_signal(&self) -> anyhow::Result<ShutdownOutcome> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

        let source = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };

        Ok(self.trigger(source).await)
    }

    /// Wait for Ctrl+C, then shut down
    #[cfg(not(unix))]
    pub async fn wait_for_signal(&self) -> anyhow::Result<ShutdownOutcome> {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install Ctrl+C handler: {}", e))?;
        Ok(self.trigger("Ctrl+C").await)
    }
}
