//! Heartbeat watchdog.
//!
//! Network-level drops are not always reported as client events. The monitor
//! samples the published session state on a fixed period and, whenever the
//! session is not connected, pokes the controller with a heartbeat-origin start
//! request. The controller decides whether that poke does anything; heartbeat
//! pokes never count against the reconnect budget.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::controller::{SessionHandle, StartOrigin};
use crate::session::SessionState;

/// Default watchdog period
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Counters reported when the monitor stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Ticks observed
    pub ticks: u64,
    /// Ticks that found the session connected
    pub online_ticks: u64,
    /// Start requests sent to the controller
    pub start_requests: u64,
}

/// Periodic liveness check for a session
#[derive(Debug)]
pub struct HeartbeatMonitor {
    handle: SessionHandle,
    interval: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor for the session behind `handle`
    pub fn new(handle: SessionHandle, interval: Duration) -> Self {
        Self { handle, interval }
    }

    /// Run the monitor on its own task
    pub fn spawn(self) -> JoinHandle<HeartbeatStats> {
        tokio::spawn(self.run())
    }

    /// Tick until the session terminates or the controller goes away
    pub async fn run(self) -> HeartbeatStats {
        let mut stats = HeartbeatStats::default();
        let mut state_rx = self.handle.subscribe_state();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Heartbeat monitor running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    stats.ticks += 1;
                    let state = *state_rx.borrow();
                    match state {
                        SessionState::Terminated => break,
                        SessionState::Connected => {
                            stats.online_ticks += 1;
                            info!("Heartbeat: session is online");
                        }
                        other => {
                            warn!("Heartbeat: session is {}, requesting login", other);
                            if self.handle.request_start(StartOrigin::Heartbeat).await.is_err() {
                                debug!("Heartbeat: controller gone");
                                break;
                            }
                            stats.start_requests += 1;
                        }
                    }
                }

                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() == SessionState::Terminated {
                        break;
                    }
                }
            }
        }

        debug!("Heartbeat monitor stopped: {:?}", stats);
        stats
    }
}
