//! Session keeper binary.
//!
//! Keeps one account session logged in for as long as the process runs:
//! loads the account configuration, drives the session controller, runs the
//! heartbeat watchdog, and turns SIGINT/SIGTERM into an orderly logoff.
//!
//! Exit codes: `0` clean shutdown, `1` startup failure, `2` retry budget
//! exhausted, `3` fatal failure, `4` auth client went away.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use keeper_session::{
    HeartbeatMonitor, RetryPolicy, SessionController, ShutdownCoordinator, ShutdownOutcome,
    TerminationReason, TokenSink,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod sim;
mod sinks;

use config::KeeperConfig;
use logging::{KeeperLogFormatter, LifecycleLogger};
use sim::SimulatedAuthClient;
use sinks::CookieJar;

const CLIENT_EVENT_CAPACITY: usize = 64;
const STARTUP_FAILURE_EXIT_CODE: i32 = 1;

/// Long-lived session keeper
#[derive(Parser, Debug)]
#[command(name = "keeper", version, about = "Keeps an authenticated account session alive")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Probability that a simulated login fails or an established link drops
    #[arg(long, default_value_t = 0.1)]
    simulate_failure_rate: f64,

    /// Random spread applied to backoff delays, as a fraction (0 disables)
    #[arg(long, default_value_t = 0.0)]
    jitter: f64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("keeper={}", args.log_level).parse()?)
        .add_directive(format!("keeper_session={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(KeeperLogFormatter::new("keeper"))
        .init();

    info!("Starting session keeper v{}", env!("CARGO_PKG_VERSION"));

    let keeper_config = match KeeperConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Refusing to start: {}", e);
            std::process::exit(STARTUP_FAILURE_EXIT_CODE);
        }
    };

    let budget = keeper_config.retry_budget();
    let (events_tx, events_rx) = mpsc::channel(CLIENT_EVENT_CAPACITY);
    let client = Arc::new(SimulatedAuthClient::new(events_tx, args.simulate_failure_rate));

    let (controller, handle) = match SessionController::new(
        client,
        keeper_config.credentials(),
        budget.clone(),
        events_rx,
    ) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Refusing to start: {}", e);
            std::process::exit(STARTUP_FAILURE_EXIT_CODE);
        }
    };

    let mut controller = controller
        .with_classifier(keeper_config.classifier())
        .with_policy(RetryPolicy::from_budget(&budget).with_jitter(args.jitter));
    controller.set_observer(Arc::new(LifecycleLogger));

    let trade_manager = Arc::new(CookieJar::new("trade-manager"));
    let community = Arc::new(CookieJar::new("community"));
    controller.add_token_sink(trade_manager.clone());
    controller.add_token_sink(community.clone());

    let heartbeat = HeartbeatMonitor::new(handle.clone(), budget.heartbeat_interval).spawn();
    let coordinator = ShutdownCoordinator::new(handle.clone(), budget.shutdown_timeout);
    let mut session_task = tokio::spawn(controller.run());

    let reason = tokio::select! {
        joined = &mut session_task => match joined {
            Ok(reason) => reason,
            Err(e) => {
                error!("Session controller task failed: {}", e);
                heartbeat.abort();
                std::process::exit(STARTUP_FAILURE_EXIT_CODE);
            }
        },
        outcome = coordinator.wait_for_signal() => match outcome? {
            ShutdownOutcome::Completed(reason) => reason,
            ShutdownOutcome::TimedOut => {
                warn!("Forcing exit after shutdown timeout");
                session_task.abort();
                TerminationReason::ShutdownRequested
            }
            ShutdownOutcome::ControllerGone | ShutdownOutcome::AlreadyInProgress => {
                match session_task.await {
                    Ok(reason) => reason,
                    Err(_) => TerminationReason::ShutdownRequested,
                }
            }
        },
    };

    match heartbeat.await {
        Ok(stats) => info!(
            ticks = stats.ticks,
            online_ticks = stats.online_ticks,
            start_requests = stats.start_requests,
            "Heartbeat monitor finished"
        ),
        Err(e) => warn!("Heartbeat monitor ended abnormally: {}", e),
    }

    for jar in [&trade_manager, &community] {
        if let Some((session_id, at)) = jar.current() {
            info!(sink = %jar.name(), session_id = %session_id, refreshed = %at.to_rfc3339(), "Last web session");
        }
    }

    if reason.is_clean() {
        info!("Session keeper shutdown complete");
        return Ok(());
    }

    error!("Session keeper exiting: {}", reason);
    std::process::exit(reason.exit_code());
}
