use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use std::time::Duration;

use keeper_session::{Disposition, FailureEvent, LifecycleObserver, SessionState, TerminationReason};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Line formatter: `[timestamp] [keeper-component] [level] message key=value ...`
pub struct KeeperLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl KeeperLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: std::io::stdout().is_terminal(),
        }
    }

    /// Component comes from an explicit `component` field, else the module the event was logged from
    fn format_service_name(&self, component: Option<&str>, target: &str) -> String {
        let component = component.or_else(|| {
            target
                .starts_with("keeper")
                .then(|| target.rsplit("::").next())
                .flatten()
                .filter(|segment| !segment.starts_with("keeper"))
        });

        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for KeeperLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let formatted_service = self.format_service_name(visitor.component.as_deref(), metadata.target());
        let formatted_level = self.format_log_level(level);

        let color = self.color_for_level(level);
        let reset_color = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan_color = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] {}",
            cyan_color, timestamp, formatted_service, color, formatted_level, reset_color, visitor.message
        )?;
        if !visitor.fields.is_empty() {
            write!(writer, " {}{}{}", cyan_color, visitor.fields.trim_start(), reset_color)?;
        }
        writeln!(writer)
    }
}

/// Splits an event into its message, component and remaining structured fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: String,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(&rendered)
            .to_string();

        match field.name() {
            "message" => self.message = unquoted,
            "component" => self.component = Some(unquoted),
            name => {
                let _ = write!(self.fields, " {}={}", name, unquoted);
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {}={}", name, value);
            }
        }
    }
}

/// Lifecycle observer that reports through the log
#[derive(Debug, Default)]
pub struct LifecycleLogger;

impl LifecycleObserver for LifecycleLogger {
    fn notify_state_changed(&self, from: SessionState, to: SessionState) {
        tracing::info!(component = "lifecycle", from = %from, to = %to, "Session state changed");
    }

    fn notify_login_attempt(&self, attempt: u32, max_attempts: u32) {
        tracing::debug!(component = "lifecycle", "Logging in (attempt {}/{})", attempt, max_attempts);
    }

    fn notify_reconnect_scheduled(&self, attempt: u32, max_attempts: u32, delay: Duration) {
        tracing::debug!(
            component = "lifecycle",
            delay = %humantime::format_duration(delay),
            "Reconnect {}/{} scheduled",
            attempt,
            max_attempts
        );
    }

    fn notify_failure(&self, event: &FailureEvent, disposition: Disposition) {
        tracing::debug!(
            component = "lifecycle",
            code = %event.code,
            source = %event.source,
            disposition = %disposition,
            "Failure: {}",
            event.message
        );
    }

    fn notify_terminated(&self, reason: &TerminationReason) {
        tracing::debug!(
            component = "lifecycle",
            exit_code = reason.exit_code(),
            clean = reason.is_clean(),
            "Session terminated: {}",
            reason
        );
    }
}
