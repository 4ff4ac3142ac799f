//! Configuration handling for the keeper service.
//!
//! Values come from built-in defaults, then the shared YAML config file, then
//! environment variables. Account identity and secrets are required; the
//! service refuses to start without them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keeper_session::{
    Credentials, Disposition, ErrorClassifier, FailureCode, RetryBudget, SessionError,
    DEFAULT_HEARTBEAT_INTERVAL,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

const KEY_PREFIX: &str = "services.keeper.";

/// Startup configuration errors. All of them are fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required identity or secret values are missing
    #[error("missing required configuration: {}", .0.join(", "))]
    MissingRequired(Vec<&'static str>),

    /// A recognised option has an unusable value
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// The config file exists but cannot be read
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file exists but is not valid YAML
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Retry budget values are inconsistent
    #[error(transparent)]
    Budget(#[from] SessionError),
}

/// Keeper service configuration
#[derive(Clone)]
pub struct KeeperConfig {
    /// Account login name
    pub account_name: String,
    /// Account password
    pub password: String,
    /// One-time code secret
    pub shared_secret: String,
    /// Confirmation secret
    pub identity_secret: String,
    /// Login attempts before giving up
    pub max_login_attempts: u32,
    /// Reconnects before giving up
    pub max_reconnect_attempts: u32,
    /// First backoff delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Watchdog period
    pub heartbeat_interval: Duration,
    /// Confirmation polling period
    pub confirmation_interval: Duration,
    /// Bounded wait for shutdown completion
    pub shutdown_timeout: Duration,
    /// Extra codes treated as retryable
    pub retryable_codes: Vec<FailureCode>,
    /// Extra codes treated as fatal
    pub fatal_codes: Vec<FailureCode>,
    /// Extra codes treated as ignorable
    pub ignorable_codes: Vec<FailureCode>,
}

impl fmt::Debug for KeeperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeeperConfig")
            .field("account_name", &self.account_name)
            .field("password_set", &!self.password.is_empty())
            .field("shared_secret_set", &!self.shared_secret.is_empty())
            .field("identity_secret_set", &!self.identity_secret.is_empty())
            .field("max_login_attempts", &self.max_login_attempts)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("confirmation_interval", &self.confirmation_interval)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        let budget = RetryBudget::default();
        Self {
            account_name: String::new(),
            password: String::new(),
            shared_secret: String::new(),
            identity_secret: String::new(),
            max_login_attempts: budget.max_login_attempts,
            max_reconnect_attempts: budget.max_reconnect_attempts,
            base_delay: budget.base_delay,
            max_delay: budget.max_delay,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            confirmation_interval: budget.confirmation_interval,
            shutdown_timeout: budget.shutdown_timeout,
            retryable_codes: Vec::new(),
            fatal_codes: Vec::new(),
            ignorable_codes: Vec::new(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    keeper: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

/// Environment variables and the option each one sets
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("KEEPER_ACCOUNT_NAME", "account_name"),
    ("KEEPER_PASSWORD", "password"),
    ("KEEPER_SHARED_SECRET", "shared_secret"),
    ("KEEPER_IDENTITY_SECRET", "identity_secret"),
    ("KEEPER_MAX_LOGIN_ATTEMPTS", "max_login_attempts"),
    ("KEEPER_MAX_RECONNECT_ATTEMPTS", "max_reconnect_attempts"),
    ("KEEPER_BASE_DELAY", "base_delay"),
    ("KEEPER_MAX_DELAY", "max_delay"),
    ("KEEPER_HEARTBEAT_INTERVAL", "heartbeat_interval"),
    ("KEEPER_CONFIRMATION_INTERVAL", "confirmation_interval"),
    ("KEEPER_SHUTDOWN_TIMEOUT", "shutdown_timeout"),
];

impl KeeperConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` in place of the process environment
    pub fn load_with<P, F>(config_path: P, lookup: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let root_config: RootConfig = serde_yaml::from_str(&content)?;
                config.apply_root_config(root_config)?;
                info!("Loaded configuration from {:?}", config_path.as_ref());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: config_path.as_ref().to_path_buf(),
                    source: e,
                });
            }
        }

        config.apply_environment_overrides(lookup)?;
        config.validate()?;

        info!(
            "Final keeper configuration: account={}, max_login_attempts={}, max_reconnect_attempts={}, base_delay={:?}, max_delay={:?}, heartbeat={:?}",
            config.account_name,
            config.max_login_attempts,
            config.max_reconnect_attempts,
            config.base_delay,
            config.max_delay,
            config.heartbeat_interval
        );

        Ok(config)
    }

    /// Apply configuration from the root config structure
    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<(), ConfigError> {
        let Some(config_map) = root_config
            .services
            .and_then(|s| s.keeper)
            .and_then(|k| k.config)
        else {
            return Ok(());
        };

        for (key, value) in config_map {
            match key.strip_prefix(KEY_PREFIX) {
                Some(option) => self.apply_option(option, &value)?,
                None => warn!("Ignoring configuration key outside {}: {}", KEY_PREFIX, key),
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, option) in ENV_OVERRIDES {
            if let Some(value) = lookup(var) {
                self.apply_option(option, &value)?;
                info!("{} overridden by environment", option);
            }
        }
        Ok(())
    }

    fn apply_option(&mut self, option: &str, value: &str) -> Result<(), ConfigError> {
        match option {
            "account_name" => self.account_name = value.trim().to_string(),
            "password" => self.password = value.to_string(),
            "shared_secret" => self.shared_secret = value.trim().to_string(),
            "identity_secret" => self.identity_secret = value.trim().to_string(),
            "max_login_attempts" => self.max_login_attempts = parse_count(option, value)?,
            "max_reconnect_attempts" => self.max_reconnect_attempts = parse_count(option, value)?,
            "base_delay" => self.base_delay = parse_duration(option, value)?,
            "max_delay" => self.max_delay = parse_duration(option, value)?,
            "heartbeat_interval" => self.heartbeat_interval = parse_duration(option, value)?,
            "confirmation_interval" => self.confirmation_interval = parse_duration(option, value)?,
            "shutdown_timeout" => self.shutdown_timeout = parse_duration(option, value)?,
            "retryable_codes" => self.retryable_codes = parse_codes(option, value)?,
            "fatal_codes" => self.fatal_codes = parse_codes(option, value)?,
            "ignorable_codes" => self.ignorable_codes = parse_codes(option, value)?,
            _ => {
                // Ignore unknown configuration keys
            }
        }
        Ok(())
    }

    /// Refuse to proceed with an undefined session
    fn validate(&self) -> Result<(), ConfigError> {
        let missing: Vec<&'static str> = [
            ("account_name", &self.account_name),
            ("password", &self.password),
            ("shared_secret", &self.shared_secret),
            ("identity_secret", &self.identity_secret),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(ConfigError::MissingRequired(missing));
        }

        self.retry_budget().validate()?;
        Ok(())
    }

    /// Account material for the controller
    pub fn credentials(&self) -> Credentials {
        Credentials {
            account_name: self.account_name.clone(),
            password: self.password.clone(),
            shared_secret: self.shared_secret.clone(),
            identity_secret: self.identity_secret.clone(),
        }
    }

    /// Retry budget for the controller
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget {
            max_login_attempts: self.max_login_attempts,
            max_reconnect_attempts: self.max_reconnect_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            heartbeat_interval: self.heartbeat_interval,
            confirmation_interval: self.confirmation_interval,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Default classification table with configured overrides applied
    pub fn classifier(&self) -> ErrorClassifier {
        let overrides = self
            .retryable_codes
            .iter()
            .map(|c| (*c, Disposition::Retryable))
            .chain(self.fatal_codes.iter().map(|c| (*c, Disposition::Fatal)))
            .chain(self.ignorable_codes.iter().map(|c| (*c, Disposition::Ignorable)));
        ErrorClassifier::default().with_overrides(overrides)
    }
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_count(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|e| invalid(key, value, e))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| invalid(key, value, e))
}

fn parse_codes(key: &str, value: &str) -> Result<Vec<FailureCode>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<FailureCode>().map_err(|e| invalid(key, value, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn identity_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("KEEPER_ACCOUNT_NAME", "bot"),
            ("KEEPER_PASSWORD", "hunter2"),
            ("KEEPER_SHARED_SECRET", "c2hhcmVk"),
            ("KEEPER_IDENTITY_SECRET", "aWRlbnRpdHk="),
        ]
    }

    #[test]
    fn test_default_config() {
        let config = KeeperConfig::default();
        assert_eq!(config.max_login_attempts, 10);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(32));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.confirmation_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_missing_identity_is_fatal() {
        let err = KeeperConfig::load_with("/nonexistent/keeper.yaml", env(&[
            ("KEEPER_ACCOUNT_NAME", "bot"),
        ]))
        .unwrap_err();

        match err {
            ConfigError::MissingRequired(missing) => {
                assert_eq!(missing, vec!["password", "shared_secret", "identity_secret"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  keeper:
    enabled: true
    config:
      services.keeper.account_name: "filebot"
      services.keeper.max_login_attempts: "7"
      services.keeper.base_delay: "500ms"
      services.keeper.max_delay: "1m"
      services.keeper.heartbeat_interval: "45s"
      services.keeper.fatal_codes: "invalid-password, code-84"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut vars = identity_env();
        vars.retain(|(k, _)| *k != "KEEPER_ACCOUNT_NAME");
        let config = KeeperConfig::load_with(temp_file.path(), env(&vars)).unwrap();

        assert_eq!(config.account_name, "filebot");
        assert_eq!(config.max_login_attempts, 7);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(45));

        let classifier = config.classifier();
        assert_eq!(classifier.classify(FailureCode::InvalidPassword), Disposition::Fatal);
        assert_eq!(classifier.classify(FailureCode::Other(84)), Disposition::Fatal);
        assert_eq!(classifier.classify(FailureCode::Timeout), Disposition::Retryable);
    }

    #[test]
    fn test_environment_overrides_file() {
        let yaml_content = r#"
services:
  keeper:
    config:
      services.keeper.max_reconnect_attempts: "3"
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut vars = identity_env();
        vars.push(("KEEPER_MAX_RECONNECT_ATTEMPTS", "9"));
        let config = KeeperConfig::load_with(temp_file.path(), env(&vars)).unwrap();

        assert_eq!(config.max_reconnect_attempts, 9);
        assert_eq!(config.credentials().account_name, "bot");
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let mut vars = identity_env();
        vars.push(("KEEPER_BASE_DELAY", "soon"));
        let err = KeeperConfig::load_with("/nonexistent/keeper.yaml", env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "base_delay"));
    }

    #[test]
    fn test_inconsistent_budget_rejected() {
        let mut vars = identity_env();
        vars.push(("KEEPER_BASE_DELAY", "1m"));
        vars.push(("KEEPER_MAX_DELAY", "10s"));
        let err = KeeperConfig::load_with("/nonexistent/keeper.yaml", env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Budget(_)));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = KeeperConfig::load_with("/nonexistent/keeper.yaml", env(&identity_env())).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("c2hhcmVk"));
        assert!(rendered.contains("password_set: true"));
    }

    #[test]
    fn test_unreadable_config_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = KeeperConfig::load_with(dir.path(), env(&identity_env())).unwrap_err();

        match err {
            ConfigError::Read { path, .. } => assert_eq!(path, dir.path()),
            other => panic!("unexpected error: {}", other),
        }
    }
}
