//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Primary transport. Publish handlers need both transports.
    pub amqp_url: Option<SecretString>,
    pub amqp_queue: String,
    /// Secondary transport.
    pub redis_url: Option<SecretString>,
    pub redis_stream: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load dispatch settings from `path` (if given), then apply the
    /// environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let dispatch = match path {
            Some(path) => DispatchConfig::from_file(path)?,
            None => DispatchConfig::default(),
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            amqp_url: std::env::var("AMQP_URL").ok().map(SecretString::from),
            amqp_queue: std::env::var("AMQP_QUEUE").unwrap_or_else(|_| "outbound".to_string()),
            redis_url: std::env::var("REDIS_URL").ok().map(SecretString::from),
            redis_stream: std::env::var("REDIS_STREAM")
                .unwrap_or_else(|_| "outbound".to_string()),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dispatch: dispatch.with_env_overrides()?,
        })
    }
}

/// Dispatcher and router settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Sleep between polls.
    pub poll_interval: Duration,
    /// Maximum items claimed per batch.
    pub batch_size: usize,
    /// Failed attempts after which an item is dead-lettered.
    pub max_retries: u32,
    /// Linear backoff step: the n-th failure waits `backoff_base * n`.
    pub backoff_base: Duration,
    /// Upper bound on one handler execution.
    pub handler_timeout: Duration,
    /// How long a failed transport stays Unavailable.
    pub recovery_cooldown: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_retries: 3,
            backoff_base: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(30),
            recovery_cooldown: Duration::from_secs(5),
        }
    }
}

/// On-disk form. Every field is optional and falls back to the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DispatchFile {
    poll_interval_secs: Option<f64>,
    batch_size: Option<usize>,
    max_retries: Option<u32>,
    backoff_base_secs: Option<f64>,
    handler_timeout_secs: Option<f64>,
    recovery_cooldown_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    dispatch: DispatchFile,
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base, self.max_retries)
    }

    /// Parse a TOML document with an optional `[dispatch]` table.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        let d = file.dispatch;
        let defaults = Self::default();

        let config = Self {
            poll_interval: secs_or(d.poll_interval_secs, defaults.poll_interval, "poll_interval_secs")?,
            batch_size: d.batch_size.unwrap_or(defaults.batch_size),
            max_retries: d.max_retries.unwrap_or(defaults.max_retries),
            backoff_base: secs_or(d.backoff_base_secs, defaults.backoff_base, "backoff_base_secs")?,
            handler_timeout: secs_or(
                d.handler_timeout_secs,
                defaults.handler_timeout,
                "handler_timeout_secs",
            )?,
            recovery_cooldown: secs_or(
                d.recovery_cooldown_secs,
                defaults.recovery_cooldown,
                "recovery_cooldown_secs",
            )?,
        };
        config.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Apply `OUTBOUND_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("OUTBOUND_POLL_INTERVAL_SECS") {
            self.poll_interval = parse_secs("OUTBOUND_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("OUTBOUND_BATCH_SIZE") {
            self.batch_size = parse_var("OUTBOUND_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("OUTBOUND_MAX_RETRIES") {
            self.max_retries = parse_var("OUTBOUND_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("OUTBOUND_BACKOFF_BASE_SECS") {
            self.backoff_base = parse_secs("OUTBOUND_BACKOFF_BASE_SECS", &v)?;
        }
        if let Some(v) = lookup("OUTBOUND_HANDLER_TIMEOUT_SECS") {
            self.handler_timeout = parse_secs("OUTBOUND_HANDLER_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("OUTBOUND_RECOVERY_COOLDOWN_SECS") {
            self.recovery_cooldown = parse_secs("OUTBOUND_RECOVERY_COOLDOWN_SECS", &v)?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be positive".to_string()));
        }
        // The longest delay is scheduled from a timestamp, so it must fit one.
        let longest = self
            .backoff_base
            .checked_mul(self.max_retries)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| chrono::Utc::now().checked_add_signed(d));
        if longest.is_none() {
            return Err(Error::Config(format!(
                "backoff_base of {:?} times max_retries {} is out of range",
                self.backoff_base, self.max_retries
            )));
        }
        Ok(self)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name}: cannot parse '{value}'")))
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse_var(name, value)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::Config(format!("{name}: '{value}' is not a valid duration")))
}

fn secs_or(value: Option<f64>, default: Duration, name: &str) -> Result<Duration> {
    match value {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|_| Error::Config(format!("{name}: {secs} is not a valid duration"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_replace_file_values() {
        let file = DispatchConfig::from_toml("[dispatch]\nbatch_size = 50\nmax_retries = 7\n").unwrap();
        let env: HashMap<&str, &str> =
            [("OUTBOUND_BATCH_SIZE", "20"), ("OUTBOUND_BACKOFF_BASE_SECS", "0.5")].into();

        let config = file
            .with_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.backoff_base, Duration::from_millis(500));
    }

    #[test]
    fn unparseable_override_names_the_variable() {
        let err = DispatchConfig::default()
            .with_overrides(|name| (name == "OUTBOUND_MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("OUTBOUND_MAX_RETRIES"));
    }

    #[test]
    fn oversized_backoff_base_is_rejected() {
        for base in ["1e13", "1e17"] {
            let err = DispatchConfig::from_toml(&format!("[dispatch]\nbackoff_base_secs = {base}\n"))
                .unwrap_err();
            assert!(err.to_string().contains("out of range"), "{base}: {err}");
        }

        let err = DispatchConfig::default()
            .with_overrides(|name| {
                (name == "OUTBOUND_BACKOFF_BASE_SECS").then(|| "1e13".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // A large but representable base is fine.
        let config = DispatchConfig::from_toml("[dispatch]\nbackoff_base_secs = 86400\n").unwrap();
        assert_eq!(config.backoff_base, Duration::from_secs(86_400));
    }

    #[test]
    fn negative_duration_is_rejected() {
        let err = DispatchConfig::default()
            .with_overrides(|name| (name == "OUTBOUND_POLL_INTERVAL_SECS").then(|| "-1".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
