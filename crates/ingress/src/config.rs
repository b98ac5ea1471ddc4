//! Environment-driven configuration.
//!
//! Everything is loaded once at startup under the `PAYGUARD_` prefix and
//! carried inside [`Config`]; no code reads the environment after that.
//! Secrets live in a wrapper whose `Debug` redacts, and are never logged.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "PAYGUARD_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(String),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// A credential that must never appear in logs or debug output.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Startup configuration for the whole process.
#[derive(Debug, Clone)]
pub struct Config {
    // Required
    pub payment_api_url: String,
    pub payment_api_key: Secret,
    pub webhook_secret: Secret,
    pub threat_intel_api_key: Secret,
    pub redis_url: String,
    pub database_url: String,

    // Optional, with defaults
    pub threat_intel_url: String,
    pub identity_api_url: Option<String>,
    pub identity_api_key: Option<Secret>,
    pub notification_url: Option<String>,
    pub notification_fallback_url: Option<String>,
    pub audit_fallback_dir: PathBuf,
    pub listen_addr: String,
    pub poll_interval: Duration,
    pub auto_poll: bool,
    pub max_in_flight: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,
    pub cycle_deadline: Duration,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            payment_api_url: required("PAYMENT_API_URL")?,
            payment_api_key: Secret::new(required("PAYMENT_API_KEY")?),
            webhook_secret: Secret::new(required("WEBHOOK_SECRET")?),
            threat_intel_api_key: Secret::new(required("THREAT_INTEL_API_KEY")?),
            redis_url: required("REDIS_URL")?,
            database_url: required("DATABASE_URL")?,

            threat_intel_url: optional("THREAT_INTEL_URL").unwrap_or_else(|| {
                "https://safebrowsing.googleapis.com/v4/threatMatches:find".to_string()
            }),
            identity_api_url: optional("IDENTITY_API_URL"),
            identity_api_key: optional("IDENTITY_API_KEY").map(Secret::new),
            notification_url: optional("NOTIFICATION_URL"),
            notification_fallback_url: optional("NOTIFICATION_FALLBACK_URL"),
            audit_fallback_dir: optional("AUDIT_FALLBACK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./audit-fallback")),
            listen_addr: optional("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            poll_interval: Duration::from_secs(parse_u64("POLL_INTERVAL_SECS", 30)?),
            auto_poll: parse_bool("AUTO_POLL", true)?,
            max_in_flight: parse_u64("MAX_IN_FLIGHT", 64)? as usize,
            breaker_failure_threshold: parse_u64("BREAKER_FAILURE_THRESHOLD", 5)? as u32,
            breaker_reset_timeout: Duration::from_secs(parse_u64("BREAKER_RESET_SECS", 30)?),
            cycle_deadline: Duration::from_secs(parse_u64("CYCLE_DEADLINE_SECS", 10)?),
        })
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(format!("{PREFIX}{key}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn required(key: &str) -> Result<String, ConfigError> {
    var(key).ok_or_else(|| ConfigError::Missing(format!("{PREFIX}{key}")))
}

fn optional(key: &str) -> Option<String> {
    var(key)
}

fn parse_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key: format!("{PREFIX}{key}"),
            value: raw,
        }),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match var(key) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: format!("{PREFIX}{key}"),
                value: raw,
            }),
        },
    }
}
