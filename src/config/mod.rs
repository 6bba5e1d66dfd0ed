//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. The connection
//! string is wrapped in secrecy::SecretString so it never reaches a log line.

use crate::error::{Error, Result};
use secrecy::SecretString;

pub const DEFAULT_MAX_META_CHARS: usize = 2000;
pub const DEFAULT_MAX_ERR_STACK_CHARS: usize = 4000;
pub const DEFAULT_POOL_SIZE: u32 = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug)]
pub struct Config {
    /// Master switch for persistence. Without it the sink only logs.
    pub audit_enabled: bool,
    pub database_url: Option<SecretString>,
    pub log_level: String,
    pub max_meta_chars: usize,
    pub max_err_stack_chars: usize,
    pub pool_size: u32,
    /// Capacity of each dispatch shard.
    pub queue_capacity: usize,
    pub workers: usize,
    /// Also append every applied event to `job_events`.
    pub event_log: bool,
    pub otel_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audit_enabled: false,
            database_url: None,
            log_level: "info".to_string(),
            max_meta_chars: DEFAULT_MAX_META_CHARS,
            max_err_stack_chars: DEFAULT_MAX_ERR_STACK_CHARS,
            pool_size: DEFAULT_POOL_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            event_log: false,
            otel_endpoint: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let log_level = optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_level = parse_log_level(&log_level)?;

        Ok(Self {
            audit_enabled: parse_var("AUDIT_ENABLED", parse_bool)?.unwrap_or(false),
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            log_level,
            max_meta_chars: parse_var("LOG_MAX_META_CHARS", parse_number)?
                .unwrap_or(DEFAULT_MAX_META_CHARS),
            max_err_stack_chars: parse_var("LOG_MAX_ERR_STACK_CHARS", parse_number)?
                .unwrap_or(DEFAULT_MAX_ERR_STACK_CHARS),
            pool_size: parse_var("AUDIT_POOL_SIZE", parse_number)?
                .unwrap_or(DEFAULT_POOL_SIZE)
                .max(1),
            queue_capacity: parse_var("AUDIT_QUEUE_CAPACITY", parse_number)?
                .unwrap_or(DEFAULT_QUEUE_CAPACITY)
                .max(1),
            workers: parse_var("AUDIT_WORKERS", parse_number)?
                .unwrap_or(DEFAULT_WORKERS)
                .max(1),
            event_log: parse_var("AUDIT_EVENT_LOG", parse_bool)?.unwrap_or(false),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
        })
    }

    /// Persistence runs only when enabled and a storage target is configured.
    pub fn audit_active(&self) -> bool {
        self.audit_enabled && self.database_url.is_some()
    }
}

/// Empty values count as unset.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(name: &str, parse: fn(&str) -> Option<T>) -> Result<Option<T>> {
    match optional_var(name) {
        None => Ok(None),
        Some(raw) => parse(&raw)
            .map(Some)
            .ok_or_else(|| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

fn parse_log_level(raw: &str) -> Result<String> {
    let level = raw.to_ascii_lowercase();
    match level.as_str() {
        "debug" | "info" | "warn" | "error" => Ok(level),
        _ => Err(Error::Config(format!(
            "LOG_LEVEL must be one of debug|info|warn|error, got {raw:?}"
        ))),
    }
}
