//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. Every variable
//! has a default so an empty environment yields a working setup.

pub mod jobs;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let capacity = parse_var("TASK_QUEUE_CAPACITY")?.unwrap_or(DEFAULT_CAPACITY);
        if capacity == 0 {
            return Err(Error::Config(
                "TASK_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let overflow = parse_var("TASK_QUEUE_OVERFLOW")?.unwrap_or_default();
        let shutdown_timeout = parse_var::<u64>("TASK_QUEUE_SHUTDOWN_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        Ok(Self {
            queue: QueueConfig {
                capacity,
                overflow,
                shutdown_timeout,
            },
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Sizing and shutdown behavior of the task queue and its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of buffered work items.
    pub capacity: usize,
    /// What enqueue does when the buffer is full.
    pub overflow: OverflowPolicy,
    /// How long the in-flight item may run after shutdown is requested.
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::Wait,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Behavior of enqueue when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the producer until the worker frees a slot.
    #[default]
    Wait,
    /// Fail immediately with `Error::QueueFull`.
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown overflow policy '{other}' (expected wait|reject)")),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OverflowPolicy::Wait => "wait",
            OverflowPolicy::Reject => "reject",
        };
        write!(f, "{s}")
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
