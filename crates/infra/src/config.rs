//! Relay configuration from `TUYAU_*` variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TUYAU_FEED_NAME` | `default` |
//! | `TUYAU_FEED_PATH` | required |
//! | `TUYAU_PRODUCER_ID` | `tuyau-relay` |
//! | `TUYAU_TOPIC` | `tuyau-broadcast` |
//! | `TUYAU_BROKERS` | `localhost:9092` |
//! | `TUYAU_CHECKPOINT` | `file:tuyau-checkpoints.json` |
//! | `TUYAU_DEAD_LETTER_PATH` | unset (malformed notifications halt the relay) |
//! | `TUYAU_DEAD_LETTER_REDIS_URL` | unset; takes precedence over the path |
//! | `TUYAU_MAX_CONSECUTIVE_ABORTS` | `5` |
//! | `TUYAU_RETRY_BASE_MS` | `500` |
//! | `TUYAU_RETRY_MAX_MS` | `30000`, at most one hour |
//! | `TUYAU_RETRY_BACKOFF` | `exponential` (or `fixed`) |
//! | `TUYAU_TRANSACTION_TIMEOUT_MS` | `60000`, at most one hour |
//!
//! `TUYAU_CHECKPOINT` is `memory`, `file:<path>` or `postgres:<url>`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use tuyau_bus::publisher::DEFAULT_DESTINATION;
use tuyau_core::ProducerIdentity;

use crate::retry::{BackoffStrategy, RetryPolicy, MAX_BACKOFF};

pub const FEED_NAME: &str = "TUYAU_FEED_NAME";
pub const FEED_PATH: &str = "TUYAU_FEED_PATH";
pub const PRODUCER_ID: &str = "TUYAU_PRODUCER_ID";
pub const TOPIC: &str = "TUYAU_TOPIC";
pub const BROKERS: &str = "TUYAU_BROKERS";
pub const CHECKPOINT: &str = "TUYAU_CHECKPOINT";
pub const DEAD_LETTER_PATH: &str = "TUYAU_DEAD_LETTER_PATH";
pub const DEAD_LETTER_REDIS_URL: &str = "TUYAU_DEAD_LETTER_REDIS_URL";
pub const MAX_CONSECUTIVE_ABORTS: &str = "TUYAU_MAX_CONSECUTIVE_ABORTS";
pub const RETRY_BASE_MS: &str = "TUYAU_RETRY_BASE_MS";
pub const RETRY_MAX_MS: &str = "TUYAU_RETRY_MAX_MS";
pub const RETRY_BACKOFF: &str = "TUYAU_RETRY_BACKOFF";
pub const TRANSACTION_TIMEOUT_MS: &str = "TUYAU_TRANSACTION_TIMEOUT_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where checkpoints are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointTarget {
    /// Not durable; for local experiments only.
    Memory,
    File(PathBuf),
    Postgres(String),
}

impl FromStr for CheckpointTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("memory") {
            return Ok(Self::Memory);
        }
        if let Some(path) = s.strip_prefix("file:") {
            if path.is_empty() {
                return Err("empty file path".to_string());
            }
            return Ok(Self::File(PathBuf::from(path)));
        }
        if let Some(url) = s.strip_prefix("postgres:") {
            // Keep the scheme for `postgres://...` urls.
            let url = if url.starts_with("//") {
                format!("postgres:{url}")
            } else {
                url.to_string()
            };
            if url.is_empty() {
                return Err("empty database url".to_string());
            }
            return Ok(Self::Postgres(url));
        }
        Err("expected memory, file:<path> or postgres:<url>".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub feed_name: String,
    /// JSON-lines change feed to follow.
    pub feed_path: PathBuf,
    pub producer_id: ProducerIdentity,
    pub topic: String,
    pub brokers: String,
    pub checkpoint: CheckpointTarget,
    pub dead_letter_path: Option<PathBuf>,
    pub dead_letter_redis_url: Option<String>,
    pub retry: RetryPolicy,
    pub transaction_timeout: Duration,
}

impl RelayConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_map(&std::env::vars().collect())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let feed_path = get(FEED_PATH)
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing(FEED_PATH))?;

        let producer_id = get(PRODUCER_ID).unwrap_or("tuyau-relay");
        let producer_id = ProducerIdentity::new(producer_id).map_err(|e| ConfigError::Invalid {
            key: PRODUCER_ID,
            value: producer_id.to_string(),
            reason: e.to_string(),
        })?;

        let checkpoint = match get(CHECKPOINT) {
            Some(v) => v.parse().map_err(|reason| ConfigError::Invalid {
                key: CHECKPOINT,
                value: v.to_string(),
                reason,
            })?,
            None => CheckpointTarget::File(PathBuf::from("tuyau-checkpoints.json")),
        };

        let defaults = RetryPolicy::default();
        let max_failures = parse_or(
            get(MAX_CONSECUTIVE_ABORTS),
            MAX_CONSECUTIVE_ABORTS,
            defaults.max_failures,
        )?;
        let base_ms = parse_or(
            get(RETRY_BASE_MS),
            RETRY_BASE_MS,
            defaults.base_delay.as_millis() as u64,
        )?;
        let max_ms = parse_or(
            get(RETRY_MAX_MS),
            RETRY_MAX_MS,
            defaults.max_delay.as_millis() as u64,
        )?;
        let max_ms = at_most(max_ms, RETRY_MAX_MS, MAX_BACKOFF)?;
        if max_ms < base_ms {
            return Err(ConfigError::Invalid {
                key: RETRY_MAX_MS,
                value: max_ms.to_string(),
                reason: format!("must be at least {RETRY_BASE_MS} ({base_ms})"),
            });
        }
        let strategy = match get(RETRY_BACKOFF) {
            Some(v) => v.parse::<BackoffStrategy>().map_err(|reason| ConfigError::Invalid {
                key: RETRY_BACKOFF,
                value: v.to_string(),
                reason,
            })?,
            None => defaults.strategy,
        };
        let transaction_timeout_ms =
            parse_or(get(TRANSACTION_TIMEOUT_MS), TRANSACTION_TIMEOUT_MS, 60_000u64)?;
        let transaction_timeout_ms =
            at_most(transaction_timeout_ms, TRANSACTION_TIMEOUT_MS, MAX_BACKOFF)?;

        Ok(Self {
            feed_name: get(FEED_NAME).unwrap_or("default").to_string(),
            feed_path,
            producer_id,
            topic: get(TOPIC).unwrap_or(DEFAULT_DESTINATION).to_string(),
            brokers: get(BROKERS).unwrap_or("localhost:9092").to_string(),
            checkpoint,
            dead_letter_path: get(DEAD_LETTER_PATH).map(PathBuf::from),
            dead_letter_redis_url: get(DEAD_LETTER_REDIS_URL).map(str::to_string),
            retry: RetryPolicy {
                max_failures,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                strategy,
            },
            transaction_timeout: Duration::from_millis(transaction_timeout_ms),
        })
    }
}

fn parse_or<T>(value: Option<&str>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: v.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn at_most(ms: u64, key: &'static str, limit: Duration) -> Result<u64, ConfigError> {
    let limit_ms = limit.as_millis() as u64;
    if ms > limit_ms {
        return Err(ConfigError::Invalid {
            key,
            value: ms.to_string(),
            reason: format!("must not exceed {limit_ms}"),
        });
    }
    Ok(ms)
}
