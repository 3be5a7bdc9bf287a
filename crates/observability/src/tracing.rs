//! Tracing subscriber installation.
//!
//! JSON lines by default so per-attempt dispatch records (`feed`, `event_id`,
//! `outcome`, `reason`) stay machine-readable; `TUYAU_LOG_FORMAT=pretty` for
//! humans. Filtering follows `RUST_LOG`, falling back to the configured
//! default directive.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const LOG_FORMAT: &str = "TUYAU_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_directive: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// An unknown `TUYAU_LOG_FORMAT` falls back to JSON.
    pub fn from_env() -> Self {
        let format = std::env::var(LOG_FORMAT)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        Self {
            format,
            ..Self::default()
        }
    }
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true);

    match config.format {
        LogFormat::Json => builder.json().with_target(false).try_init().is_ok(),
        LogFormat::Pretty => builder.pretty().try_init().is_ok(),
    }
}
