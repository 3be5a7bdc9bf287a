//! Process-wide logging setup for the relay.

pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};

/// Initialize logging from the environment (`RUST_LOG`, `TUYAU_LOG_FORMAT`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(&LogConfig::from_env());
}
