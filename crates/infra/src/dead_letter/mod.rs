//! Quarantine for change notifications that cannot be normalized.
//!
//! A malformed notification is a data-quality defect, not a transient fault:
//! retrying it would fail identically forever. Sinks keep the raw document and
//! the reason so an operator can inspect and replay it.

pub mod in_memory;
pub mod json_lines;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use tuyau_core::{MalformedNotification, ResumeToken};

pub use in_memory::InMemoryDeadLetterSink;
pub use json_lines::JsonLinesDeadLetterSink;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsDeadLetterSink;

/// One quarantined notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: Uuid,
    pub feed: String,
    /// Feed position of the notification, when it carried a usable one.
    pub position: Option<ResumeToken>,
    pub reason: String,
    pub raw: JsonValue,
    pub quarantined_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(feed: impl Into<String>, raw: JsonValue, error: &MalformedNotification) -> Self {
        Self {
            id: Uuid::now_v7(),
            feed: feed.into(),
            position: error.position().cloned(),
            reason: error.to_string(),
            raw,
            quarantined_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter storage error: {0}")]
    Storage(String),

    #[error("dead-letter serialization error: {0}")]
    Serialization(String),
}

pub trait DeadLetterSink: Send + Sync {
    fn quarantine(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

impl<S> DeadLetterSink for Arc<S>
where
    S: DeadLetterSink + ?Sized,
{
    fn quarantine(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        (**self).quarantine(letter)
    }
}
