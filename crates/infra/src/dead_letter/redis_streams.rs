//! Redis Streams dead-letter sink (XADD on a DLQ key).
//!
//! Each quarantined notification becomes one stream entry with the fields
//! `letter_id`, `feed`, `position`, `reason`, `quarantined_at` and `payload`
//! (the full [`DeadLetter`] as JSON).

use std::sync::Arc;

use tracing::{instrument, warn};

use super::{DeadLetter, DeadLetterError, DeadLetterSink};

/// Default dead-letter stream key
pub const DEFAULT_DLQ_KEY: &str = "tuyau:notifications:dlq";

#[derive(Debug, Clone)]
pub struct RedisStreamsDeadLetterSink {
    client: Arc<redis::Client>,
    dlq_key: String,
}

impl RedisStreamsDeadLetterSink {
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `dlq_key` - stream key (default: "tuyau:notifications:dlq")
    pub fn new(redis_url: impl AsRef<str>, dlq_key: Option<String>) -> Result<Self, DeadLetterError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            dlq_key: dlq_key.unwrap_or_else(|| DEFAULT_DLQ_KEY.to_string()),
        })
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }
}

impl DeadLetterSink for RedisStreamsDeadLetterSink {
    #[instrument(skip(self, letter), fields(dlq_key = %self.dlq_key, letter_id = %letter.id), err)]
    fn quarantine(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(&letter)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        let position = letter
            .position
            .as_ref()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("letter_id")
            .arg(letter.id.to_string())
            .arg("feed")
            .arg(&letter.feed)
            .arg("position")
            .arg(position)
            .arg("reason")
            .arg(&letter.reason)
            .arg("quarantined_at")
            .arg(letter.quarantined_at.to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| DeadLetterError::Storage(format!("DLQ XADD failed: {}", e)))?;

        warn!(feed = %letter.feed, reason = %letter.reason, "notification sent to dead-letter stream");
        Ok(())
    }
}
