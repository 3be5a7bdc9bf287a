//! Checkpoint persistence.
//!
//! A checkpoint is the resume token of the last change notification whose
//! publish was committed. It is keyed by feed name so several relays can share
//! one store. This enables:
//! - Resume after crash (reconnect the feed right after the last commit)
//! - No silent gaps (the checkpoint is only written after a commit)
//! - Deterministic restarts (clear a feed's checkpoint to replay from the start)

pub mod file;
pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use tuyau_core::ResumeToken;

pub use file::FileCheckpointStore;
pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint storage error: {0}")]
    Storage(String),

    #[error("checkpoint data is corrupt: {0}")]
    Corrupt(String),
}

/// Durable feed positions.
pub trait CheckpointStore: Send + Sync {
    /// Last committed position for `feed`, if any.
    fn load(&self, feed: &str) -> Result<Option<ResumeToken>, CheckpointError>;

    /// Replace the position for `feed`. Must be durable when it returns `Ok`.
    fn save(&self, feed: &str, position: &ResumeToken) -> Result<(), CheckpointError>;

    /// Forget the position for `feed` (the next run starts at the feed's default).
    fn clear(&self, feed: &str) -> Result<(), CheckpointError>;
}

impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    fn load(&self, feed: &str) -> Result<Option<ResumeToken>, CheckpointError> {
        (**self).load(feed)
    }

    fn save(&self, feed: &str, position: &ResumeToken) -> Result<(), CheckpointError> {
        (**self).save(feed, position)
    }

    fn clear(&self, feed: &str) -> Result<(), CheckpointError> {
        (**self).clear(feed)
    }
}
