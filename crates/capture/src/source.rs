//! Change feed abstraction (mechanics only).
//!
//! The relay needs four things from a feed: connect, resume from a previously
//! issued position, decode the next notification, and acknowledge what has been
//! consumed. Everything else about the feed (replication, storage, how it
//! tails the origin) is out of scope here.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use tuyau_core::ResumeToken;

use crate::notification::RawNotification;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("change feed connection failed: {0}")]
    Connect(String),

    /// The stream broke after it was established. Resumable when the caller
    /// holds a checkpoint.
    #[error("change feed disconnected: {0}")]
    Disconnected(String),

    #[error("resume position {0} is no longer available in the feed")]
    ResumePositionLost(ResumeToken),

    #[error("acknowledge failed: {0}")]
    Acknowledge(String),
}

/// Connects to an ordered, resumable change feed.
pub trait ChangeFeedSource: Send + Sync {
    type Stream: ChangeStream;

    /// Open a stream positioned right after `resume_from`, or at the feed's
    /// default start when no position is given.
    fn connect(&self, resume_from: Option<&ResumeToken>) -> Result<Self::Stream, SourceError>;
}

/// A connected cursor over the feed.
///
/// Owned by exactly one reader; never shared.
pub trait ChangeStream: Send {
    /// Block until the next notification is available.
    ///
    /// Returns `Ok(None)` when `cancel` fires or when a finite feed is
    /// exhausted.
    fn next(&mut self, cancel: &CancellationToken) -> Result<Option<RawNotification>, SourceError>;

    /// Mark everything up to and including `position` as consumed.
    fn acknowledge(&mut self, position: &ResumeToken) -> Result<(), SourceError>;
}

impl<S> ChangeFeedSource for Arc<S>
where
    S: ChangeFeedSource + ?Sized,
{
    type Stream = S::Stream;

    fn connect(&self, resume_from: Option<&ResumeToken>) -> Result<Self::Stream, SourceError> {
        (**self).connect(resume_from)
    }
}

/// Index of the first notification after `resume_from`.
///
/// Shared by the bundled feeds, which all resume by scanning for the token.
pub(crate) fn resume_index(
    positions: impl IntoIterator<Item = Option<ResumeToken>>,
    resume_from: Option<&ResumeToken>,
) -> Result<usize, SourceError> {
    let Some(token) = resume_from else {
        return Ok(0);
    };

    positions
        .into_iter()
        .position(|p| p.as_ref() == Some(token))
        .map(|idx| idx + 1)
        .ok_or_else(|| SourceError::ResumePositionLost(token.clone()))
}
