//! In-memory change feed for tests/dev.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tuyau_core::ResumeToken;

use crate::notification::RawNotification;
use crate::source::{resume_index, ChangeFeedSource, ChangeStream, SourceError};

const FOLLOW_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct FeedState {
    log: RwLock<Vec<RawNotification>>,
    acknowledged: Mutex<Vec<ResumeToken>>,
    connects: AtomicUsize,
    disconnect_next_read: AtomicBool,
}

/// In-memory, append-only change feed.
///
/// - No IO
/// - Resumes by scanning for the position token
/// - Finite by default; `following()` makes streams wait for new entries until
///   canceled, like a live feed
///
/// Clones share the same log, so a test can keep a handle for `push` and
/// inspection while the relay owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChangeFeed {
    state: Arc<FeedState>,
    follow: bool,
}

impl InMemoryChangeFeed {
    pub fn new(notifications: impl IntoIterator<Item = RawNotification>) -> Self {
        let feed = Self::default();
        feed.extend(notifications);
        feed
    }

    /// Streams opened from this handle block for new entries instead of ending.
    pub fn following(mut self) -> Self {
        self.follow = true;
        self
    }

    pub fn push(&self, notification: RawNotification) {
        self.extend([notification]);
    }

    pub fn extend(&self, notifications: impl IntoIterator<Item = RawNotification>) {
        if let Ok(mut log) = self.state.log.write() {
            log.extend(notifications);
        }
    }

    /// Make the next read on any open stream fail with `Disconnected`.
    pub fn disconnect_next_read(&self) {
        self.state.disconnect_next_read.store(true, Ordering::SeqCst);
    }

    /// Positions acknowledged so far, in acknowledgement order.
    pub fn acknowledged(&self) -> Vec<ResumeToken> {
        self.state
            .acknowledged
            .lock()
            .map(|acks| acks.clone())
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

impl ChangeFeedSource for InMemoryChangeFeed {
    type Stream = InMemoryChangeStream;

    fn connect(&self, resume_from: Option<&ResumeToken>) -> Result<Self::Stream, SourceError> {
        let cursor = {
            let log = self
                .state
                .log
                .read()
                .map_err(|_| SourceError::Connect("lock poisoned".to_string()))?;
            resume_index(log.iter().map(RawNotification::position), resume_from)?
        };

        self.state.connects.fetch_add(1, Ordering::SeqCst);

        Ok(InMemoryChangeStream {
            state: self.state.clone(),
            cursor,
            follow: self.follow,
        })
    }
}

#[derive(Debug)]
pub struct InMemoryChangeStream {
    state: Arc<FeedState>,
    cursor: usize,
    follow: bool,
}

impl ChangeStream for InMemoryChangeStream {
    fn next(&mut self, cancel: &CancellationToken) -> Result<Option<RawNotification>, SourceError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            if self.state.disconnect_next_read.swap(false, Ordering::SeqCst) {
                return Err(SourceError::Disconnected("injected disconnect".to_string()));
            }

            let next = {
                let log = self
                    .state
                    .log
                    .read()
                    .map_err(|_| SourceError::Disconnected("lock poisoned".to_string()))?;
                log.get(self.cursor).cloned()
            };

            match next {
                Some(notification) => {
                    self.cursor += 1;
                    return Ok(Some(notification));
                }
                None if self.follow => thread::sleep(FOLLOW_POLL),
                None => return Ok(None),
            }
        }
    }

    fn acknowledge(&mut self, position: &ResumeToken) -> Result<(), SourceError> {
        self.state
            .acknowledged
            .lock()
            .map_err(|_| SourceError::Acknowledge("lock poisoned".to_string()))?
            .push(position.clone());
        Ok(())
    }
}
