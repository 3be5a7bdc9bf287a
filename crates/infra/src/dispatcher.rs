//! Dispatch loop: change feed → normalizer → transactional publisher → checkpoint.
//!
//! ```text
//! load checkpoint ─► connect feed
//!                      │
//!                      ▼
//!            next notification ──(malformed)──► dead-letter / halt
//!                      │
//!                      ▼
//!                  normalize
//!                      │
//!                      ▼
//!                   publish ──(aborted)──► back off, publish the same event again
//!                      │      (abort-failed)► halt
//!                      ▼
//!          save checkpoint, then acknowledge
//! ```
//!
//! Exactly one notification is in flight at any time and the orchestrator is
//! the only owner of the feed cursor, so the published order is the feed
//! order. The checkpoint moves strictly after a committed publish; an aborted
//! or ambiguous attempt never moves it.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tuyau_bus::{
    EventCodec, JsonCodec, ProducerFactory, PublishFailure, PublishOutcome, TransactionalPublisher,
};
use tuyau_capture::{normalize, ChangeFeedSource, ChangeStream, RawNotification, SourceError};
use tuyau_core::{ChangeEvent, MalformedNotification, ResumeToken};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use crate::retry::{RetryPolicy, MAX_BACKOFF};

/// Longest uninterrupted sleep while backing off; bounds cancel latency.
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("change feed error: {0}")]
    Source(#[from] SourceError),

    #[error("change feed disconnected with no checkpoint to resume from: {0}")]
    Unresumable(String),

    #[error("checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("dead-letter sink error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    /// Only when no dead-letter sink is configured.
    #[error(transparent)]
    Malformed(#[from] MalformedNotification),

    /// The broker may or may not have committed the event. Needs an operator.
    #[error("commit outcome unknown for event {event_id}: {reason}")]
    AmbiguousCommit { event_id: ResumeToken, reason: String },

    #[error("giving up after {attempts} consecutive failures, last: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Checkpoint key and log label.
    pub feed: String,
    pub retry: RetryPolicy,
}

impl DispatchConfig {
    pub fn new(feed: impl Into<String>) -> Self {
        Self {
            feed: feed.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Counters for one orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub committed: u64,
    pub aborted: u64,
    pub dead_lettered: u64,
    pub reconnects: u64,
    pub last_checkpoint: Option<ResumeToken>,
}

/// What one [`DispatchOrchestrator::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Committed(ResumeToken),
    /// Rolled back; the event will be published again on the next step, or
    /// on the next run if `cancel` fired.
    Aborted {
        event_id: ResumeToken,
        failure: PublishFailure,
    },
    DeadLettered(Option<ResumeToken>),
    /// The feed connection was lost or could not be opened; the next step
    /// reconnects from the checkpoint.
    Reconnecting,
    /// Feed exhausted, or canceled.
    Idle,
}

enum Next {
    Event(ChangeEvent),
    Done(Step),
}

/// Single-owner control loop over one change feed.
pub struct DispatchOrchestrator<S, F, C = JsonCodec>
where
    S: ChangeFeedSource,
{
    config: DispatchConfig,
    source: S,
    stream: Option<S::Stream>,
    publisher: TransactionalPublisher<F, C>,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    /// Event whose last publish was aborted.
    pending: Option<ChangeEvent>,
    consecutive_failures: u32,
    report: DispatchReport,
}

impl<S, F, C> DispatchOrchestrator<S, F, C>
where
    S: ChangeFeedSource,
    F: ProducerFactory,
    C: EventCodec,
{
    pub fn new(
        config: DispatchConfig,
        source: S,
        publisher: TransactionalPublisher<F, C>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            source,
            stream: None,
            publisher,
            checkpoints,
            dead_letters: None,
            pending: None,
            consecutive_failures: 0,
            report: DispatchReport::default(),
        }
    }

    /// Quarantine malformed notifications instead of halting on them.
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn report(&self) -> &DispatchReport {
        &self.report
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Process notifications until the feed ends or `cancel` fires.
    ///
    /// Returns `Err` only for conditions that must halt the relay.
    #[instrument(skip_all, fields(feed = %self.config.feed))]
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<DispatchReport, DispatchError> {
        info!("dispatch loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.step(cancel) {
                Ok(Step::Idle) => break,
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "dispatch loop halted");
                    return Err(err);
                }
            }
        }

        info!(
            committed = self.report.committed,
            aborted = self.report.aborted,
            dead_lettered = self.report.dead_lettered,
            "dispatch loop stopped"
        );
        Ok(self.report.clone())
    }

    /// Handle one notification, or one retry of the pending event.
    pub fn step(&mut self, cancel: &CancellationToken) -> Result<Step, DispatchError> {
        if cancel.is_cancelled() {
            return Ok(Step::Idle);
        }

        let event = match self.pending.take() {
            Some(event) => event,
            None => match self.read_next(cancel)? {
                Next::Event(event) => event,
                Next::Done(step) => return Ok(step),
            },
        };

        self.publish(event, cancel)
    }

    fn read_next(&mut self, cancel: &CancellationToken) -> Result<Next, DispatchError> {
        if self.stream.is_none() {
            let resume_from = self.checkpoints.load(&self.config.feed)?;
            match self.source.connect(resume_from.as_ref()) {
                Ok(stream) => {
                    info!(
                        feed = %self.config.feed,
                        resume_from = ?resume_from.as_ref().map(ResumeToken::as_str),
                        "change feed connected"
                    );
                    self.stream = Some(stream);
                }
                Err(SourceError::Connect(reason)) => {
                    warn!(feed = %self.config.feed, reason = %reason, "change feed connect failed");
                    self.back_off(reason, cancel)?;
                    return Ok(Next::Done(Step::Reconnecting));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(Next::Done(Step::Idle));
        };

        let raw = match stream.next(cancel) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(Next::Done(Step::Idle)),
            Err(SourceError::Disconnected(reason)) => {
                self.stream = None;
                if self.checkpoints.load(&self.config.feed)?.is_none() {
                    return Err(DispatchError::Unresumable(reason));
                }
                warn!(feed = %self.config.feed, reason = %reason, "change feed disconnected");
                self.report.reconnects += 1;
                self.back_off(reason, cancel)?;
                return Ok(Next::Done(Step::Reconnecting));
            }
            Err(err) => return Err(err.into()),
        };

        match normalize(&raw, Utc::now()) {
            Ok(event) => Ok(Next::Event(event)),
            Err(malformed) => self.quarantine(raw, malformed).map(Next::Done),
        }
    }

    fn quarantine(
        &mut self,
        raw: RawNotification,
        malformed: MalformedNotification,
    ) -> Result<Step, DispatchError> {
        let Some(sink) = self.dead_letters.as_ref() else {
            error!(
                feed = %self.config.feed,
                event_id = ?malformed.position().map(ResumeToken::as_str),
                outcome = "malformed",
                reason = %malformed,
                "malformed notification, no dead-letter sink configured"
            );
            return Err(malformed.into());
        };

        let position = malformed.position().cloned();
        sink.quarantine(DeadLetter::new(&self.config.feed, raw.into_json(), &malformed))?;
        self.report.dead_lettered += 1;

        warn!(
            feed = %self.config.feed,
            event_id = ?position.as_ref().map(ResumeToken::as_str),
            outcome = "dead-lettered",
            reason = %malformed,
            "malformed notification quarantined"
        );
        Ok(Step::DeadLettered(position))
    }

    fn publish(
        &mut self,
        event: ChangeEvent,
        cancel: &CancellationToken,
    ) -> Result<Step, DispatchError> {
        let event_id = event.id().clone();

        match self.publisher.publish(&event, cancel) {
            PublishOutcome::Committed { position } => {
                // Checkpoint first: acknowledging ahead of a durable checkpoint
                // could lose the event on crash.
                self.checkpoints.save(&self.config.feed, &position)?;
                if let Some(stream) = self.stream.as_mut() {
                    stream.acknowledge(&position)?;
                }

                self.consecutive_failures = 0;
                self.report.committed += 1;
                self.report.last_checkpoint = Some(position.clone());

                info!(
                    feed = %self.config.feed,
                    event_id = %position,
                    operation = %event.operation_type(),
                    outcome = "committed",
                    "event published"
                );
                Ok(Step::Committed(position))
            }
            PublishOutcome::Aborted { failure, rollback } => {
                self.report.aborted += 1;
                warn!(
                    feed = %self.config.feed,
                    event_id = %event_id,
                    outcome = "aborted",
                    reason = %failure,
                    rollback = ?rollback,
                    "publish aborted"
                );

                self.pending = Some(event);
                self.back_off(failure.to_string(), cancel)?;
                Ok(Step::Aborted { event_id, failure })
            }
            PublishOutcome::AbortFailed { reason, rollback } => {
                error!(
                    feed = %self.config.feed,
                    event_id = %event_id,
                    outcome = "abort-failed",
                    reason = %reason,
                    rollback = ?rollback,
                    "commit outcome unknown"
                );
                Err(DispatchError::AmbiguousCommit { event_id, reason })
            }
        }
    }

    /// A failure observed after `cancel` fired is the shutdown itself, not a
    /// fault, and is not counted.
    fn back_off(&mut self, reason: String, cancel: &CancellationToken) -> Result<(), DispatchError> {
        if cancel.is_cancelled() {
            debug!(feed = %self.config.feed, reason = %reason, "canceled, not backing off");
            return Ok(());
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let attempts = self.consecutive_failures;

        if !self.config.retry.tolerates(attempts) {
            return Err(DispatchError::RetriesExhausted {
                attempts,
                last_error: reason,
            });
        }

        let delay = self.config.retry.delay_after(attempts);
        debug!(feed = %self.config.feed, attempts, delay_ms = delay.as_millis() as u64, "backing off");
        sleep_unless_cancelled(delay, cancel);
        Ok(())
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) {
    let deadline = Instant::now()
        .checked_add(delay)
        .unwrap_or_else(|| Instant::now() + MAX_BACKOFF);
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(BACKOFF_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use serde_json::json;
    use tuyau_bus::{Fault, FaultPoint, InMemoryBroker, PublisherConfig};
    use tuyau_capture::{InMemoryChangeFeed, JsonLinesChangeFeed};
    use tuyau_core::ProducerIdentity;

    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::dead_letter::InMemoryDeadLetterSink;

    const FEED: &str = "orders";
    const TOPIC: &str = "tuyau-test";

    fn raw(id: &str) -> RawNotification {
        RawNotification::new(json!({
            "_id": {"_data": id},
            "operationType": "insert",
            "ns": {"db": "shop", "coll": "orders"},
            "documentKey": {"_id": id},
            "fullDocument": {"n": id},
        }))
    }

    fn token(s: &str) -> ResumeToken {
        ResumeToken::new(s).unwrap()
    }

    struct Harness {
        feed: InMemoryChangeFeed,
        broker: InMemoryBroker,
        checkpoints: InMemoryCheckpointStore,
    }

    impl Harness {
        fn new(notifications: Vec<RawNotification>) -> Self {
            Self {
                feed: InMemoryChangeFeed::new(notifications),
                broker: InMemoryBroker::new(),
                checkpoints: InMemoryCheckpointStore::new(),
            }
        }

        fn publisher(&self) -> TransactionalPublisher<InMemoryBroker> {
            TransactionalPublisher::new(
                self.broker.clone(),
                PublisherConfig::new(ProducerIdentity::new("relay-test").unwrap())
                    .with_destination(TOPIC),
            )
        }

        fn orchestrator(
            &self,
            max_failures: u32,
        ) -> DispatchOrchestrator<InMemoryChangeFeed, InMemoryBroker> {
            self.orchestrator_over(self.feed.clone(), max_failures)
        }

        fn orchestrator_over<S: ChangeFeedSource>(
            &self,
            source: S,
            max_failures: u32,
        ) -> DispatchOrchestrator<S, InMemoryBroker> {
            let config = DispatchConfig::new(FEED)
                .with_retry(RetryPolicy::fixed(max_failures, Duration::ZERO));

            DispatchOrchestrator::new(
                config,
                source,
                self.publisher(),
                Arc::new(self.checkpoints.clone()),
            )
        }

        fn published_ids(&self) -> Vec<String> {
            self.broker
                .committed_events(TOPIC)
                .unwrap()
                .iter()
                .map(|e| e.id().as_str().to_string())
                .collect()
        }
    }

    #[test]
    fn committed_event_checkpoints_then_acknowledges() {
        let h = Harness::new(vec![raw("1")]);
        let mut orchestrator = h.orchestrator(3);
        let cancel = CancellationToken::new();

        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Committed(token("1")));
        assert_eq!(h.checkpoints.load(FEED).unwrap(), Some(token("1")));
        assert_eq!(h.feed.acknowledged(), vec![token("1")]);
        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Idle);
    }

    #[test]
    fn aborted_event_is_republished_without_moving_the_checkpoint() {
        let h = Harness::new(vec![raw("1"), raw("2")]);
        h.broker.inject(FaultPoint::Produce, Fault::Error("network".into()));
        let mut orchestrator = h.orchestrator(3);
        let cancel = CancellationToken::new();

        assert!(matches!(
            orchestrator.step(&cancel).unwrap(),
            Step::Aborted { ref event_id, failure: PublishFailure::ProduceFailed(_) } if *event_id == token("1")
        ));
        assert_eq!(h.checkpoints.load(FEED).unwrap(), None);
        assert!(h.feed.acknowledged().is_empty());

        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Committed(token("1")));
        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Committed(token("2")));
        assert_eq!(h.published_ids(), vec!["1", "2"]);
        assert_eq!(h.feed.connect_count(), 1);
    }

    #[test]
    fn too_many_consecutive_aborts_halt() {
        let h = Harness::new(vec![raw("1")]);
        for _ in 0..3 {
            h.broker.inject(FaultPoint::Flush, Fault::Error("broker down".into()));
        }
        let mut orchestrator = h.orchestrator(2);

        let err = orchestrator.run(&CancellationToken::new()).unwrap_err();

        match err {
            DispatchError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("broker down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(orchestrator.report().aborted, 3);
        assert_eq!(h.checkpoints.load(FEED).unwrap(), None);
    }

    #[test]
    fn ambiguous_commit_is_fatal_and_leaves_checkpoint() {
        let h = Harness::new(vec![raw("0"), raw("1"), raw("2")]);
        h.checkpoints.save(FEED, &token("0")).unwrap();
        h.broker.inject(FaultPoint::Commit, Fault::Error("timeout".into()));
        let mut orchestrator = h.orchestrator(5);

        let err = orchestrator.run(&CancellationToken::new()).unwrap_err();

        assert!(matches!(err, DispatchError::AmbiguousCommit { ref event_id, .. } if *event_id == token("1")));
        assert_eq!(h.checkpoints.load(FEED).unwrap(), Some(token("0")));
        assert!(h.published_ids().is_empty());
    }

    #[test]
    fn malformed_without_sink_halts() {
        let h = Harness::new(vec![RawNotification::new(json!({"_id": "1"}))]);
        let mut orchestrator = h.orchestrator(3);

        let err = orchestrator.run(&CancellationToken::new()).unwrap_err();

        assert!(matches!(err, DispatchError::Malformed(_)));
        assert_eq!(h.broker.stats().sessions_opened, 0);
    }

    #[test]
    fn malformed_with_sink_is_quarantined_and_skipped() {
        let h = Harness::new(vec![
            raw("1"),
            RawNotification::new(json!({"_id": "2", "operationType": "insert"})),
            raw("3"),
        ]);
        let sink = InMemoryDeadLetterSink::new();
        let mut orchestrator = h.orchestrator(3).with_dead_letters(Arc::new(sink.clone()));

        let report = orchestrator.run(&CancellationToken::new()).unwrap();

        assert_eq!(report.committed, 2);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(h.published_ids(), vec!["1", "3"]);
        assert_eq!(h.checkpoints.history(FEED), vec![token("1"), token("3")]);

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].position, Some(token("2")));
        assert_eq!(letters[0].feed, FEED);
    }

    #[test]
    fn disconnect_without_checkpoint_is_fatal() {
        let h = Harness::new(vec![raw("1")]);
        h.feed.disconnect_next_read();
        let mut orchestrator = h.orchestrator(3);

        let err = orchestrator.run(&CancellationToken::new()).unwrap_err();
        assert!(matches!(err, DispatchError::Unresumable(_)));
    }

    #[test]
    fn disconnect_with_checkpoint_resumes_after_it() {
        let h = Harness::new(vec![raw("1"), raw("2"), raw("3")]);
        let mut orchestrator = h.orchestrator(3);
        let cancel = CancellationToken::new();

        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Committed(token("1")));
        h.feed.disconnect_next_read();
        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Reconnecting);

        let report = orchestrator.run(&cancel).unwrap();

        assert_eq!(report.reconnects, 1);
        assert_eq!(h.published_ids(), vec!["1", "2", "3"]);
        assert_eq!(h.feed.connect_count(), 2);
    }

    #[test]
    fn canceled_run_returns_report() {
        let h = Harness::new(vec![raw("1")]);
        let mut orchestrator = h.orchestrator(3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator.run(&cancel).unwrap();

        assert_eq!(report, DispatchReport::default());
        assert_eq!(h.broker.stats().sessions_opened, 0);
    }

    /// Fires `cancel` as soon as a notification has been handed out, i.e.
    /// a shutdown racing the publish of that notification.
    struct CancelAfterRead {
        feed: InMemoryChangeFeed,
        cancel: CancellationToken,
    }

    struct CancelAfterReadStream {
        inner: <InMemoryChangeFeed as ChangeFeedSource>::Stream,
        cancel: CancellationToken,
    }

    impl ChangeFeedSource for CancelAfterRead {
        type Stream = CancelAfterReadStream;

        fn connect(&self, resume_from: Option<&ResumeToken>) -> Result<Self::Stream, SourceError> {
            Ok(CancelAfterReadStream {
                inner: self.feed.connect(resume_from)?,
                cancel: self.cancel.clone(),
            })
        }
    }

    impl ChangeStream for CancelAfterReadStream {
        fn next(
            &mut self,
            cancel: &CancellationToken,
        ) -> Result<Option<RawNotification>, SourceError> {
            let next = self.inner.next(cancel)?;
            if next.is_some() {
                self.cancel.cancel();
            }
            Ok(next)
        }

        fn acknowledge(&mut self, position: &ResumeToken) -> Result<(), SourceError> {
            self.inner.acknowledge(position)
        }
    }

    #[test]
    fn shutdown_during_publish_ends_the_run_cleanly() {
        let h = Harness::new(vec![raw("1")]);
        let cancel = CancellationToken::new();
        let source = CancelAfterRead {
            feed: h.feed.clone(),
            cancel: cancel.clone(),
        };
        let mut orchestrator = h.orchestrator_over(source, 0);

        let report = orchestrator.run(&cancel).unwrap();

        assert_eq!(report.committed, 0);
        assert_eq!(report.aborted, 1);
        assert_eq!(h.checkpoints.load(FEED).unwrap(), None);
        assert!(h.published_ids().is_empty());
        let stats = h.broker.stats();
        assert_eq!(stats.sessions_opened, stats.sessions_closed);

        // The interrupted event is still held and goes out on the next run.
        let report = orchestrator.run(&CancellationToken::new()).unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(h.published_ids(), vec!["1"]);
    }

    #[test]
    fn connect_failure_is_retried_until_the_feed_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let h = Harness::new(Vec::new());
        let mut orchestrator = h.orchestrator_over(JsonLinesChangeFeed::new(&path), 3);
        let cancel = CancellationToken::new();

        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Reconnecting);
        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Reconnecting);

        fs::write(&path, format!("{}\n", raw("1").as_json())).unwrap();

        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Committed(token("1")));
        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Idle);
        assert_eq!(h.published_ids(), vec!["1"]);
        assert_eq!(h.checkpoints.load(FEED).unwrap(), Some(token("1")));
    }

    #[test]
    fn connect_failures_count_against_the_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let h = Harness::new(Vec::new());
        let mut orchestrator =
            h.orchestrator_over(JsonLinesChangeFeed::new(dir.path().join("missing.jsonl")), 1);
        let cancel = CancellationToken::new();

        assert_eq!(orchestrator.step(&cancel).unwrap(), Step::Reconnecting);
        assert!(matches!(
            orchestrator.step(&cancel),
            Err(DispatchError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[test]
    fn oversized_backoff_returns_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        sleep_unless_cancelled(Duration::MAX, &cancel);
    }
}
