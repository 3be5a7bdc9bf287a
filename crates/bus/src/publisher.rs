//! Transactional publish of one change event.
//!
//! [`TransactionalPublisher::publish`] delivers exactly one event inside an
//! atomic, abortable unit of work and always leaves the bus session closed:
//!
//! ```text
//! Idle → SessionOpen → TxBegun → Produced → { Committed | Aborted | AbortFailed }
//! ```
//!
//! 1. **Open** a fresh session bound to the configured identity.
//! 2. **Begin** a transaction.
//! 3. **Encode** the event.
//! 4. **Produce + flush** to the destination and wait for the broker's ack.
//! 5. **Commit**, or roll back: "not attempted" is a clean abort, any other
//!    commit failure leaves broker state unknown and is reported as
//!    `AbortFailed`.
//!
//! Rollback discards unflushed records, then aborts the transaction. A failing
//! rollback step is reported in the outcome and never retried; the session is
//! discarded either way. Nothing is retried inside the publisher: a failed
//! attempt is handed back to the caller, which decides when to try again.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tuyau_core::{ChangeEvent, ProducerIdentity, ResumeToken};

use crate::session::{BusError, CommitError, ProducerFactory, ProducerSession};
use crate::wire::{EventCodec, JsonCodec};

/// Default destination topic.
pub const DEFAULT_DESTINATION: &str = "tuyau-broadcast";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Transactional identity. Stable for the lifetime of the relay instance.
    pub identity: ProducerIdentity,
    /// Fixed destination topic/stream.
    pub destination: String,
}

impl PublisherConfig {
    pub fn new(identity: ProducerIdentity) -> Self {
        Self {
            identity,
            destination: DEFAULT_DESTINATION.to_string(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }
}

/// Progress of one publish attempt once its session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    SessionOpen,
    TxBegun,
    Produced,
    Committed,
    Aborted,
    AbortFailed,
}

/// Why an attempt was rolled back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishFailure {
    #[error("producer init failed: {0}")]
    ProducerInitFailed(String),

    #[error("transaction begin failed: {0}")]
    TransactionBeginFailed(String),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("produce failed: {0}")]
    ProduceFailed(String),

    #[error("flush canceled")]
    FlushCanceled,

    #[error("commit not attempted")]
    CommitNotAttempted,
}

/// What the rollback managed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStatus {
    /// No session was opened, nothing to roll back.
    NotNeeded,
    RolledBack,
    /// Discarding unflushed records failed; the transaction abort was skipped.
    BufferedAbortFailed(String),
    TransactionAbortFailed(String),
}

/// Terminal result of [`TransactionalPublisher::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The event is visible on the bus; `position` is safe to checkpoint.
    Committed { position: ResumeToken },

    /// Nothing became visible. The event may be retried.
    Aborted {
        failure: PublishFailure,
        rollback: RollbackStatus,
    },

    /// The commit failed in a way that leaves broker state unknown. Must not
    /// be retried blindly.
    AbortFailed {
        reason: String,
        rollback: RollbackStatus,
    },
}

impl PublishOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Committed { .. } => "committed",
            PublishOutcome::Aborted { .. } => "aborted",
            PublishOutcome::AbortFailed { .. } => "abort-failed",
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, PublishOutcome::Committed { .. })
    }
}

/// Session plus state for one attempt. Closes the session when dropped, so
/// every exit path tears it down exactly once.
struct PublishAttempt<S: ProducerSession> {
    session: S,
    state: AttemptState,
    closed: bool,
}

impl<S: ProducerSession> PublishAttempt<S> {
    fn new(session: S) -> Self {
        Self {
            session,
            state: AttemptState::SessionOpen,
            closed: false,
        }
    }

    fn advance(&mut self, next: AttemptState) {
        debug!(from = ?self.state, to = ?next, "publish attempt state");
        self.state = next;
    }

    fn teardown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.session.close();
        }
    }
}

impl<S: ProducerSession> Drop for PublishAttempt<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Publishes events one transaction at a time.
///
/// Owns no session between calls: every `publish` opens, drives and closes its
/// own. The identity is injected through [`PublisherConfig`].
#[derive(Debug)]
pub struct TransactionalPublisher<F, C = JsonCodec> {
    factory: F,
    codec: C,
    config: PublisherConfig,
}

impl<F> TransactionalPublisher<F, JsonCodec> {
    pub fn new(factory: F, config: PublisherConfig) -> Self {
        Self {
            factory,
            codec: JsonCodec,
            config,
        }
    }
}

impl<F, C> TransactionalPublisher<F, C> {
    pub fn with_codec<C2>(self, codec: C2) -> TransactionalPublisher<F, C2> {
        TransactionalPublisher {
            factory: self.factory,
            codec,
            config: self.config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

impl<F, C> TransactionalPublisher<F, C>
where
    F: ProducerFactory,
    C: EventCodec,
{
    /// Publish one event. Never panics on bus failures and never leaves a
    /// session open; every failure is folded into the returned outcome.
    pub fn publish(&self, event: &ChangeEvent, cancel: &CancellationToken) -> PublishOutcome {
        let session = match self.factory.open(&self.config.identity) {
            Ok(session) => session,
            Err(err) => {
                return PublishOutcome::Aborted {
                    failure: PublishFailure::ProducerInitFailed(err.to_string()),
                    rollback: RollbackStatus::NotNeeded,
                };
            }
        };

        let mut attempt = PublishAttempt::new(session);
        let outcome = self.drive(&mut attempt, event, cancel);
        attempt.teardown();
        outcome
    }

    fn drive(
        &self,
        attempt: &mut PublishAttempt<F::Session>,
        event: &ChangeEvent,
        cancel: &CancellationToken,
    ) -> PublishOutcome {
        if let Err(err) = attempt.session.begin_transaction() {
            return abort(
                attempt,
                PublishFailure::TransactionBeginFailed(err.to_string()),
                cancel,
            );
        }
        attempt.advance(AttemptState::TxBegun);

        let record = match self.codec.encode(event) {
            Ok(record) => record,
            Err(err) => {
                return abort(
                    attempt,
                    PublishFailure::SerializationFailed(err.to_string()),
                    cancel,
                );
            }
        };

        if let Err(err) = attempt
            .session
            .produce(cancel, &self.config.destination, record)
        {
            return abort(attempt, produce_failure(err), cancel);
        }

        if let Err(err) = attempt.session.flush(cancel) {
            return abort(attempt, produce_failure(err), cancel);
        }
        attempt.advance(AttemptState::Produced);

        match attempt.session.commit_transaction(cancel) {
            Ok(()) => {
                attempt.advance(AttemptState::Committed);
                PublishOutcome::Committed {
                    position: event.id().clone(),
                }
            }
            Err(CommitError::NotAttempted) => {
                abort(attempt, PublishFailure::CommitNotAttempted, cancel)
            }
            Err(CommitError::Ambiguous(reason)) => {
                let rollback = rollback(&mut attempt.session, cancel);
                attempt.advance(AttemptState::AbortFailed);
                PublishOutcome::AbortFailed { reason, rollback }
            }
        }
    }
}

fn produce_failure(err: BusError) -> PublishFailure {
    match err {
        BusError::Canceled => PublishFailure::FlushCanceled,
        other => PublishFailure::ProduceFailed(other.to_string()),
    }
}

fn abort<S: ProducerSession>(
    attempt: &mut PublishAttempt<S>,
    failure: PublishFailure,
    cancel: &CancellationToken,
) -> PublishOutcome {
    let rollback = rollback(&mut attempt.session, cancel);
    attempt.advance(AttemptState::Aborted);
    PublishOutcome::Aborted { failure, rollback }
}

fn rollback<S: ProducerSession>(session: &mut S, cancel: &CancellationToken) -> RollbackStatus {
    // Only fails when the context is already canceled; the transaction then
    // expires broker-side once the session is gone.
    if let Err(err) = session.abort_buffered(cancel) {
        warn!(error = %err, "discarding buffered records failed");
        return RollbackStatus::BufferedAbortFailed(err.to_string());
    }

    if let Err(err) = session.abort_transaction(cancel) {
        warn!(error = %err, "transaction abort failed");
        return RollbackStatus::TransactionAbortFailed(err.to_string());
    }

    debug!("transaction rolled back");
    RollbackStatus::RolledBack
}
