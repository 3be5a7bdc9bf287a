//! Transactional producer abstraction (mechanics only).
//!
//! A [`ProducerSession`] is one connection to the bus bound to a transactional
//! identity. Sessions are single-shot: the publisher opens one per event,
//! drives it through begin/produce/flush/commit-or-abort and closes it. Opening
//! a new session with the same identity fences any older one still alive.
//!
//! ## Visibility
//!
//! Records produced inside a transaction are durably buffered by the broker
//! after a successful `flush`, but consumers only see them once
//! `commit_transaction` succeeds. An aborted transaction never becomes
//! visible.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use tuyau_core::ProducerIdentity;

/// One record on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    /// Partitioning key; records with the same key keep their relative order.
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("producer init failed: {0}")]
    Init(String),

    #[error("bus transport error: {0}")]
    Transport(String),

    /// A newer session with the same identity exists.
    #[error("producer fenced: {0}")]
    Fenced(String),

    #[error("operation canceled")]
    Canceled,

    #[error("invalid session state: {0}")]
    State(String),
}

/// Failure of `commit_transaction`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// The broker did not attempt the commit because nothing was produced.
    /// Retriable: the transaction can be rolled back cleanly.
    #[error("commit not attempted")]
    NotAttempted,

    /// Anything else. The broker may or may not have committed.
    #[error("commit outcome unknown: {0}")]
    Ambiguous(String),
}

/// A single-use transactional session on the bus.
///
/// Every blocking call takes the caller's cancellation token. A canceled call
/// must fail (`BusError::Canceled`), never report success.
pub trait ProducerSession: Send {
    fn begin_transaction(&mut self) -> Result<(), BusError>;

    /// Enqueue a record for `destination` inside the open transaction.
    fn produce(
        &mut self,
        cancel: &CancellationToken,
        destination: &str,
        record: BusRecord,
    ) -> Result<(), BusError>;

    /// Wait until the broker has acknowledged every enqueued record.
    fn flush(&mut self, cancel: &CancellationToken) -> Result<(), BusError>;

    fn commit_transaction(&mut self, cancel: &CancellationToken) -> Result<(), CommitError>;

    fn abort_transaction(&mut self, cancel: &CancellationToken) -> Result<(), BusError>;

    /// Drop records that were enqueued but not yet flushed.
    fn abort_buffered(&mut self, cancel: &CancellationToken) -> Result<(), BusError>;

    /// Release the session. Idempotent.
    fn close(&mut self);
}

/// Opens producer sessions.
pub trait ProducerFactory: Send + Sync {
    type Session: ProducerSession;

    fn open(&self, identity: &ProducerIdentity) -> Result<Self::Session, BusError>;
}

impl<F> ProducerFactory for Arc<F>
where
    F: ProducerFactory + ?Sized,
{
    type Session = F::Session;

    fn open(&self, identity: &ProducerIdentity) -> Result<Self::Session, BusError> {
        (**self).open(identity)
    }
}
