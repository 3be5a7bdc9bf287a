//! In-memory transactional broker for tests/dev.
//!
//! Models the parts of a transactional log broker the publisher relies on:
//! - records become visible only on commit
//! - one live session per identity (opening a new one fences the old)
//! - counters for every session call, so tests can assert rollback and
//!   teardown behaviour
//! - scripted fault injection per call site

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use tuyau_core::{ChangeEvent, ProducerIdentity};

use crate::session::{BusError, BusRecord, CommitError, ProducerFactory, ProducerSession};
use crate::wire::{self, WireError};

/// Session call sites where a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Open,
    BeginTransaction,
    Produce,
    Flush,
    Commit,
    AbortBuffered,
    AbortTransaction,
}

/// What an injected fault does to the call it hits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transport error (an ambiguous outcome for commits).
    Error(String),
    /// Behave as if the caller's context was canceled mid-call.
    Canceled,
    /// Commit only: the broker reports "operation not attempted".
    NotAttempted,
}

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub transactions_begun: u64,
    pub records_produced: u64,
    pub flushes: u64,
    pub commits: u64,
    pub abort_buffered_calls: u64,
    pub abort_transaction_calls: u64,
    pub fenced_calls: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<BusRecord>>,
    epochs: HashMap<ProducerIdentity, u64>,
    faults: HashMap<FaultPoint, VecDeque<Fault>>,
    stats: BrokerStats,
}

impl BrokerState {
    fn take_fault(&mut self, point: FaultPoint) -> Option<Fault> {
        self.faults.get_mut(&point).and_then(VecDeque::pop_front)
    }
}

/// Shared in-memory broker. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next call at `point`. Faults at the same point are
    /// consumed in FIFO order.
    pub fn inject(&self, point: FaultPoint, fault: Fault) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.entry(point).or_default().push_back(fault);
        }
    }

    /// Drop every fault that has not fired yet.
    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.clear();
        }
    }

    /// Records visible to consumers on `topic`, in commit order.
    pub fn committed(&self, topic: &str) -> Vec<BusRecord> {
        self.state
            .lock()
            .map(|state| state.topics.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Committed records on `topic` decoded as change events.
    pub fn committed_events(&self, topic: &str) -> Result<Vec<ChangeEvent>, WireError> {
        self.committed(topic)
            .iter()
            .map(|record| wire::decode(&record.payload))
            .collect()
    }

    pub fn stats(&self) -> BrokerStats {
        self.state
            .lock()
            .map(|state| state.stats.clone())
            .unwrap_or_default()
    }
}

impl ProducerFactory for InMemoryBroker {
    type Session = InMemorySession;

    fn open(&self, identity: &ProducerIdentity) -> Result<Self::Session, BusError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::Init("lock poisoned".to_string()))?;

        if let Some(fault) = state.take_fault(FaultPoint::Open) {
            return Err(match fault {
                Fault::Canceled => BusError::Canceled,
                Fault::Error(msg) => BusError::Init(msg),
                Fault::NotAttempted => BusError::Init("not attempted".to_string()),
            });
        }

        let epoch = state.epochs.entry(identity.clone()).or_insert(0);
        *epoch += 1;
        let epoch = *epoch;
        state.stats.sessions_opened += 1;

        debug!(identity = %identity, epoch, "in-memory session opened");

        Ok(InMemorySession {
            state: self.state.clone(),
            identity: identity.clone(),
            epoch,
            in_transaction: false,
            buffered: Vec::new(),
            flushed: Vec::new(),
            closed: false,
        })
    }
}

/// Session on an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemorySession {
    state: Arc<Mutex<BrokerState>>,
    identity: ProducerIdentity,
    epoch: u64,
    in_transaction: bool,
    /// Enqueued, not yet acknowledged.
    buffered: Vec<(String, BusRecord)>,
    /// Acknowledged by the broker, invisible until commit.
    flushed: Vec<(String, BusRecord)>,
    closed: bool,
}

impl InMemorySession {
    /// Not closed, not fenced.
    fn check_live(&self, state: &mut BrokerState) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::State("session is closed".to_string()));
        }
        if state.epochs.get(&self.identity) != Some(&self.epoch) {
            state.stats.fenced_calls += 1;
            return Err(BusError::Fenced(self.identity.to_string()));
        }
        Ok(())
    }

    fn enter(&self, state: &mut BrokerState, point: FaultPoint) -> Result<(), BusError> {
        self.check_live(state)?;
        match state.take_fault(point) {
            None => Ok(()),
            Some(Fault::Canceled) => Err(BusError::Canceled),
            Some(Fault::Error(msg)) => Err(BusError::Transport(msg)),
            Some(Fault::NotAttempted) => Err(BusError::Transport("not attempted".to_string())),
        }
    }
}

fn lock(shared: &Mutex<BrokerState>) -> Result<std::sync::MutexGuard<'_, BrokerState>, BusError> {
    shared
        .lock()
        .map_err(|_| BusError::Transport("lock poisoned".to_string()))
}

impl ProducerSession for InMemorySession {
    fn begin_transaction(&mut self) -> Result<(), BusError> {
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared)?;
        self.enter(&mut state, FaultPoint::BeginTransaction)?;
        if self.in_transaction {
            return Err(BusError::State("transaction already open".to_string()));
        }
        state.stats.transactions_begun += 1;

        self.in_transaction = true;
        Ok(())
    }

    fn produce(
        &mut self,
        cancel: &CancellationToken,
        destination: &str,
        record: BusRecord,
    ) -> Result<(), BusError> {
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared)?;
        self.enter(&mut state, FaultPoint::Produce)?;
        if cancel.is_cancelled() {
            return Err(BusError::Canceled);
        }
        if !self.in_transaction {
            return Err(BusError::State("produce outside a transaction".to_string()));
        }
        state.stats.records_produced += 1;

        self.buffered.push((destination.to_string(), record));
        Ok(())
    }

    fn flush(&mut self, cancel: &CancellationToken) -> Result<(), BusError> {
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared)?;
        state.stats.flushes += 1;
        if cancel.is_cancelled() {
            return Err(BusError::Canceled);
        }
        self.enter(&mut state, FaultPoint::Flush)?;

        self.flushed.append(&mut self.buffered);
        Ok(())
    }

    fn commit_transaction(&mut self, cancel: &CancellationToken) -> Result<(), CommitError> {
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared).map_err(|e| CommitError::Ambiguous(e.to_string()))?;
        state.stats.commits += 1;

        self.check_live(&mut state)
            .map_err(|e| CommitError::Ambiguous(e.to_string()))?;
        match state.take_fault(FaultPoint::Commit) {
            None => {}
            Some(Fault::NotAttempted) => return Err(CommitError::NotAttempted),
            Some(Fault::Canceled) => {
                return Err(CommitError::Ambiguous(BusError::Canceled.to_string()));
            }
            Some(Fault::Error(msg)) => return Err(CommitError::Ambiguous(msg)),
        }
        if cancel.is_cancelled() {
            return Err(CommitError::Ambiguous("canceled during commit".to_string()));
        }
        if !self.in_transaction || self.flushed.is_empty() {
            return Err(CommitError::NotAttempted);
        }

        for (topic, record) in self.flushed.drain(..) {
            state.topics.entry(topic).or_default().push(record);
        }

        self.in_transaction = false;
        Ok(())
    }

    fn abort_transaction(&mut self, cancel: &CancellationToken) -> Result<(), BusError> {
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared)?;
        state.stats.abort_transaction_calls += 1;
        self.enter(&mut state, FaultPoint::AbortTransaction)?;
        if cancel.is_cancelled() {
            return Err(BusError::Canceled);
        }
        if !self.in_transaction {
            return Err(BusError::State("no open transaction".to_string()));
        }

        self.flushed.clear();
        self.in_transaction = false;
        Ok(())
    }

    fn abort_buffered(&mut self, cancel: &CancellationToken) -> Result<(), BusError> {
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared)?;
        state.stats.abort_buffered_calls += 1;
        self.enter(&mut state, FaultPoint::AbortBuffered)?;
        if cancel.is_cancelled() {
            return Err(BusError::Canceled);
        }

        self.buffered.clear();
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Anything not committed dies with the session.
        self.buffered.clear();
        self.flushed.clear();
        self.in_transaction = false;

        if let Ok(mut state) = self.state.lock() {
            state.stats.sessions_closed += 1;
        }
    }
}
