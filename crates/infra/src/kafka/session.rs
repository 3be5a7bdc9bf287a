use std::sync::Mutex;
use std::time::{Duration, Instant};

use rdkafka::client::ClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::DeliveryResult;
use rdkafka::producer::{BaseRecord, Producer, ProducerContext, PurgeConfig, ThreadedProducer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tuyau_bus::{BusError, BusRecord, CommitError, ProducerFactory, ProducerSession};
use tuyau_core::ProducerIdentity;

use super::KafkaConfig;

/// Flush is polled in slices this long so cancellation is noticed.
const FLUSH_SLICE: Duration = Duration::from_millis(100);

/// Collects delivery failures reported by the producer's polling thread.
#[derive(Debug, Default)]
struct DeliveryTracker {
    failures: Mutex<Vec<String>>,
}

impl DeliveryTracker {
    fn take_failure(&self) -> Option<String> {
        self.failures.lock().ok().and_then(|mut f| {
            if f.is_empty() {
                None
            } else {
                Some(f.drain(..).collect::<Vec<_>>().join("; "))
            }
        })
    }

    fn clear(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        if let Err((err, _)) = result {
            warn!(error = %err, "kafka delivery failed");
            if let Ok(mut failures) = self.failures.lock() {
                failures.push(err.to_string());
            }
        }
    }
}

/// Opens one transactional producer per session.
#[derive(Debug, Clone)]
pub struct KafkaProducerFactory {
    config: KafkaConfig,
}

impl KafkaProducerFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

impl ProducerFactory for KafkaProducerFactory {
    type Session = KafkaSession;

    fn open(&self, identity: &ProducerIdentity) -> Result<Self::Session, BusError> {
        let producer: ThreadedProducer<DeliveryTracker> = self
            .config
            .to_client_config(identity)
            .create_with_context(DeliveryTracker::default())
            .map_err(|e| BusError::Init(e.to_string()))?;

        // Fences zombies holding the same transactional id.
        producer
            .init_transactions(self.config.operation_timeout)
            .map_err(|e| match e {
                KafkaError::Transaction(ref rd) if rd.code() == RDKafkaErrorCode::Fenced => {
                    BusError::Fenced(e.to_string())
                }
                other => BusError::Init(other.to_string()),
            })?;

        debug!(identity = %identity, "kafka transactional producer initialized");

        Ok(KafkaSession {
            producer: Some(producer),
            operation_timeout: self.config.operation_timeout,
            delivery_timeout: self.config.delivery_timeout,
        })
    }
}

/// A single-use transactional Kafka producer.
pub struct KafkaSession {
    producer: Option<ThreadedProducer<DeliveryTracker>>,
    operation_timeout: Duration,
    delivery_timeout: Duration,
}

impl std::fmt::Debug for KafkaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSession")
            .field("open", &self.producer.is_some())
            .finish()
    }
}

impl KafkaSession {
    fn producer(&self) -> Result<&ThreadedProducer<DeliveryTracker>, BusError> {
        self.producer
            .as_ref()
            .ok_or_else(|| BusError::State("session is closed".to_string()))
    }
}

fn map_kafka_error(err: KafkaError) -> BusError {
    match &err {
        KafkaError::Transaction(rd) if rd.code() == RDKafkaErrorCode::Fenced => {
            BusError::Fenced(err.to_string())
        }
        _ => BusError::Transport(err.to_string()),
    }
}

fn before(deadline: Option<Instant>) -> bool {
    deadline.is_none_or(|d| Instant::now() < d)
}

impl ProducerSession for KafkaSession {
    fn begin_transaction(&mut self) -> Result<(), BusError> {
        self.producer()?.begin_transaction().map_err(map_kafka_error)
    }

    fn produce(
        &mut self,
        cancel: &CancellationToken,
        destination: &str,
        record: BusRecord,
    ) -> Result<(), BusError> {
        if cancel.is_cancelled() {
            return Err(BusError::Canceled);
        }
        let producer = self.producer()?;
        producer.context().clear();

        let mut base: BaseRecord<'_, Vec<u8>, Vec<u8>> =
            BaseRecord::to(destination).payload(&record.payload);
        if let Some(key) = record.key.as_ref() {
            base = base.key(key);
        }

        producer.send(base).map_err(|(err, _)| map_kafka_error(err))
    }

    fn flush(&mut self, cancel: &CancellationToken) -> Result<(), BusError> {
        let producer = self.producer()?;
        // `None` when the timeout is too large to represent; wait without limit.
        let deadline = Instant::now().checked_add(self.delivery_timeout);

        loop {
            if cancel.is_cancelled() {
                return Err(BusError::Canceled);
            }
            match producer.flush(FLUSH_SLICE) {
                Ok(()) => break,
                Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut))
                    if before(deadline) => {}
                Err(err) => return Err(map_kafka_error(err)),
            }
        }

        match producer.context().take_failure() {
            Some(reason) => Err(BusError::Transport(reason)),
            None => Ok(()),
        }
    }

    fn commit_transaction(&mut self, cancel: &CancellationToken) -> Result<(), CommitError> {
        if cancel.is_cancelled() {
            return Err(CommitError::NotAttempted);
        }
        let producer = self
            .producer()
            .map_err(|e| CommitError::Ambiguous(e.to_string()))?;

        producer
            .commit_transaction(self.operation_timeout)
            .map_err(|err| match &err {
                KafkaError::Transaction(rd)
                    if rd.code() == RDKafkaErrorCode::OperationNotAttempted =>
                {
                    CommitError::NotAttempted
                }
                _ => CommitError::Ambiguous(err.to_string()),
            })
    }

    fn abort_transaction(&mut self, cancel: &CancellationToken) -> Result<(), BusError> {
        if cancel.is_cancelled() {
            return Err(BusError::Canceled);
        }
        self.producer()?
            .abort_transaction(self.operation_timeout)
            .map_err(map_kafka_error)
    }

    fn abort_buffered(&mut self, cancel: &CancellationToken) -> Result<(), BusError> {
        if cancel.is_cancelled() {
            return Err(BusError::Canceled);
        }
        self.producer()?
            .purge(PurgeConfig::default().queue().inflight());
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the producer stops its polling thread; an open transaction
        // is aborted by the broker after `transaction.timeout.ms`.
        if self.producer.take().is_some() {
            debug!("kafka producer closed");
        }
    }
}
