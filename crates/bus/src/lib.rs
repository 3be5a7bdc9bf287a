//! Message bus side of the relay: producer sessions, the wire codec and the
//! transactional publisher.

pub mod in_memory_broker;
pub mod publisher;
pub mod session;
pub mod wire;

pub use in_memory_broker::{BrokerStats, Fault, FaultPoint, InMemoryBroker, InMemorySession};
pub use publisher::{
    PublishFailure, PublishOutcome, PublisherConfig, RollbackStatus, TransactionalPublisher,
};
pub use session::{BusError, BusRecord, CommitError, ProducerFactory, ProducerSession};
pub use wire::{EventCodec, JsonCodec, WireError};
