//! Infrastructure layer: checkpoint stores, dead-letter sinks, the dispatch
//! loop and its worker, bus adapters, config.

pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod retry;
pub mod workers;


pub use checkpoint::{CheckpointError, CheckpointStore};
pub use config::{CheckpointTarget, ConfigError, RelayConfig};
pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
pub use dispatcher::{DispatchConfig, DispatchError, DispatchOrchestrator, DispatchReport, Step};
pub use retry::{BackoffStrategy, RetryPolicy};
