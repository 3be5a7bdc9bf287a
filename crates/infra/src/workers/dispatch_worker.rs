use std::thread;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tuyau_bus::{EventCodec, ProducerFactory};
use tuyau_capture::ChangeFeedSource;

use crate::dispatcher::{DispatchError, DispatchOrchestrator, DispatchReport};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("worker thread panicked")]
    Panicked,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Handle to control and join a background dispatch worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    cancel: CancellationToken,
    join: Option<thread::JoinHandle<Result<DispatchReport, DispatchError>>>,
}

impl WorkerHandle {
    /// Token that stops the worker when canceled. Share it with signal handlers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) -> Result<DispatchReport, WorkerError> {
        self.cancel.cancel();
        self.join()
    }

    /// Wait for the worker to stop on its own (feed exhausted, fatal error or
    /// external cancellation).
    pub fn join(mut self) -> Result<DispatchReport, WorkerError> {
        let Some(join) = self.join.take() else {
            return Err(WorkerError::Panicked);
        };

        match join.join() {
            Ok(result) => Ok(result?),
            Err(_) => {
                error!(worker = %self.name, "dispatch worker panicked");
                Err(WorkerError::Panicked)
            }
        }
    }
}

/// Runs a [`DispatchOrchestrator`] on its own thread.
///
/// The thread exclusively owns the feed cursor for its whole life; the caller
/// only keeps the cancel token and the join handle.
#[derive(Debug)]
pub struct DispatchWorker;

impl DispatchWorker {
    pub fn spawn<S, F, C>(
        name: impl Into<String>,
        mut orchestrator: DispatchOrchestrator<S, F, C>,
        cancel: CancellationToken,
    ) -> Result<WorkerHandle, WorkerError>
    where
        S: ChangeFeedSource + 'static,
        S::Stream: 'static,
        F: ProducerFactory + 'static,
        C: EventCodec + 'static,
    {
        let name = name.into();
        let token = cancel.clone();
        let thread_name = name.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!(worker = %thread_name, "dispatch worker started");
                let result = orchestrator.run(&token);
                info!(worker = %thread_name, ok = result.is_ok(), "dispatch worker stopped");
                result
            })
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        Ok(WorkerHandle {
            name,
            cancel,
            join: Some(join),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::json;
    use tuyau_bus::{InMemoryBroker, PublisherConfig, TransactionalPublisher};
    use tuyau_capture::{InMemoryChangeFeed, RawNotification};
    use tuyau_core::ProducerIdentity;

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::dispatcher::DispatchConfig;

    fn raw(id: &str) -> RawNotification {
        RawNotification::new(json!({
            "_id": id,
            "operationType": "update",
            "ns": {"db": "shop", "coll": "carts"},
            "documentKey": {"_id": id},
        }))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn worker_follows_the_feed_until_shutdown() {
        let feed = InMemoryChangeFeed::new([raw("1")]).following();
        let broker = InMemoryBroker::new();
        let publisher = TransactionalPublisher::new(
            broker.clone(),
            PublisherConfig::new(ProducerIdentity::new("worker-test").unwrap()),
        );
        let orchestrator = DispatchOrchestrator::new(
            DispatchConfig::new("carts"),
            feed.clone(),
            publisher,
            Arc::new(InMemoryCheckpointStore::new()),
        );

        let handle =
            DispatchWorker::spawn("dispatch-carts", orchestrator, CancellationToken::new()).unwrap();

        feed.push(raw("2"));
        wait_until(|| feed.acknowledged().len() == 2);
        assert!(!handle.is_finished());

        let report = handle.shutdown().unwrap();
        assert_eq!(report.committed, 2);

        let stats = broker.stats();
        assert_eq!(stats.sessions_opened, stats.sessions_closed);
    }
}
