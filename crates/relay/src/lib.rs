//! Relay process wiring: turns a [`RelayConfig`] into a ready-to-run
//! [`DispatchOrchestrator`] over a JSON-lines change feed.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::info;

use tuyau_bus::{ProducerFactory, PublisherConfig, TransactionalPublisher};
use tuyau_capture::JsonLinesChangeFeed;
use tuyau_infra::checkpoint::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore,
};
use tuyau_infra::dead_letter::{DeadLetterSink, JsonLinesDeadLetterSink};
use tuyau_infra::{CheckpointTarget, DispatchConfig, DispatchOrchestrator, RelayConfig};

pub type RelayOrchestrator<F> = DispatchOrchestrator<JsonLinesChangeFeed, F>;

/// Open the configured checkpoint store. Postgres stores block on `handle`.
pub async fn build_checkpoints(
    target: &CheckpointTarget,
    handle: Handle,
) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match target {
        CheckpointTarget::Memory => {
            tracing::warn!("checkpoints are kept in memory; a restart replays the feed");
            Arc::new(InMemoryCheckpointStore::new())
        }
        CheckpointTarget::File(path) => Arc::new(FileCheckpointStore::new(path)),
        CheckpointTarget::Postgres(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to checkpoint database")?;
            let store = PostgresCheckpointStore::new(pool, handle);
            store
                .ensure_schema()
                .await
                .context("failed to create checkpoint table")?;
            Arc::new(store)
        }
    };

    Ok(store)
}

/// Dead-letter sink, if one is configured.
pub fn build_dead_letters(
    config: &RelayConfig,
) -> anyhow::Result<Option<Arc<dyn DeadLetterSink>>> {
    if let Some(url) = config.dead_letter_redis_url.as_deref() {
        return redis_dead_letters(url).map(Some);
    }

    Ok(config
        .dead_letter_path
        .as_ref()
        .map(|path| Arc::new(JsonLinesDeadLetterSink::new(path)) as Arc<dyn DeadLetterSink>))
}

#[cfg(feature = "redis")]
fn redis_dead_letters(url: &str) -> anyhow::Result<Arc<dyn DeadLetterSink>> {
    let sink = tuyau_infra::dead_letter::RedisStreamsDeadLetterSink::new(url, None)
        .context("invalid dead-letter redis url")?;
    Ok(Arc::new(sink))
}

#[cfg(not(feature = "redis"))]
fn redis_dead_letters(_url: &str) -> anyhow::Result<Arc<dyn DeadLetterSink>> {
    anyhow::bail!(
        "TUYAU_DEAD_LETTER_REDIS_URL is set but the relay was built without the `redis` feature"
    )
}

/// Assemble the dispatch loop for `factory`.
pub fn build_orchestrator<F>(
    config: &RelayConfig,
    factory: F,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
) -> RelayOrchestrator<F>
where
    F: ProducerFactory,
{
    let feed = JsonLinesChangeFeed::new(&config.feed_path).following();
    let publisher = TransactionalPublisher::new(
        factory,
        PublisherConfig::new(config.producer_id.clone()).with_destination(&config.topic),
    );
    let dispatch = DispatchConfig::new(&config.feed_name).with_retry(config.retry.clone());

    info!(
        feed = %config.feed_name,
        path = %config.feed_path.display(),
        identity = %config.producer_id,
        topic = %config.topic,
        dead_letters = dead_letters.is_some(),
        "relay assembled"
    );

    let orchestrator = DispatchOrchestrator::new(dispatch, feed, publisher, checkpoints);
    match dead_letters {
        Some(sink) => orchestrator.with_dead_letters(sink),
        None => orchestrator,
    }
}

#[cfg(feature = "kafka")]
pub fn kafka_factory(config: &RelayConfig) -> tuyau_infra::kafka::KafkaProducerFactory {
    use tuyau_infra::kafka::{KafkaConfig, KafkaProducerFactory};

    KafkaProducerFactory::new(
        KafkaConfig::new(&config.brokers).with_transaction_timeout(config.transaction_timeout),
    )
}
