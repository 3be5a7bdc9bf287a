use anyhow::Context;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use tuyau_infra::workers::DispatchWorker;
use tuyau_infra::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tuyau_observability::init();

    let config = RelayConfig::from_env().context("invalid relay configuration")?;

    let checkpoints = tuyau_relay::build_checkpoints(&config.checkpoint, Handle::current()).await?;
    let dead_letters = tuyau_relay::build_dead_letters(&config)?;
    let factory = tuyau_relay::kafka_factory(&config);
    let orchestrator =
        tuyau_relay::build_orchestrator(&config, factory, checkpoints, dead_letters);

    let cancel = CancellationToken::new();
    let worker = DispatchWorker::spawn(
        format!("dispatch-{}", config.feed_name),
        orchestrator,
        cancel.clone(),
    )?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            cancel.cancel();
        }
    });

    let report = tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("dispatch worker task failed")??;

    tracing::info!(
        committed = report.committed,
        aborted = report.aborted,
        dead_lettered = report.dead_lettered,
        last_checkpoint = ?report.last_checkpoint.as_ref().map(|p| p.as_str()),
        "relay stopped"
    );
    Ok(())
}
