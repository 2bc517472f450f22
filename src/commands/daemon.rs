use std::sync::Arc;

use anyhow::{Context, Result};
use common::config::DaemonConfig;
use lifecycle::LifecycleService;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// Alternate evaluation and execution cycles on their intervals until a
/// shutdown signal arrives. A running cycle finishes before shutdown.
pub async fn run(service: Arc<LifecycleService>, config: &DaemonConfig) -> Result<()> {
    info!(
        evaluation_interval = ?config.evaluation_interval,
        execution_interval = ?config.execution_interval,
        "Lifecycle daemon running, waiting for shutdown signal"
    );

    let mut evaluation = interval(config.evaluation_interval);
    evaluation.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut execution = interval(config.execution_interval);
    execution.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = evaluation.tick() => {
                if let Err(e) = service.evaluate().await {
                    error!(error = %e, "Evaluation cycle failed");
                }
            }
            _ = execution.tick() => {
                if let Err(e) = service.execute(None).await {
                    error!(error = %e, "Execution cycle failed");
                }
            }
        }
    }

    let metrics = service.metrics();
    info!(
        evaluation_cycles = metrics.evaluation_cycles(),
        execution_cycles = metrics.execution_cycles(),
        succeeded = metrics.operations_succeeded(),
        failed = metrics.operations_failed(),
        bytes_reclaimed = metrics.bytes_reclaimed(),
        "Lifecycle daemon stopped"
    );
    Ok(())
}
