use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::LifecycleManager;

/// Spawn the background idle sweep. Runs every `interval` until `cancel`
/// fires; a failed sweep is logged and retried on the next tick.
pub fn spawn_sweeper(
    lifecycle: Arc<LifecycleManager>,
    interval: Duration,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a restart does not
        // sweep before any client has had a chance to reconnect.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match lifecycle.sweep_idle(idle_timeout).await {
                Ok(report) if report.stopped > 0 || report.failed > 0 => {
                    tracing::info!(stopped = report.stopped, failed = report.failed, "idle sweep finished");
                }
                Ok(_) => tracing::debug!("idle sweep found nothing to stop"),
                Err(e) => tracing::error!(error = %e, "idle sweep failed"),
            }
        }
        tracing::info!("idle sweeper stopped");
    })
}
