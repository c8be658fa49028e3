use crate::config::ReplicationConfig;
use globe_core::{GlobeNode, ReconcileReport, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Start the push, catch-up and fetch loops. Each runs on its own interval; a failed
/// run is logged and retried on the next tick.
pub fn spawn_reconcilers(node: Arc<GlobeNode>, config: &ReplicationConfig) {
    spawn_loop("push", config.push_interval_secs, node.clone(), |node| async move {
        node.push().await
    });
    spawn_loop(
        "catch-up",
        config.catch_up_interval_secs,
        node.clone(),
        |node| async move { node.catch_up().await },
    );
    spawn_loop("fetch", config.fetch_interval_secs, node, |node| async move {
        node.fetch().await
    });
}

fn spawn_loop<F, Fut>(name: &'static str, every_secs: u64, node: Arc<GlobeNode>, run: F)
where
    F: Fn(Arc<GlobeNode>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<ReconcileReport>> + Send + 'static,
{
    if every_secs == 0 {
        tracing::info!("Periodic {} disabled", name);
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(every_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match run(node.clone()).await {
                Ok(report) if report.transferred > 0 || report.failures > 0 => {
                    tracing::info!(
                        "{} finished: {} owners, {} files, {} transferred, {} failures",
                        name,
                        report.owners,
                        report.files,
                        report.transferred,
                        report.failures
                    );
                }
                Ok(report) => {
                    tracing::debug!("{} finished: {} files up to date", name, report.files);
                }
                Err(e) => {
                    tracing::warn!("{} failed: {}", name, e);
                }
            }
        }
    });
}
