use super::{ReconcileReport, common_start};
use crate::crypto::PublicKey;
use crate::discovery::ServerId;
use crate::error::Result;
use crate::frame::SignedCheckpoint;
use crate::node::context::{NodeContext, Route};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Hands files of owners this node no longer masters over to their current master.
pub struct PushOperation {
    ctx: Arc<NodeContext>,
    running: Mutex<()>,
}

impl PushOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            running: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let _running = self.running.lock().await;
        let mut report = ReconcileReport::default();

        let owners = self.ctx.ledger(|l| l.list_owners()).await?;
        for owner in owners {
            let route = self.ctx.route(&owner, true).await;
            let masters = match report.record(route, "Push announcement lookup") {
                Some(Route::Remote(masters)) => masters,
                _ => continue,
            };
            report.owners += 1;

            let files = self.ctx.local_list(&owner, "*").await;
            let Some(files) = report.record(files, "Push listing") else {
                continue;
            };
            for local in files {
                report.files += 1;
                let filename = local.filename().to_string();
                let pushed = self.push_file(owner, &masters, local).await;
                if let Some(true) = report.record(pushed, &format!("Push of {}/{}", owner, filename)) {
                    report.transferred += 1;
                }
            }
        }

        tracing::info!(
            "Push on {}: {} owners, {} files, {} transferred, {} failures",
            self.ctx.server_id(),
            report.owners,
            report.files,
            report.transferred,
            report.failures
        );
        Ok(report)
    }

    async fn push_file(
        &self,
        owner: PublicKey,
        masters: &[ServerId],
        local: SignedCheckpoint,
    ) -> Result<bool> {
        let filename = local.filename().to_string();
        let master = self.ctx.live_master(masters, &owner, &filename).await?;

        if local.is_tombstone() {
            if master.latest.as_ref().is_some_and(|c| c.is_tombstone()) {
                return Ok(false);
            }
            master.node.delete(owner, local).await?;
            return Ok(true);
        }

        let remote_end = match &master.latest {
            Some(remote) if remote.is_tombstone() => {
                self.ctx.apply_tombstone(&owner, remote).await?;
                return Ok(false);
            }
            Some(remote) => Some(remote.position()),
            None => None,
        };

        let mut transferred = false;
        if remote_end.is_none_or(|end| end < local.position()) {
            let start = match remote_end {
                None => 0,
                Some(end) => {
                    let local_index = self.ctx.local_index(&owner, &filename).await?;
                    let remote_index = master.node.list_index(owner, &filename).await?;
                    common_start(&local_index, &remote_index, end)
                }
            };

            let frames = self.ctx.local_download(owner, &filename, start, None).await?;
            let position = master.node.upload(owner, &filename, start, frames).await?;
            tracing::info!(
                "Pushed {}/{} from {} to {} on {}",
                owner,
                filename,
                start,
                position,
                master.server_id
            );
            transferred = true;
        }

        if self.ctx.config().evict_after_push {
            self.ctx.evict(&owner, &filename).await?;
        }
        Ok(transferred)
    }
}
