use super::{ReconcileReport, common_start};
use crate::crypto::PublicKey;
use crate::discovery::ServerId;
use crate::error::Result;
use crate::frame::SignedCheckpoint;
use crate::node::context::{NodeContext, Route};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Refreshes cached copies on a non-master node from the current master.
pub struct FetchOperation {
    ctx: Arc<NodeContext>,
    running: Mutex<()>,
}

impl FetchOperation {
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
            let masters = match report.record(route, "Fetch announcement lookup") {
                Some(Route::Remote(masters)) => masters,
                _ => continue,
            };
            report.owners += 1;

            let files = self.ctx.local_list(&owner, "*").await;
            let Some(files) = report.record(files, "Fetch listing") else {
                continue;
            };
            for local in files.into_iter().filter(|c| !c.is_tombstone()) {
                report.files += 1;
                let what = format!("Fetch of {}/{}", owner, local.filename());
                let fetched = self.fetch_file(owner, &masters, local).await;
                if let Some(true) = report.record(fetched, &what) {
                    report.transferred += 1;
                }
            }
        }

        tracing::info!(
            "Fetch on {}: {} owners, {} files, {} transferred, {} failures",
            self.ctx.server_id(),
            report.owners,
            report.files,
            report.transferred,
            report.failures
        );
        Ok(report)
    }

    async fn fetch_file(
        &self,
        owner: PublicKey,
        masters: &[ServerId],
        local: SignedCheckpoint,
    ) -> Result<bool> {
        let filename = local.filename().to_string();
        let master = self.ctx.live_master(masters, &owner, &filename).await?;

        let remote_end = match &master.latest {
            Some(remote) if remote.is_tombstone() => {
                self.ctx.apply_tombstone(&owner, remote).await?;
                return Ok(true);
            }
            Some(remote) if remote.position() > local.position() => remote.position(),
            _ => return Ok(false),
        };

        let local_index = self.ctx.local_index(&owner, &filename).await?;
        let remote_index = master.node.list_index(owner, &filename).await?;
        let start = common_start(&local_index, &remote_index, local.position());

        let frames = master.node.download(owner, &filename, start, None).await?;
        let position = self.ctx.ingest(owner, &filename, start, frames).await?;
        tracing::info!(
            "Fetched {}/{} from {} up to {} (master at {})",
            owner,
            filename,
            master.server_id,
            position,
            remote_end
        );
        Ok(true)
    }
}
