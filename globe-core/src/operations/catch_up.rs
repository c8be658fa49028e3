use super::{ReconcileReport, common_start};
use crate::crypto::PublicKey;
use crate::error::Result;
use crate::frame::{SignedCheckpoint, validate_filename};
use crate::node::FsNode;
use crate::node::context::NodeContext;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Pulls whatever the other replicas of an owner hold that this master lacks.
pub struct CatchUpOperation {
    ctx: Arc<NodeContext>,
    running: Mutex<()>,
}

impl CatchUpOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            running: Mutex::new(()),
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let _running = self.running.lock().await;
        let mut report = ReconcileReport::default();

        let mut owners: BTreeSet<PublicKey> =
            self.ctx.ledger(|l| l.list_owners()).await?.into_iter().collect();
        owners.extend(self.ctx.watched_owners().await);

        for owner in owners {
            let announcement = self.ctx.announcement(&owner, true).await;
            let Some(Some(announcement)) = report.record(announcement, "Catch-up announcement lookup")
            else {
                continue;
            };
            if !announcement.contains(self.ctx.server_id()) {
                continue;
            }
            report.owners += 1;

            for peer_id in &announcement.servers {
                if peer_id == self.ctx.server_id() {
                    continue;
                }
                let listed = match self.ctx.resolve(peer_id) {
                    Ok(peer) => peer.list(owner, "*").await.map(|files| (peer, files)),
                    Err(error) => Err(error),
                };
                let Some((peer, files)) = report.record(listed, &format!("Catch-up listing on {}", peer_id))
                else {
                    continue;
                };

                for remote in files {
                    report.files += 1;
                    let what = format!("Catch-up of {}/{} from {}", owner, remote.filename(), peer_id);
                    let pulled = self.catch_up_file(owner, peer.as_ref(), remote).await;
                    if let Some(true) = report.record(pulled, &what) {
                        report.transferred += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Catch-up on {}: {} owners, {} files, {} transferred, {} failures",
            self.ctx.server_id(),
            report.owners,
            report.files,
            report.transferred,
            report.failures
        );
        Ok(report)
    }

    async fn catch_up_file(&self, owner: PublicKey, peer: &dyn FsNode, remote: SignedCheckpoint) -> Result<bool> {
        remote.verify(&owner)?;
        let filename = remote.filename().to_string();
        validate_filename(&filename)?;

        let local = self.ctx.local_latest(&owner, &filename).await?;
        if local.as_ref().is_some_and(|c| c.is_tombstone()) {
            return Ok(false);
        }
        if remote.is_tombstone() {
            self.ctx.apply_tombstone(&owner, &remote).await?;
            return Ok(true);
        }

        let start = match local.map(|c| c.position()) {
            None => 0,
            Some(end) if end >= remote.position() => return Ok(false),
            Some(end) => {
                let local_index = self.ctx.local_index(&owner, &filename).await?;
                let remote_index = peer.list_index(owner, &filename).await?;
                common_start(&local_index, &remote_index, end)
            }
        };

        let frames = peer.download(owner, &filename, start, None).await?;
        let position = self.ctx.ingest(owner, &filename, start, frames).await?;
        tracing::info!("Caught up {}/{} from {} to {}", owner, filename, start, position);
        Ok(true)
    }
}
