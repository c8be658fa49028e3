use crate::crypto::PublicKey;
use crate::error::{GlobeError, Result};
use crate::frame::{SignedCheckpoint, validate_filename};
use crate::node::context::{NodeContext, Route};
use std::sync::Arc;

/// Latest-checkpoint queries, answered by a master.
#[derive(Clone)]
pub struct MetadataOperation {
    ctx: Arc<NodeContext>,
}

impl MetadataOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn latest(&self, owner: PublicKey, filename: &str) -> Result<Option<SignedCheckpoint>> {
        validate_filename(filename)?;
        match self.ctx.route(&owner, false).await? {
            Route::Local => self.ctx.local_latest(&owner, filename).await,
            Route::Remote(masters) => {
                let master = self.ctx.live_master(&masters, &owner, filename).await?;
                Ok(master.latest)
            }
        }
    }

    pub async fn list(&self, owner: PublicKey, pattern: &str) -> Result<Vec<SignedCheckpoint>> {
        let masters = match self.ctx.route(&owner, false).await? {
            Route::Local => return self.ctx.local_list(&owner, pattern).await,
            Route::Remote(masters) => masters,
        };

        let mut last_error = None;
        for server_id in &masters {
            let listed = match self.ctx.resolve(server_id) {
                Ok(node) => node.list(owner, pattern).await,
                Err(error) => Err(error),
            };
            match listed {
                Ok(checkpoints) => {
                    for checkpoint in &checkpoints {
                        checkpoint.verify(&owner)?;
                    }
                    return Ok(checkpoints);
                }
                Err(error) if error.is_peer_unavailable() => {
                    tracing::warn!("Master {} unavailable for listing: {}", server_id, error);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GlobeError::PeerUnavailable(format!("no master announced for {}", owner))
        }))
    }

    pub async fn list_index(&self, owner: PublicKey, filename: &str) -> Result<Vec<u64>> {
        validate_filename(filename)?;
        self.ctx.local_index(&owner, filename).await
    }
}
