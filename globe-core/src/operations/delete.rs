use crate::crypto::PublicKey;
use crate::discovery::ServerId;
use crate::error::{GlobeError, Result};
use crate::frame::{SignedCheckpoint, validate_filename};
use crate::node::context::{NodeContext, Route};
use std::sync::Arc;

#[derive(Clone)]
pub struct DeleteOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct DeleteOperationRequest {
    pub owner: PublicKey,
    pub tombstone: SignedCheckpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOperationOutcome {
    Deleted,
    Relayed { master: ServerId },
}

impl DeleteOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// A non-master relays to a live master before applying the tombstone itself, so a
    /// failed relay leaves this node unchanged.
    pub async fn run(&self, request: DeleteOperationRequest) -> Result<DeleteOperationOutcome> {
        let DeleteOperationRequest { owner, tombstone } = request;

        validate_filename(tombstone.filename())?;
        tombstone.verify(&owner)?;
        if !tombstone.is_tombstone() {
            return Err(GlobeError::InvalidRequest(format!(
                "delete of {} carries a data checkpoint",
                tombstone.filename()
            )));
        }

        let masters = match self.ctx.route(&owner, false).await? {
            Route::Local => {
                self.ctx.apply_tombstone(&owner, &tombstone).await?;
                return Ok(DeleteOperationOutcome::Deleted);
            }
            Route::Remote(masters) => masters,
        };

        let master = self
            .ctx
            .live_master(&masters, &owner, tombstone.filename())
            .await?;
        if !master.latest.as_ref().is_some_and(|c| c.is_tombstone()) {
            master.node.delete(owner, tombstone.clone()).await?;
        }
        self.ctx.apply_tombstone(&owner, &tombstone).await?;

        tracing::debug!(
            "Relayed delete of {}/{} to {}",
            owner,
            tombstone.filename(),
            master.server_id
        );
        Ok(DeleteOperationOutcome::Relayed {
            master: master.server_id,
        })
    }
}
