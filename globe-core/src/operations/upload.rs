use crate::crypto::PublicKey;
use crate::discovery::ServerId;
use crate::error::Result;
use crate::frame::{FrameStream, validate_filename};
use crate::node::context::{NodeContext, Route};
use std::sync::Arc;

#[derive(Clone)]
pub struct UploadOperation {
    ctx: Arc<NodeContext>,
}

pub struct UploadOperationRequest {
    pub owner: PublicKey,
    pub filename: String,
    pub offset: u64,
    pub frames: FrameStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOperationOutcome {
    Stored { position: u64 },
    Relayed { master: ServerId, position: u64 },
}

impl UploadOperationOutcome {
    pub fn position(&self) -> u64 {
        match self {
            Self::Stored { position } | Self::Relayed { position, .. } => *position,
        }
    }
}

impl UploadOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, request: UploadOperationRequest) -> Result<UploadOperationOutcome> {
        let UploadOperationRequest {
            owner,
            filename,
            offset,
            frames,
        } = request;

        validate_filename(&filename)?;

        match self.ctx.route(&owner, false).await? {
            Route::Local => {
                let position = self.ctx.ingest(owner, &filename, offset, frames).await?;
                Ok(UploadOperationOutcome::Stored { position })
            }
            Route::Remote(masters) => {
                let master = self.ctx.live_master(&masters, &owner, &filename).await?;
                tracing::debug!(
                    "Relaying upload of {}/{} at offset {} to {}",
                    owner,
                    filename,
                    offset,
                    master.server_id
                );
                let position = master.node.upload(owner, &filename, offset, frames).await?;
                Ok(UploadOperationOutcome::Relayed {
                    master: master.server_id,
                    position,
                })
            }
        }
    }
}
