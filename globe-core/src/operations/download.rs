use crate::crypto::PublicKey;
use crate::discovery::ServerId;
use crate::error::{GlobeError, Result};
use crate::frame::{
    FrameStream, FrameVerifier, SegmentStream, VerifiedSegment, segments_to_frames, validate_filename,
    verify_stream,
};
use crate::node::context::{NodeContext, Route};
use futures_util::{StreamExt, TryStreamExt, stream};
use std::sync::Arc;

#[derive(Clone)]
pub struct DownloadOperation {
    ctx: Arc<NodeContext>,
}

#[derive(Debug, Clone)]
pub struct DownloadOperationRequest {
    pub owner: PublicKey,
    pub filename: String,
    pub offset: u64,
    pub length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSource {
    Local,
    Master(ServerId),
}

pub struct DownloadOperationResult {
    pub source: DownloadSource,
    pub frames: FrameStream,
}

impl DownloadOperation {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, request: DownloadOperationRequest) -> Result<DownloadOperationResult> {
        let DownloadOperationRequest {
            owner,
            filename,
            offset,
            length,
        } = request;

        validate_filename(&filename)?;

        let masters = match self.ctx.route(&owner, false).await? {
            Route::Local => {
                let frames = self
                    .ctx
                    .local_download(owner, &filename, offset, length)
                    .await?;
                return Ok(DownloadOperationResult {
                    source: DownloadSource::Local,
                    frames,
                });
            }
            Route::Remote(masters) => masters,
        };

        let local = self.ctx.local_latest(&owner, &filename).await?;
        if local.as_ref().is_some_and(|c| c.is_tombstone()) {
            return Err(GlobeError::NotFound(format!("{}/{} was deleted", owner, filename)));
        }

        let master = self.ctx.live_master(&masters, &owner, &filename).await?;
        let remote_end = match &master.latest {
            Some(remote) if remote.is_tombstone() => {
                self.ctx.apply_tombstone(&owner, remote).await?;
                return Err(GlobeError::NotFound(format!("{}/{} was deleted", owner, filename)));
            }
            Some(remote) => remote.position(),
            None if local.is_some() => {
                tracing::warn!(
                    "Master {} has no copy of {}/{}, serving local one",
                    master.server_id,
                    owner,
                    filename
                );
                return self.local(owner, &filename, offset, length).await;
            }
            None => return Err(GlobeError::NotFound(format!("{}/{}", owner, filename))),
        };

        if let Some(local_end) = local.as_ref().map(|c| c.position()) {
            let range_end = length
                .map(|len| offset.saturating_add(len))
                .unwrap_or(remote_end)
                .min(remote_end);
            if local_end >= remote_end || local_end >= range_end {
                return self.local(owner, &filename, offset, length).await;
            }
        }

        tracing::debug!(
            "Proxying download of {}/{} at offset {} from {}",
            owner,
            filename,
            offset,
            master.server_id
        );
        let remote = master.node.download(owner, &filename, offset, length).await?;
        let verifier =
            FrameVerifier::anchored(owner, filename.as_str(), self.ctx.config().max_segment_bytes);
        let cache = CacheState {
            ctx: self.ctx.clone(),
            owner,
            filename,
            segments: verify_stream(verifier, remote),
            caching: true,
        };
        let segments = stream::try_unfold(cache, next_cached).boxed();

        Ok(DownloadOperationResult {
            source: DownloadSource::Master(master.server_id),
            frames: segments_to_frames(segments),
        })
    }

    async fn local(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<DownloadOperationResult> {
        let frames = self
            .ctx
            .local_download(owner, filename, offset, length)
            .await?;
        Ok(DownloadOperationResult {
            source: DownloadSource::Local,
            frames,
        })
    }
}

/// Keeps a local copy of the verified segments passing through, as long as they
/// extend what is stored contiguously.
struct CacheState {
    ctx: Arc<NodeContext>,
    owner: PublicKey,
    filename: String,
    segments: SegmentStream,
    caching: bool,
}

async fn next_cached(mut state: CacheState) -> Result<Option<(VerifiedSegment, CacheState)>> {
    let Some(segment) = state.segments.try_next().await? else {
        return Ok(None);
    };

    if state.caching {
        if let Err(error) = state
            .ctx
            .commit_segment(&state.owner, &state.filename, &segment)
            .await
        {
            tracing::debug!(
                "Not caching {}/{} past {}: {}",
                state.owner,
                state.filename,
                segment.offset,
                error
            );
            state.caching = false;
        }
    }

    Ok(Some((segment, state)))
}
