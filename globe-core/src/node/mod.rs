//! The replication engine: routes file streams to the owner's master and keeps
//! replicas converged.

pub mod context;

use crate::cluster::PeerResolver;
use crate::crypto::PublicKey;
use crate::discovery::{DynDiscovery, ServerId};
use crate::error::Result;
use crate::frame::{FrameStream, SignedCheckpoint};
use crate::operations::{
    CatchUpOperation, DeleteOperation, DeleteOperationOutcome, DeleteOperationRequest,
    DownloadOperation, DownloadOperationRequest, DownloadOperationResult, FetchOperation,
    MetadataOperation, PushOperation, ReconcileReport, UploadOperation, UploadOperationOutcome,
    UploadOperationRequest,
};
use crate::storage::{CheckpointStore, FileStore};
use async_trait::async_trait;
use context::NodeContext;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// File operations every node serves, locally or over the wire.
#[async_trait]
pub trait FsNode: Send + Sync {
    /// Accept a frame stream continuing the file at `offset`. Returns the file's
    /// latest checkpoint position once the stream is committed.
    async fn upload(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        frames: FrameStream,
    ) -> Result<u64>;

    /// Stream frames covering `[offset, offset + length)`. `None` reads to the end.
    async fn download(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FrameStream>;

    async fn download_all(&self, owner: PublicKey, filename: &str) -> Result<FrameStream> {
        self.download(owner, filename, 0, None).await
    }

    async fn delete(&self, owner: PublicKey, tombstone: SignedCheckpoint) -> Result<()>;

    /// Latest checkpoint or tombstone of the file, as the master sees it.
    async fn latest(&self, owner: PublicKey, filename: &str) -> Result<Option<SignedCheckpoint>>;

    /// Latest checkpoint or tombstone of every file matching a glob pattern.
    async fn list(&self, owner: PublicKey, pattern: &str) -> Result<Vec<SignedCheckpoint>>;

    /// Checkpoint positions held by this node, ascending.
    async fn list_index(&self, owner: PublicKey, filename: &str) -> Result<Vec<u64>>;
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub server_id: ServerId,
    /// How long a fetched announcement is trusted before asking discovery again.
    pub announcement_ttl: Duration,
    /// Upper bound on bytes buffered between two checkpoints while verifying.
    pub max_segment_bytes: usize,
    pub read_chunk_bytes: usize,
    pub evict_after_push: bool,
    /// Owners whose announcements are kept in memory at once.
    pub announcement_cache_capacity: usize,
}

impl NodeConfig {
    pub fn new(server_id: impl Into<ServerId>) -> Self {
        Self {
            server_id: server_id.into(),
            announcement_ttl: Duration::from_secs(30),
            max_segment_bytes: 16 * 1024 * 1024,
            read_chunk_bytes: 64 * 1024,
            evict_after_push: false,
            announcement_cache_capacity: 1024,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:7070")
    }
}

pub struct GlobeNode {
    ctx: Arc<NodeContext>,
    upload_op: UploadOperation,
    download_op: DownloadOperation,
    delete_op: DeleteOperation,
    metadata_op: MetadataOperation,
    push_op: PushOperation,
    catch_up_op: CatchUpOperation,
    fetch_op: FetchOperation,
}

impl GlobeNode {
    pub fn new(
        config: NodeConfig,
        ledger: Arc<CheckpointStore>,
        files: Arc<FileStore>,
        discovery: DynDiscovery,
        peers: Arc<dyn PeerResolver>,
    ) -> Self {
        let ctx = Arc::new(NodeContext::new(config, ledger, files, discovery, peers));
        Self {
            upload_op: UploadOperation::new(ctx.clone()),
            download_op: DownloadOperation::new(ctx.clone()),
            delete_op: DeleteOperation::new(ctx.clone()),
            metadata_op: MetadataOperation::new(ctx.clone()),
            push_op: PushOperation::new(ctx.clone()),
            catch_up_op: CatchUpOperation::new(ctx.clone()),
            fetch_op: FetchOperation::new(ctx.clone()),
            ctx,
        }
    }

    /// Open a node whose ledger and files live under `data_dir`.
    pub fn open(
        config: NodeConfig,
        data_dir: &Path,
        discovery: DynDiscovery,
        peers: Arc<dyn PeerResolver>,
    ) -> Result<Self> {
        let ledger = CheckpointStore::new(data_dir.join("ledger.db"))?;
        let files = FileStore::new(data_dir.to_path_buf())?;
        tracing::info!(
            "Opened node {} at {}",
            config.server_id,
            data_dir.display()
        );
        Ok(Self::new(
            config,
            Arc::new(ledger),
            Arc::new(files),
            discovery,
            peers,
        ))
    }

    pub fn server_id(&self) -> &str {
        self.ctx.server_id()
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub async fn upload_with_outcome(&self, request: UploadOperationRequest) -> Result<UploadOperationOutcome> {
        self.upload_op.run(request).await
    }

    pub async fn download_with_source(&self, request: DownloadOperationRequest) -> Result<DownloadOperationResult> {
        self.download_op.run(request).await
    }

    pub async fn delete_with_outcome(&self, request: DeleteOperationRequest) -> Result<DeleteOperationOutcome> {
        self.delete_op.run(request).await
    }

    pub async fn push(&self) -> Result<ReconcileReport> {
        self.push_op.run().await
    }

    pub async fn catch_up(&self) -> Result<ReconcileReport> {
        self.catch_up_op.run().await
    }

    pub async fn fetch(&self) -> Result<ReconcileReport> {
        self.fetch_op.run().await
    }

    /// Have catch-up cover the owner before any of its files arrive here.
    pub async fn watch_owner(&self, owner: PublicKey) -> Result<()> {
        self.ctx.watch(owner).await;
        self.ctx.announcement(&owner, true).await?;
        Ok(())
    }
}

#[async_trait]
impl FsNode for GlobeNode {
    async fn upload(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        frames: FrameStream,
    ) -> Result<u64> {
        let outcome = self
            .upload_op
            .run(UploadOperationRequest {
                owner,
                filename: filename.to_string(),
                offset,
                frames,
            })
            .await?;
        Ok(outcome.position())
    }

    async fn download(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FrameStream> {
        let result = self
            .download_op
            .run(DownloadOperationRequest {
                owner,
                filename: filename.to_string(),
                offset,
                length,
            })
            .await?;
        Ok(result.frames)
    }

    async fn delete(&self, owner: PublicKey, tombstone: SignedCheckpoint) -> Result<()> {
        self.delete_op
            .run(DeleteOperationRequest { owner, tombstone })
            .await?;
        Ok(())
    }

    async fn latest(&self, owner: PublicKey, filename: &str) -> Result<Option<SignedCheckpoint>> {
        self.metadata_op.latest(owner, filename).await
    }

    async fn list(&self, owner: PublicKey, pattern: &str) -> Result<Vec<SignedCheckpoint>> {
        self.metadata_op.list(owner, pattern).await
    }

    async fn list_index(&self, owner: PublicKey, filename: &str) -> Result<Vec<u64>> {
        self.metadata_op.list_index(owner, filename).await
    }
}
