use super::{FsNode, NodeConfig};
use crate::cluster::PeerResolver;
use crate::crypto::PublicKey;
use crate::discovery::{Announcement, DynDiscovery, ServerId};
use crate::error::{GlobeError, Result};
use crate::frame::{
    DataFrame, FrameStream, FrameVerifier, SignedCheckpoint, VerifiedSegment, segments_to_frames,
    verify_stream,
};
use crate::storage::{CheckpointStore, FileStore};
use futures_util::{StreamExt, TryStreamExt, stream};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::RwLock;

struct CachedAnnouncement {
    announcement: Option<Announcement>,
    fetched_at: Instant,
}

/// Where requests for an owner are served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// This node is a master, or nobody announced any server.
    Local,
    Remote(Vec<ServerId>),
}

/// A master that answered, with its view of the file.
pub struct LiveMaster {
    pub server_id: ServerId,
    pub node: Arc<dyn FsNode>,
    pub latest: Option<SignedCheckpoint>,
}

/// Shared state of one node: storage, routing and the write serialization points.
pub struct NodeContext {
    config: NodeConfig,
    ledger: Arc<CheckpointStore>,
    files: Arc<FileStore>,
    discovery: DynDiscovery,
    peers: Arc<dyn PeerResolver>,
    announcements: RwLock<IndexMap<PublicKey, CachedAnnouncement>>,
    watched: RwLock<BTreeSet<PublicKey>>,
    uploads: Mutex<HashSet<(PublicKey, String)>>,
    commit_lock: tokio::sync::Mutex<()>,
}

pub struct UploadGuard<'a> {
    ctx: &'a NodeContext,
    key: (PublicKey, String),
}

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut uploads) = self.ctx.uploads.lock() {
            uploads.remove(&self.key);
        }
    }
}

impl NodeContext {
    pub fn new(
        config: NodeConfig,
        ledger: Arc<CheckpointStore>,
        files: Arc<FileStore>,
        discovery: DynDiscovery,
        peers: Arc<dyn PeerResolver>,
    ) -> Self {
        Self {
            config,
            ledger,
            files,
            discovery,
            peers,
            announcements: RwLock::new(IndexMap::new()),
            watched: RwLock::new(BTreeSet::new()),
            uploads: Mutex::new(HashSet::new()),
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Latest announcement for `owner`, served from cache while it is fresh.
    pub async fn announcement(&self, owner: &PublicKey, refresh: bool) -> Result<Option<Announcement>> {
        if !refresh {
            if let Some(cached) = self.announcements.read().await.get(owner) {
                if cached.fetched_at.elapsed() < self.config.announcement_ttl {
                    return Ok(cached.announcement.clone());
                }
            }
        }

        match self.discovery.find(*owner).await {
            Ok(found) => {
                let announcement = match found {
                    Some(signed) => {
                        signed.verify(owner)?;
                        Some(signed.into_value())
                    }
                    None => None,
                };
                self.cache_announcement(owner, announcement.clone()).await;
                Ok(announcement)
            }
            Err(error) => {
                if let Some(cached) = self.announcements.read().await.get(owner) {
                    tracing::warn!(
                        "Discovery lookup for {} failed, using cached announcement: {}",
                        owner,
                        error
                    );
                    return Ok(cached.announcement.clone());
                }
                Err(error)
            }
        }
    }

    pub async fn route(&self, owner: &PublicKey, refresh: bool) -> Result<Route> {
        let route = match self.announcement(owner, refresh).await? {
            None => Route::Local,
            Some(announcement) if announcement.contains(self.server_id()) => Route::Local,
            Some(announcement) => Route::Remote(announcement.servers.into_iter().collect()),
        };
        Ok(route)
    }

    /// Most recently fetched entries stay; the oldest fetch is evicted past capacity.
    async fn cache_announcement(&self, owner: &PublicKey, announcement: Option<Announcement>) {
        let capacity = self.config.announcement_cache_capacity.max(1);
        let mut announcements = self.announcements.write().await;
        announcements.shift_remove(owner);
        announcements.insert(
            *owner,
            CachedAnnouncement {
                announcement,
                fetched_at: Instant::now(),
            },
        );
        while announcements.len() > capacity {
            announcements.shift_remove_index(0);
        }
    }

    pub async fn watch(&self, owner: PublicKey) {
        self.watched.write().await.insert(owner);
    }

    /// Owners registered with `watch`, covered by catch-up even before any file arrives.
    pub async fn watched_owners(&self) -> Vec<PublicKey> {
        self.watched.read().await.iter().copied().collect()
    }

    pub fn resolve(&self, server_id: &str) -> Result<Arc<dyn FsNode>> {
        self.peers.resolve(server_id)
    }

    /// First master that answers a `latest` query for the file.
    pub async fn live_master(
        &self,
        masters: &[ServerId],
        owner: &PublicKey,
        filename: &str,
    ) -> Result<LiveMaster> {
        let mut last_error = None;
        for server_id in masters {
            let node = match self.resolve(server_id) {
                Ok(node) => node,
                Err(error) => {
                    tracing::warn!("Cannot resolve master {}: {}", server_id, error);
                    last_error = Some(error);
                    continue;
                }
            };

            match node.latest(*owner, filename).await {
                Ok(latest) => {
                    if let Some(checkpoint) = &latest {
                        verify_checkpoint(owner, filename, checkpoint)?;
                    }
                    return Ok(LiveMaster {
                        server_id: server_id.clone(),
                        node,
                        latest,
                    });
                }
                Err(error) if error.is_peer_unavailable() => {
                    tracing::warn!("Master {} unavailable: {}", server_id, error);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(match last_error {
            Some(error) if error.is_peer_unavailable() => error,
            Some(error) => GlobeError::PeerUnavailable(error.to_string()),
            None => GlobeError::PeerUnavailable(format!("no master announced for {}", owner)),
        })
    }

    /// Run a ledger call on the blocking pool.
    pub async fn ledger<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&CheckpointStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.ledger.clone();
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| GlobeError::Internal(format!("ledger task failed: {}", e)))?
    }

    /// Local tombstone or highest checkpoint of a file.
    pub async fn local_latest(&self, owner: &PublicKey, filename: &str) -> Result<Option<SignedCheckpoint>> {
        let owner = *owner;
        let filename = filename.to_string();
        match self.ledger(move |l| l.load_latest(&owner, &filename)).await {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub async fn load_checkpoint(&self, owner: &PublicKey, filename: &str, position: u64) -> Result<SignedCheckpoint> {
        let owner = *owner;
        let filename = filename.to_string();
        self.ledger(move |l| l.load(&owner, &filename, position)).await
    }

    pub async fn local_index(&self, owner: &PublicKey, filename: &str) -> Result<Vec<u64>> {
        let owner = *owner;
        let filename = filename.to_string();
        self.ledger(move |l| l.list_index(&owner, &filename)).await
    }

    pub async fn local_list(&self, owner: &PublicKey, pattern: &str) -> Result<Vec<SignedCheckpoint>> {
        let owner = *owner;
        let pattern = pattern.to_string();
        self.ledger(move |l| l.list_latest(&owner, &pattern)).await
    }

    pub fn begin_upload(&self, owner: &PublicKey, filename: &str) -> Result<UploadGuard<'_>> {
        let key = (*owner, filename.to_string());
        let mut uploads = self
            .uploads
            .lock()
            .map_err(|_| GlobeError::Internal("upload registry poisoned".to_string()))?;
        if !uploads.insert(key.clone()) {
            return Err(GlobeError::UploadInProgress(format!("{}/{}", owner, filename)));
        }
        Ok(UploadGuard { ctx: self, key })
    }

    /// Verify an incoming frame stream and commit it segment by segment.
    ///
    /// A stream for `offset > 0` continues from the local checkpoint at `offset`; a
    /// stream for offset zero may also open with a checkpoint this node already holds.
    pub async fn ingest(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        frames: FrameStream,
    ) -> Result<u64> {
        let _upload = self.begin_upload(&owner, filename)?;

        let latest = self.local_latest(&owner, filename).await?;
        if latest.as_ref().is_some_and(SignedCheckpoint::is_tombstone) {
            return Err(GlobeError::Tombstoned(format!("{}/{}", owner, filename)));
        }

        let max_segment = self.config.max_segment_bytes;
        let verifier = if offset == 0 {
            FrameVerifier::anchored(owner, filename, max_segment)
        } else {
            let start = match self.load_checkpoint(&owner, filename, offset).await {
                Ok(checkpoint) => checkpoint,
                Err(error) if error.is_not_found() => {
                    return Err(GlobeError::InvalidRequest(format!(
                        "no checkpoint of {} at offset {}",
                        filename, offset
                    )));
                }
                Err(error) => return Err(error),
            };
            FrameVerifier::starting_at(owner, filename, max_segment, start)?
        };

        let mut position = latest.map(|c| c.position()).unwrap_or(0);
        let mut segments = verify_stream(verifier, frames);
        while let Some(segment) = segments.try_next().await? {
            self.commit_segment(&owner, filename, &segment).await?;
            position = position.max(segment.end());
        }

        tracing::info!(
            "Node {} ingested {}/{} from offset {} up to {}",
            self.server_id(),
            owner,
            filename,
            offset,
            position
        );
        Ok(position)
    }

    /// Append a verified segment to local storage and record its checkpoint.
    ///
    /// Bytes overlapping what is already stored must match exactly. Segments that would
    /// leave a gap after the stored end are refused.
    pub async fn commit_segment(&self, owner: &PublicKey, filename: &str, segment: &VerifiedSegment) -> Result<()> {
        let _commit = self.commit_lock.lock().await;

        let latest = self.local_latest(owner, filename).await?;
        if latest.as_ref().is_some_and(SignedCheckpoint::is_tombstone) {
            return Err(GlobeError::Tombstoned(format!("{}/{}", owner, filename)));
        }
        let stored_end = latest.as_ref().map(|c| c.position()).unwrap_or(0);
        let end = segment.end();

        if segment.data.is_empty() && end > 0 {
            return match self.load_checkpoint(owner, filename, end).await {
                Ok(existing) if existing == segment.checkpoint => Ok(()),
                Ok(_) => Err(GlobeError::Conflict(format!(
                    "{}/{} holds a different checkpoint at {}",
                    owner, filename, end
                ))),
                Err(error) if error.is_not_found() => Err(GlobeError::InvalidRequest(format!(
                    "checkpoint {} of {}/{} is not held locally",
                    end, owner, filename
                ))),
                Err(error) => Err(error),
            };
        }

        if segment.offset > stored_end {
            return Err(GlobeError::InvalidRequest(format!(
                "segment {}..{} of {}/{} starts after stored end {}",
                segment.offset, end, owner, filename, stored_end
            )));
        }

        let overlap_end = end.min(stored_end);
        if overlap_end > segment.offset {
            let overlap = (overlap_end - segment.offset) as usize;
            let local = self
                .files
                .read_range(owner, filename, segment.offset, overlap as u64)
                .await?;
            if local[..] != segment.data[..overlap] {
                return Err(GlobeError::Conflict(format!(
                    "{}/{} differs from stored bytes in {}..{}",
                    owner, filename, segment.offset, overlap_end
                )));
            }
        }

        if end > stored_end || latest.is_none() {
            let skip = (stored_end - segment.offset) as usize;
            self.files
                .write_at(owner, filename, stored_end, &segment.data[skip..])
                .await?;
        }

        let owner_key = *owner;
        let name = filename.to_string();
        let checkpoint = segment.checkpoint.clone();
        self.ledger(move |l| l.store(&owner_key, &name, &checkpoint))
            .await?;

        tracing::debug!(
            "Committed {}/{} segment {}..{}",
            owner,
            filename,
            segment.offset,
            end
        );
        Ok(())
    }

    /// Store an owner-signed tombstone and drop the local bytes.
    pub async fn apply_tombstone(&self, owner: &PublicKey, tombstone: &SignedCheckpoint) -> Result<()> {
        tombstone.verify(owner)?;
        if !tombstone.is_tombstone() {
            return Err(GlobeError::InvalidRequest(format!(
                "checkpoint for {} is not a tombstone",
                tombstone.filename()
            )));
        }

        let _commit = self.commit_lock.lock().await;
        let owner_key = *owner;
        let record = tombstone.clone();
        self.ledger(move |l| l.drop_file(&owner_key, record.filename(), &record))
            .await?;
        self.files.delete(owner, tombstone.filename()).await?;

        tracing::info!("Node {} tombstoned {}/{}", self.server_id(), owner, tombstone.filename());
        Ok(())
    }

    /// Drop a live local copy after it was handed to a master.
    pub async fn evict(&self, owner: &PublicKey, filename: &str) -> Result<()> {
        let _commit = self.commit_lock.lock().await;
        let owner_key = *owner;
        let name = filename.to_string();
        self.ledger(move |l| l.evict(&owner_key, &name)).await?;
        self.files.delete(owner, filename).await?;
        tracing::info!("Node {} evicted {}/{}", self.server_id(), owner, filename);
        Ok(())
    }

    /// Stream locally stored frames covering `[offset, offset + length)`, re-verified.
    ///
    /// The stream starts at the greatest checkpoint at or before `offset` (opening with
    /// that checkpoint) and ends at the smallest checkpoint at or after the range end.
    pub async fn local_download(
        self: &Arc<Self>,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FrameStream> {
        let latest = self.local_latest(&owner, filename).await?;
        match latest {
            Some(checkpoint) if checkpoint.is_tombstone() => {
                return Err(GlobeError::NotFound(format!("{}/{} was deleted", owner, filename)));
            }
            Some(_) => {}
            None => return Err(GlobeError::NotFound(format!("{}/{}", owner, filename))),
        }

        let index = self.local_index(&owner, filename).await?;
        let Some(&last) = index.last() else {
            return Err(GlobeError::NotFound(format!("{}/{}", owner, filename)));
        };
        if offset > last {
            return Err(GlobeError::InvalidRequest(format!(
                "offset {} is past the end of {} ({})",
                offset, filename, last
            )));
        }

        let end = match length {
            Some(length) => offset.saturating_add(length).min(last),
            None => last,
        };
        let start = index.iter().rev().find(|&&p| p <= offset).copied();
        let stop = index.iter().find(|&&p| p >= end).copied().unwrap_or(last);
        let positions: VecDeque<u64> = index
            .iter()
            .copied()
            .filter(|&p| start.is_none_or(|s| p > s) && p <= stop)
            .collect();

        let read = LocalRead {
            ctx: self.clone(),
            owner,
            filename: filename.to_string(),
            leading: start,
            positions,
            prev: start.unwrap_or(0),
            queue: VecDeque::new(),
        };
        let frames = stream::try_unfold(read, next_local_frame).boxed();
        let verifier = FrameVerifier::anchored(owner, filename, self.config.max_segment_bytes);
        Ok(segments_to_frames(verify_stream(verifier, frames)))
    }
}

struct LocalRead {
    ctx: Arc<NodeContext>,
    owner: PublicKey,
    filename: String,
    leading: Option<u64>,
    positions: VecDeque<u64>,
    prev: u64,
    queue: VecDeque<DataFrame>,
}

async fn next_local_frame(mut read: LocalRead) -> Result<Option<(DataFrame, LocalRead)>> {
    loop {
        if let Some(frame) = read.queue.pop_front() {
            return Ok(Some((frame, read)));
        }

        if let Some(position) = read.leading.take() {
            let checkpoint = read
                .ctx
                .load_checkpoint(&read.owner, &read.filename, position)
                .await?;
            read.queue.push_back(DataFrame::Checkpoint(checkpoint));
            continue;
        }

        let Some(position) = read.positions.pop_front() else {
            return Ok(None);
        };
        let data = read
            .ctx
            .files
            .read_range(&read.owner, &read.filename, read.prev, position - read.prev)
            .await?;
        let chunk = read.ctx.config.read_chunk_bytes.max(1);
        let mut rest = data;
        while !rest.is_empty() {
            let piece = rest.split_to(chunk.min(rest.len()));
            read.queue.push_back(DataFrame::Data(piece));
        }

        let checkpoint = read
            .ctx
            .load_checkpoint(&read.owner, &read.filename, position)
            .await?;
        read.queue.push_back(DataFrame::Checkpoint(checkpoint));
        read.prev = position;
    }
}

/// A checkpoint received from a peer must be owner-signed and name the expected file.
pub fn verify_checkpoint(owner: &PublicKey, filename: &str, checkpoint: &SignedCheckpoint) -> Result<()> {
    checkpoint.verify(owner)?;
    if checkpoint.filename() != filename {
        return Err(GlobeError::Verification(format!(
            "peer answered for '{}' instead of '{}'",
            checkpoint.filename(),
            filename
        )));
    }
    Ok(())
}
