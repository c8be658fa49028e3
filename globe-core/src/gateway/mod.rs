//! Owner gateway: encrypts file bytes with the owner's symmetric keys before they are
//! signed into frames, and decrypts verified segments on the way out.
//!
//! One [`GatewayDriver`] serves any number of owners over a single node; each
//! [`OwnerGateway`] acts with one owner's signing keys and keeps a bounded cache of
//! the symmetric keys it has used or received.

pub mod cipher;
pub mod key_cache;

use crate::crypto::{KeyHash, KeyPair, PublicKey, Signed, SimKey};
use crate::discovery::{Announcement, DynDiscovery, ServerId, SharedKey};
use crate::error::{GlobeError, Result};
use crate::frame::{
    ByteStream, CheckpointPolicy, DigestState, FixedInterval, FrameSigner, FrameVerifier,
    SegmentStream, VerifiedSegment, sign_stream, sign_tombstone, validate_filename, verify_stream,
};
use crate::node::FsNode;
use bytes::{Bytes, BytesMut};
use cipher::FileCipher;
use futures_util::{StreamExt, TryStreamExt, stream};
use key_cache::OwnerKeyring;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub use key_cache::SimKeyCache;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub key_cache_capacity: usize,
    pub max_segment_bytes: usize,
    pub policy: Arc<dyn CheckpointPolicy>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            key_cache_capacity: 64,
            max_segment_bytes: 16 * 1024 * 1024,
            policy: Arc::new(FixedInterval::new(64 * 1024)),
        }
    }
}

/// What a listing reports per live file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub filename: String,
    pub size: u64,
    pub key_hash: Option<KeyHash>,
}

pub struct GatewayDriver {
    node: Arc<dyn FsNode>,
    discovery: DynDiscovery,
    config: GatewayConfig,
    keyrings: Mutex<HashMap<PublicKey, Arc<Mutex<OwnerKeyring>>>>,
}

impl GatewayDriver {
    pub fn new(node: Arc<dyn FsNode>, discovery: DynDiscovery, config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            node,
            discovery,
            config,
            keyrings: Mutex::new(HashMap::new()),
        })
    }

    /// Gateway acting as `keys`. Gateways for the same identity share one keyring.
    pub fn gateway(self: &Arc<Self>, keys: KeyPair) -> Result<OwnerGateway> {
        let mut keyrings = self
            .keyrings
            .lock()
            .map_err(|_| GlobeError::Internal("keyring table poisoned".to_string()))?;
        let keyring = keyrings
            .entry(keys.public_key())
            .or_insert_with(|| Arc::new(Mutex::new(OwnerKeyring::new(self.config.key_cache_capacity))))
            .clone();
        Ok(OwnerGateway {
            driver: self.clone(),
            keys: Arc::new(keys),
            keyring,
        })
    }
}

#[derive(Clone)]
pub struct OwnerGateway {
    driver: Arc<GatewayDriver>,
    keys: Arc<KeyPair>,
    keyring: Arc<Mutex<OwnerKeyring>>,
}

impl OwnerGateway {
    pub fn owner(&self) -> PublicKey {
        self.keys.public_key()
    }

    fn keyring(&self) -> Result<MutexGuard<'_, OwnerKeyring>> {
        self.keyring
            .lock()
            .map_err(|_| GlobeError::Internal("keyring poisoned".to_string()))
    }

    /// Publish the set of servers replicating this owner's files.
    pub async fn announce<I, S>(&self, servers: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<ServerId>,
    {
        let announcement = Announcement::new(servers);
        tracing::info!("Announcing {} on {:?}", self.owner(), announcement.servers);
        let signed = announcement.sign(&self.keys)?;
        self.driver.discovery.announce(self.owner(), signed).await
    }

    /// Make `key` readable by `receiver` through the discovery directory.
    pub async fn share_key(&self, receiver: &PublicKey, key: &SimKey) -> Result<()> {
        let record = Signed::sign(SharedKey::seal(key, receiver)?, &self.keys)?;
        self.driver.discovery.share_key(self.owner(), record).await?;
        tracing::debug!("Shared key {} of {} with {}", key.hash(), self.owner(), receiver);
        Ok(())
    }

    /// Use `key` for new files. It is not shared; call [`share_key`](Self::share_key)
    /// for readers that should see it.
    pub fn set_current_key(&self, key: SimKey) -> Result<()> {
        self.keyring()?.set_current(key);
        Ok(())
    }

    pub fn forget_key(&self, hash: &KeyHash) -> Result<bool> {
        Ok(self.keyring()?.forget(hash))
    }

    /// Current key, generating one (and sharing it with this owner) when none is set.
    async fn current_key(&self) -> Result<SimKey> {
        let current = self.keyring()?.current();
        if let Some(key) = current {
            return Ok(key);
        }

        let key = SimKey::generate();
        self.share_key(&self.owner(), &key).await?;
        self.keyring()?.set_current(key.clone());
        tracing::info!("Generated file key {} for {}", key.hash(), self.owner());
        Ok(key)
    }

    async fn resolve_key(&self, owner: &PublicKey, hash: KeyHash) -> Result<SimKey> {
        let cached = self.keyring()?.lookup(&hash);
        if let Some(key) = cached {
            return Ok(key);
        }

        let me = self.owner();
        let record = self
            .driver
            .discovery
            .get_shared_key(*owner, me, hash)
            .await?
            .ok_or_else(|| {
                GlobeError::KeyUnavailable(format!("key {} of {} is not shared with {}", hash, owner, me))
            })?;
        record.verify(owner)?;

        let shared = record.value();
        if shared.receiver != me || shared.hash != hash {
            return Err(GlobeError::Verification(format!(
                "shared key record for {} does not match the request",
                hash
            )));
        }
        let key = shared.sealed.open(&self.keys)?;
        if key.hash() != hash {
            return Err(GlobeError::Verification(format!("shared key does not hash to {}", hash)));
        }

        tracing::debug!("Fetched key {} of {} from discovery", hash, owner);
        self.keyring()?.remember(key.clone());
        Ok(key)
    }

    /// Write `data` as the bytes of `filename` starting at `offset`.
    ///
    /// `offset` may lie before the stored end; the bytes up to the end are taken as
    /// already stored and skipped. Returns the file's new end position.
    pub async fn upload(&self, filename: &str, offset: u64, data: ByteStream) -> Result<u64> {
        validate_filename(filename)?;
        let owner = self.owner();

        let latest = self.driver.node.latest(owner, filename).await?;
        let (start, key) = match latest {
            Some(checkpoint) if checkpoint.is_tombstone() => {
                return Err(GlobeError::Tombstoned(format!("{}/{}", owner, filename)));
            }
            Some(checkpoint) => {
                checkpoint.verify(&owner)?;
                let checkpoint = checkpoint.into_value();
                if offset > checkpoint.position {
                    return Err(GlobeError::InvalidRequest(format!(
                        "offset {} is past the end of {} ({})",
                        offset, filename, checkpoint.position
                    )));
                }
                let key = match checkpoint.key_hash {
                    Some(hash) => self.resolve_key(&owner, hash).await?,
                    None => self.current_key().await?,
                };
                (checkpoint.digest_state()?, key)
            }
            None if offset > 0 => {
                return Err(GlobeError::InvalidRequest(format!(
                    "{} does not exist, cannot write at offset {}",
                    filename, offset
                )));
            }
            None => (DigestState::new(), self.current_key().await?),
        };

        let position = start.position();
        let skipped = skip_prefix(data, position - offset);
        let mut cipher = FileCipher::new(&key, filename, position)?;
        let encrypted = skipped
            .map(move |chunk| chunk.and_then(|c| cipher.apply(&c)))
            .boxed();

        let signer = FrameSigner::new(
            self.keys.as_ref().clone(),
            filename,
            self.driver.config.policy.clone(),
            start,
            Some(key.hash()),
        );
        let frames = sign_stream(signer, encrypted);
        let end = self.driver.node.upload(owner, filename, position, frames).await?;

        tracing::debug!("Uploaded {}/{} from {} to {}", owner, filename, position, end);
        Ok(end)
    }

    pub async fn upload_bytes(&self, filename: &str, offset: u64, data: Bytes) -> Result<u64> {
        let input = stream::once(async move { Ok(data) }).boxed();
        self.upload(filename, offset, input).await
    }

    /// Plain bytes of this owner's `filename` in `[offset, offset + length)`.
    pub async fn download(&self, filename: &str, offset: u64, length: Option<u64>) -> Result<ByteStream> {
        self.download_from(self.owner(), filename, offset, length).await
    }

    /// Read a file of another owner, with a key that owner shared with this identity.
    ///
    /// Key lookup and verification of the first segment happen before the stream is
    /// returned, so those failures surface here rather than mid-stream.
    pub async fn download_from(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream> {
        validate_filename(filename)?;

        let frames = self.driver.node.download(owner, filename, offset, length).await?;
        let verifier = FrameVerifier::anchored(owner, filename, self.driver.config.max_segment_bytes);
        let mut segments = verify_stream(verifier, frames);
        let Some(first) = segments.try_next().await? else {
            return Ok(stream::empty().boxed());
        };

        let key_hash = first.checkpoint.value().key_hash.ok_or_else(|| {
            GlobeError::KeyUnavailable(format!("{}/{} does not name its key", owner, filename))
        })?;
        let key = self.resolve_key(&owner, key_hash).await?;

        let state = DecryptState {
            key,
            key_hash,
            filename: filename.to_string(),
            segments,
            pending: Some(first),
            offset,
            end: length.map(|len| offset.saturating_add(len)),
        };
        Ok(stream::try_unfold(state, next_decrypted).boxed())
    }

    pub async fn download_bytes(&self, filename: &str, offset: u64, length: Option<u64>) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self.download(filename, offset, length).await?.try_collect().await?;
        let mut out = BytesMut::new();
        for chunk in chunks {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub async fn delete(&self, filename: &str) -> Result<()> {
        validate_filename(filename)?;
        let tombstone = sign_tombstone(&self.keys, filename)?;
        self.driver.node.delete(self.owner(), tombstone).await?;
        tracing::info!("Deleted {}/{}", self.owner(), filename);
        Ok(())
    }

    /// Live files matching a glob pattern.
    pub async fn list(&self, pattern: &str) -> Result<Vec<FileMetadata>> {
        let owner = self.owner();
        let checkpoints = self.driver.node.list(owner, pattern).await?;
        let mut files = Vec::with_capacity(checkpoints.len());
        for checkpoint in checkpoints {
            checkpoint.verify(&owner)?;
            if checkpoint.is_tombstone() {
                continue;
            }
            let checkpoint = checkpoint.into_value();
            files.push(FileMetadata {
                filename: checkpoint.filename,
                size: checkpoint.position,
                key_hash: checkpoint.key_hash,
            });
        }
        Ok(files)
    }

    /// Size and key of a live file; `None` when absent or deleted.
    pub async fn metadata(&self, filename: &str) -> Result<Option<FileMetadata>> {
        validate_filename(filename)?;
        let owner = self.owner();
        let Some(checkpoint) = self.driver.node.latest(owner, filename).await? else {
            return Ok(None);
        };
        checkpoint.verify(&owner)?;
        if checkpoint.is_tombstone() {
            return Ok(None);
        }
        let checkpoint = checkpoint.into_value();
        Ok(Some(FileMetadata {
            filename: checkpoint.filename,
            size: checkpoint.position,
            key_hash: checkpoint.key_hash,
        }))
    }
}

struct SkipState {
    input: ByteStream,
    remaining: u64,
}

async fn next_unskipped(mut state: SkipState) -> Result<Option<(Bytes, SkipState)>> {
    while let Some(chunk) = state.input.next().await {
        let mut chunk = chunk?;
        if state.remaining > 0 {
            let skip = state.remaining.min(chunk.len() as u64) as usize;
            let _ = chunk.split_to(skip);
            state.remaining -= skip as u64;
        }
        if !chunk.is_empty() {
            return Ok(Some((chunk, state)));
        }
    }
    Ok(None)
}

/// Drop the first `count` bytes of `input`.
fn skip_prefix(input: ByteStream, count: u64) -> ByteStream {
    if count == 0 {
        return input;
    }
    stream::try_unfold(SkipState { input, remaining: count }, next_unskipped).boxed()
}

struct DecryptState {
    key: SimKey,
    key_hash: KeyHash,
    filename: String,
    segments: SegmentStream,
    pending: Option<VerifiedSegment>,
    offset: u64,
    end: Option<u64>,
}

async fn next_decrypted(mut state: DecryptState) -> Result<Option<(Bytes, DecryptState)>> {
    loop {
        let segment = match state.pending.take() {
            Some(segment) => segment,
            None => match state.segments.try_next().await? {
                Some(segment) => segment,
                None => return Ok(None),
            },
        };

        if segment.checkpoint.value().key_hash != Some(state.key_hash) {
            return Err(GlobeError::Verification(format!(
                "key of {} changes at position {}",
                state.filename,
                segment.end()
            )));
        }

        let from = state.offset.max(segment.offset);
        let to = state.end.map_or(segment.end(), |end| end.min(segment.end()));
        if to <= from {
            if state.end.is_some_and(|end| segment.offset >= end) {
                return Ok(None);
            }
            continue;
        }

        let slice = &segment.data[(from - segment.offset) as usize..(to - segment.offset) as usize];
        let plain = FileCipher::new(&state.key, &state.filename, from)?.apply(slice)?;
        return Ok(Some((plain, state)));
    }
}
