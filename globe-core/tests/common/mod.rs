#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt, stream};
use globe_core::frame::sign_stream;
use globe_core::{
    Announcement, ByteStream, DataFrame, DigestState, DiscoveryService, FixedInterval, FrameSigner,
    FrameStream, FsNode, GlobeNode, KeyPair, LocalDiscoveryService, NodeConfig, SignedCheckpoint,
    StaticPeers,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// In-process nodes sharing one discovery directory and one routing table.
pub struct Cluster {
    pub discovery: Arc<LocalDiscoveryService>,
    pub peers: Arc<StaticPeers>,
    nodes: HashMap<String, Arc<GlobeNode>>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    pub fn new(ids: &[&str]) -> Self {
        Self::with_config(ids, |_| {})
    }

    pub fn with_config(ids: &[&str], tweak: impl Fn(&mut NodeConfig)) -> Self {
        let discovery = Arc::new(LocalDiscoveryService::new());
        let peers = Arc::new(StaticPeers::new());
        let mut nodes = HashMap::new();
        let mut dirs = Vec::new();

        for id in ids {
            let dir = tempfile::tempdir().unwrap();
            let mut config = NodeConfig::new(*id);
            config.announcement_ttl = Duration::ZERO;
            config.max_segment_bytes = 1024 * 1024;
            config.read_chunk_bytes = 7;
            tweak(&mut config);

            let node = Arc::new(
                GlobeNode::open(config, dir.path(), discovery.clone(), peers.clone()).unwrap(),
            );
            peers.register(*id, node.clone());
            nodes.insert(id.to_string(), node);
            dirs.push(dir);
        }

        Self {
            discovery,
            peers,
            nodes,
            _dirs: dirs,
        }
    }

    pub fn node(&self, id: &str) -> Arc<GlobeNode> {
        self.nodes[id].clone()
    }

    pub async fn announce(&self, owner: &KeyPair, servers: &[&str]) {
        // Announcements are ordered by millisecond timestamps.
        tokio::time::sleep(Duration::from_millis(2)).await;
        let signed = Announcement::new(servers.iter().copied())
            .sign(owner)
            .unwrap();
        self.discovery
            .announce(owner.public_key(), signed)
            .await
            .unwrap();
    }

    /// Make a node unreachable for its peers.
    pub fn stop(&self, id: &str) {
        self.peers.remove(id);
    }

    pub fn start(&self, id: &str) {
        self.peers.register(id, self.node(id));
    }
}

/// The 15-line, 570-byte sample text.
pub fn cutters() -> Vec<u8> {
    (0..15)
        .map(|i| format!("hello, this is a test buffer data #{:02}\n", i))
        .collect::<String>()
        .into_bytes()
}

/// Split `data` into small chunks so frame boundaries do not line up with checkpoints.
pub fn chunked(data: &[u8]) -> ByteStream {
    let chunks: Vec<_> = data
        .chunks(7)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

pub async fn collect_frames(frames: FrameStream) -> globe_core::Result<Vec<DataFrame>> {
    frames.try_collect().await
}

/// Concatenated payload of the data frames.
pub fn data_of(frames: &[DataFrame]) -> Bytes {
    let mut out = BytesMut::new();
    for frame in frames {
        if let DataFrame::Data(data) = frame {
            out.extend_from_slice(data);
        }
    }
    out.freeze()
}

pub fn signed_frames(keys: &KeyPair, filename: &str, interval: u64, data: &[u8]) -> FrameStream {
    let signer = FrameSigner::new(
        keys.clone(),
        filename,
        Arc::new(FixedInterval::new(interval)),
        DigestState::new(),
        None,
    );
    sign_stream(signer, chunked(data))
}

/// Frames continuing a file from one of its stored checkpoints.
pub fn continued_frames(
    keys: &KeyPair,
    start: &SignedCheckpoint,
    interval: u64,
    data: &[u8],
) -> FrameStream {
    let signer = FrameSigner::new(
        keys.clone(),
        start.filename(),
        Arc::new(FixedInterval::new(interval)),
        start.value().digest_state().unwrap(),
        None,
    );
    sign_stream(signer, chunked(data))
}

/// Frames of a download together with the position their data starts at.
pub async fn read_frames(frames: FrameStream) -> (u64, Vec<DataFrame>) {
    let frames = collect_frames(frames).await.unwrap();
    let start = match frames.first() {
        Some(DataFrame::Checkpoint(checkpoint)) => checkpoint.position(),
        _ => 0,
    };
    (start, frames)
}

/// Exactly the bytes `[offset, offset + length)` out of a node download.
pub async fn read_range(node: &dyn FsNode, owner: &KeyPair, filename: &str, offset: u64, length: u64) -> Vec<u8> {
    let frames = node
        .download(owner.public_key(), filename, offset, Some(length))
        .await
        .unwrap();
    let (start, frames) = read_frames(frames).await;
    let data = data_of(&frames);
    let from = (offset - start) as usize;
    data[from..from + length as usize].to_vec()
}

pub async fn read_all(node: &dyn FsNode, owner: &KeyPair, filename: &str) -> Vec<u8> {
    let frames = node.download_all(owner.public_key(), filename).await.unwrap();
    let (start, frames) = read_frames(frames).await;
    assert_eq!(start, 0);
    data_of(&frames).to_vec()
}

pub fn checkpoint_positions(frames: &[DataFrame]) -> Vec<u64> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            DataFrame::Checkpoint(checkpoint) => Some(checkpoint.position()),
            DataFrame::Data(_) => None,
        })
        .collect()
}
