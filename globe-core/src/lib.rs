//! Globe Core - replication and integrity engine for owner-keyed file storage
//!
//! Every file belongs to an owner key pair and is replicated across the servers the
//! owner announces through a discovery directory:
//! - append-only files streamed as data frames with owner-signed checkpoints
//! - SHA-256 chaining digests verified on every hop
//! - SQLite checkpoint ledger per node
//! - push, catch-up and fetch reconciliation between replicas
//! - gateway-side ChaCha20 encryption with keys shared through discovery

pub mod cluster;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod node;
pub mod operations;
pub mod storage;
pub mod transport;

pub use cluster::{HttpFsNode, HttpPeers, PeerResolver, StaticPeers};
pub use crypto::{KeyHash, KeyPair, PublicKey, SealedKey, Signed, SimKey};
pub use discovery::{
    Announcement, DiscoveryService, DynDiscovery, HttpDiscoveryService, LocalDiscoveryService,
    ServerId, SharedKey,
};
pub use error::{GlobeError, Result};
pub use frame::{
    ByteStream, Checkpoint, CheckpointPolicy, DataFrame, DigestState, FixedInterval, FrameSigner,
    FrameStream, FrameVerifier, SignedCheckpoint, VerifiedSegment, sign_tombstone,
};
pub use gateway::{FileMetadata, GatewayConfig, GatewayDriver, OwnerGateway};
pub use node::{FsNode, GlobeNode, NodeConfig};
pub use operations::ReconcileReport;
pub use storage::{CheckpointStore, FileStore};
