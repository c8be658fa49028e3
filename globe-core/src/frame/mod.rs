//! Data frames: the wire unit of file streams.
//!
//! A file stream alternates raw data chunks with owner-signed checkpoints. Each
//! checkpoint carries the digest of every byte before its position, which lets any
//! receiver verify a stream relayed through untrusted nodes.

pub mod codec;
pub mod digest;
pub mod signer;
pub mod verifier;

use crate::crypto::{KeyHash, KeyPair, Signed};
use crate::error::{GlobeError, Result};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub use codec::{FrameDecoder, MAX_FRAME_LEN, decode_frames, encode_frame, encode_frames};
pub use digest::DigestState;
pub use signer::{FrameSigner, sign_stream};
pub use verifier::{FrameVerifier, VerifiedSegment, segments_to_frames, verify_stream};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;
pub type FrameStream = BoxStream<'static, Result<DataFrame>>;
pub type SegmentStream = BoxStream<'static, Result<VerifiedSegment>>;

/// Signed integrity marker. Field order is the binary layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub position: u64,
    pub digest: Vec<u8>,
    pub tombstone: bool,
    pub key_hash: Option<KeyHash>,
    pub filename: String,
}

pub type SignedCheckpoint = Signed<Checkpoint>;

impl Checkpoint {
    pub fn at(filename: &str, state: &DigestState, key_hash: Option<KeyHash>) -> Self {
        Self {
            position: state.position(),
            digest: state.to_bytes(),
            tombstone: false,
            key_hash,
            filename: filename.to_string(),
        }
    }

    pub fn tombstone(filename: &str) -> Self {
        Self {
            position: 0,
            digest: Vec::new(),
            tombstone: true,
            key_hash: None,
            filename: filename.to_string(),
        }
    }

    pub fn digest_state(&self) -> Result<DigestState> {
        if self.tombstone {
            return Err(GlobeError::InvalidRequest(format!(
                "tombstone for {} has no digest",
                self.filename
            )));
        }
        DigestState::from_bytes(self.position, &self.digest)
    }
}

impl Signed<Checkpoint> {
    pub fn position(&self) -> u64 {
        self.value().position
    }

    pub fn is_tombstone(&self) -> bool {
        self.value().tombstone
    }

    pub fn filename(&self) -> &str {
        &self.value().filename
    }
}

/// Sign a tombstone for `filename`.
pub fn sign_tombstone(keys: &KeyPair, filename: &str) -> Result<SignedCheckpoint> {
    Signed::sign(Checkpoint::tombstone(filename), keys)
}

#[derive(Debug, Clone)]
pub enum DataFrame {
    Data(Bytes),
    Checkpoint(SignedCheckpoint),
}

impl DataFrame {
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, DataFrame::Checkpoint(_))
    }
}

/// Decides where the signer places checkpoints.
pub trait CheckpointPolicy: Send + Sync + Debug {
    /// First checkpoint position strictly after `position`.
    fn next_checkpoint(&self, position: u64) -> u64;
}

/// A checkpoint at every multiple of a fixed byte interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval(u64);

impl FixedInterval {
    pub fn new(interval: u64) -> Self {
        Self(interval.max(1))
    }

    pub fn interval(&self) -> u64 {
        self.0
    }
}

impl CheckpointPolicy for FixedInterval {
    fn next_checkpoint(&self, position: u64) -> u64 {
        (position / self.0 + 1) * self.0
    }
}

/// Reject filenames that cannot be mapped safely onto local storage.
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() || filename.starts_with('/') {
        return Err(GlobeError::InvalidRequest(format!(
            "invalid filename: '{}'",
            filename
        )));
    }

    for component in filename.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(GlobeError::InvalidRequest(format!(
                "invalid filename component in '{}'",
                filename
            )));
        }
    }

    Ok(())
}
