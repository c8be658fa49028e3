use super::{DataFrame, DigestState, FrameStream, SegmentStream, SignedCheckpoint};
use crate::crypto::PublicKey;
use crate::error::{GlobeError, Result};
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};

/// Bytes between two checkpoints, released only once the closing checkpoint verified.
#[derive(Debug, Clone)]
pub struct VerifiedSegment {
    pub offset: u64,
    pub data: Bytes,
    pub checkpoint: SignedCheckpoint,
}

impl VerifiedSegment {
    pub fn end(&self) -> u64 {
        self.checkpoint.position()
    }

    pub fn into_frames(self) -> Vec<DataFrame> {
        let mut frames = Vec::with_capacity(2);
        if !self.data.is_empty() {
            frames.push(DataFrame::Data(self.data));
        }
        frames.push(DataFrame::Checkpoint(self.checkpoint));
        frames
    }
}

/// Read/ingest-path transformer: recomputes the digest over incoming data and checks it
/// against every owner-signed checkpoint.
pub struct FrameVerifier {
    owner: PublicKey,
    filename: String,
    max_segment: usize,
    state: Option<DigestState>,
    segment_start: u64,
    pending: BytesMut,
    last_position: Option<u64>,
    last_checkpoint: Option<SignedCheckpoint>,
}

impl FrameVerifier {
    /// Trust is seeded by the stream itself: a leading checkpoint sets the start
    /// state, a leading data frame means the stream starts at position zero.
    pub fn anchored(owner: PublicKey, filename: impl Into<String>, max_segment: usize) -> Self {
        Self {
            owner,
            filename: filename.into(),
            max_segment,
            state: None,
            segment_start: 0,
            pending: BytesMut::new(),
            last_position: None,
            last_checkpoint: None,
        }
    }

    /// Continue from a checkpoint the caller already trusts.
    pub fn starting_at(
        owner: PublicKey,
        filename: impl Into<String>,
        max_segment: usize,
        start: SignedCheckpoint,
    ) -> Result<Self> {
        let state = start.value().digest_state()?;
        let position = state.position();
        Ok(Self {
            owner,
            filename: filename.into(),
            max_segment,
            state: Some(state),
            segment_start: position,
            pending: BytesMut::new(),
            last_position: Some(position),
            last_checkpoint: Some(start),
        })
    }

    pub fn position(&self) -> Option<u64> {
        self.state.as_ref().map(DigestState::position)
    }

    pub fn accept(&mut self, frame: DataFrame) -> Result<Option<VerifiedSegment>> {
        match frame {
            DataFrame::Data(data) => {
                self.accept_data(data)?;
                Ok(None)
            }
            DataFrame::Checkpoint(checkpoint) => self.accept_checkpoint(checkpoint).map(Some),
        }
    }

    fn accept_data(&mut self, data: Bytes) -> Result<()> {
        if self.pending.len() + data.len() > self.max_segment {
            return Err(GlobeError::Verification(format!(
                "unverified segment of {} exceeds {} bytes",
                self.filename, self.max_segment
            )));
        }
        let state = self.state.get_or_insert_with(DigestState::new);
        state.update(&data);
        self.pending.extend_from_slice(&data);
        Ok(())
    }

    fn accept_checkpoint(&mut self, signed: SignedCheckpoint) -> Result<VerifiedSegment> {
        signed.verify(&self.owner)?;
        let checkpoint = signed.value();
        if checkpoint.filename != self.filename {
            return Err(GlobeError::Verification(format!(
                "checkpoint for '{}' found in stream of '{}'",
                checkpoint.filename, self.filename
            )));
        }
        if checkpoint.tombstone {
            return Err(GlobeError::Verification(format!(
                "tombstone found in data stream of '{}'",
                self.filename
            )));
        }

        let Some(state) = self.state.as_ref() else {
            let anchor = checkpoint.digest_state()?;
            tracing::debug!("Anchored {} at position {}", self.filename, anchor.position());
            self.segment_start = anchor.position();
            self.last_position = Some(anchor.position());
            self.state = Some(anchor);
            self.last_checkpoint = Some(signed.clone());
            return Ok(VerifiedSegment {
                offset: checkpoint.position,
                data: Bytes::new(),
                checkpoint: signed,
            });
        };

        let repeats_last =
            self.pending.is_empty() && self.last_position == Some(checkpoint.position);
        if repeats_last {
            // A repeated checkpoint must be byte-identical to the one it repeats.
            if self.last_checkpoint.as_ref().is_some_and(|last| *last != signed) {
                return Err(GlobeError::Verification(format!(
                    "conflicting checkpoints for '{}' at position {}",
                    self.filename, checkpoint.position
                )));
            }
        } else {
            if let Some(last) = self.last_position {
                if checkpoint.position <= last {
                    return Err(GlobeError::Verification(format!(
                        "checkpoint position {} of '{}' does not advance past {}",
                        checkpoint.position, self.filename, last
                    )));
                }
            }
        }

        if checkpoint.position != state.position() || checkpoint.digest != state.to_bytes() {
            return Err(GlobeError::Verification(format!(
                "digest mismatch for '{}' at position {}",
                self.filename, checkpoint.position
            )));
        }

        self.last_checkpoint = Some(signed.clone());
        let segment = VerifiedSegment {
            offset: self.segment_start,
            data: self.pending.split().freeze(),
            checkpoint: signed,
        };
        self.segment_start = segment.end();
        self.last_position = Some(segment.end());
        Ok(segment)
    }

    /// Fails if data arrived after the last checkpoint.
    pub fn finish(&self) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(GlobeError::Verification(format!(
                "stream of '{}' ended with {} unverified bytes",
                self.filename,
                self.pending.len()
            )))
        }
    }
}

struct VerifyState {
    verifier: FrameVerifier,
    frames: FrameStream,
}

async fn next_verified(mut state: VerifyState) -> Result<Option<(VerifiedSegment, VerifyState)>> {
    while let Some(frame) = state.frames.next().await {
        if let Some(segment) = state.verifier.accept(frame?)? {
            return Ok(Some((segment, state)));
        }
    }
    state.verifier.finish()?;
    Ok(None)
}

pub fn verify_stream(verifier: FrameVerifier, frames: FrameStream) -> SegmentStream {
    stream::try_unfold(VerifyState { verifier, frames }, next_verified).boxed()
}

/// Re-emit verified segments as frames.
pub fn segments_to_frames(segments: SegmentStream) -> FrameStream {
    segments
        .map(|segment| {
            let frames = match segment {
                Ok(segment) => segment.into_frames().into_iter().map(Ok).collect(),
                Err(error) => vec![Err(error)],
            };
            stream::iter(frames)
        })
        .flatten()
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyPair, Signed, SimKey};
    use crate::frame::{Checkpoint, CheckpointPolicy, FixedInterval, FrameSigner};
    use futures_util::TryStreamExt;
    use std::sync::Arc;

    const MAX: usize = 1024;

    fn signed_frames(keys: &KeyPair, data: &'static [u8], interval: u64) -> Vec<DataFrame> {
        let policy: Arc<dyn CheckpointPolicy> = Arc::new(FixedInterval::new(interval));
        let mut signer = FrameSigner::new(keys.clone(), "file", policy, DigestState::new(), None);
        let mut frames = signer.push(Bytes::from_static(data)).unwrap();
        frames.extend(signer.finish().unwrap());
        frames
    }

    async fn run(verifier: FrameVerifier, frames: Vec<DataFrame>) -> Result<Vec<VerifiedSegment>> {
        let input = stream::iter(frames.into_iter().map(Ok)).boxed();
        verify_stream(verifier, input).try_collect().await
    }

    #[tokio::test]
    async fn test_verifies_signed_stream() {
        let keys = KeyPair::generate();
        let frames = signed_frames(&keys, b"hello world, verified", 8);

        let segments = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), frames)
            .await
            .unwrap();

        let offsets: Vec<(u64, u64)> = segments.iter().map(|s| (s.offset, s.end())).collect();
        assert_eq!(offsets, vec![(0, 8), (8, 16), (16, 21)]);
        let joined: Vec<u8> = segments.iter().flat_map(|s| s.data.to_vec()).collect();
        assert_eq!(joined, b"hello world, verified");
    }

    #[tokio::test]
    async fn test_tampered_data_is_rejected_at_checkpoint() {
        let keys = KeyPair::generate();
        let mut frames = signed_frames(&keys, b"0123456789abcdefghij", 10);
        frames[2] = DataFrame::Data(Bytes::from_static(b"XXXXXXXXXX"));

        let input = stream::iter(frames.into_iter().map(Ok)).boxed();
        let mut segments =
            verify_stream(FrameVerifier::anchored(keys.public_key(), "file", MAX), input);

        let first = segments.try_next().await.unwrap().unwrap();
        assert_eq!(first.data, Bytes::from_static(b"0123456789"));
        assert!(matches!(
            segments.try_next().await,
            Err(GlobeError::Verification(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_signature_is_rejected() {
        let keys = KeyPair::generate();
        let intruder = KeyPair::generate();
        let frames = signed_frames(&intruder, b"0123456789", 10);

        let result = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), frames).await;
        assert!(matches!(result, Err(GlobeError::Verification(_))));
    }

    #[tokio::test]
    async fn test_unclosed_tail_is_rejected() {
        let keys = KeyPair::generate();
        let mut frames = signed_frames(&keys, b"0123456789", 10);
        frames.push(DataFrame::Data(Bytes::from_static(b"dangling")));

        let result = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), frames).await;
        assert!(matches!(result, Err(GlobeError::Verification(_))));
    }

    #[tokio::test]
    async fn test_non_monotonic_checkpoint_is_rejected() {
        let keys = KeyPair::generate();
        let frames = signed_frames(&keys, b"0123456789abcdefghij", 10);
        let mut replayed = frames.clone();
        replayed.push(frames[1].clone());

        let result = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), replayed).await;
        assert!(matches!(result, Err(GlobeError::Verification(_))));
    }

    #[tokio::test]
    async fn test_conflicting_repeat_is_rejected() {
        let keys = KeyPair::generate();
        let mut state = DigestState::new();
        state.update(b"abcd");
        let plain = Signed::sign(Checkpoint::at("file", &state, None), &keys).unwrap();
        let keyed = Signed::sign(
            Checkpoint::at("file", &state, Some(SimKey::generate().hash())),
            &keys,
        )
        .unwrap();

        // An identical repeat is harmless.
        let repeated = vec![
            DataFrame::Data(Bytes::from_static(b"abcd")),
            DataFrame::Checkpoint(plain.clone()),
            DataFrame::Checkpoint(plain.clone()),
        ];
        let segments = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), repeated)
            .await
            .unwrap();
        assert_eq!(segments.len(), 2);

        let conflicting = vec![
            DataFrame::Data(Bytes::from_static(b"abcd")),
            DataFrame::Checkpoint(plain.clone()),
            DataFrame::Checkpoint(keyed.clone()),
        ];
        let result = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), conflicting).await;
        assert!(matches!(result, Err(GlobeError::Verification(_))));

        // Same when the first of the pair anchored the stream.
        let anchored = vec![DataFrame::Checkpoint(keyed), DataFrame::Checkpoint(plain)];
        let result = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), anchored).await;
        assert!(matches!(result, Err(GlobeError::Verification(_))));
    }

    #[tokio::test]
    async fn test_anchor_and_resume() {
        let keys = KeyPair::generate();
        let frames = signed_frames(&keys, b"0123456789abcdefghij", 10);

        // stream that begins with the checkpoint at 10
        let tail: Vec<DataFrame> = frames[1..].to_vec();
        let segments = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), tail)
            .await
            .unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments[0].data.is_empty());
        assert_eq!(segments[0].end(), 10);
        assert_eq!(segments[1].data, Bytes::from_static(b"abcdefghij"));

        let DataFrame::Checkpoint(start) = frames[1].clone() else {
            panic!("expected a checkpoint at 10");
        };
        let resumed = run(
            FrameVerifier::starting_at(keys.public_key(), "file", MAX, start).unwrap(),
            frames[1..].to_vec(),
        )
        .await
        .unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[1].offset, 10);
    }

    #[tokio::test]
    async fn test_segment_limit() {
        let keys = KeyPair::generate();
        let frames = signed_frames(&keys, b"0123456789abcdefghij", 20);

        let result = run(FrameVerifier::anchored(keys.public_key(), "file", 16), frames).await;
        assert!(matches!(result, Err(GlobeError::Verification(_))));
    }

    #[tokio::test]
    async fn test_checkpoint_for_other_file_is_rejected() {
        let keys = KeyPair::generate();
        let mut state = DigestState::new();
        state.update(b"abc");
        let foreign = Signed::sign(Checkpoint::at("other", &state, None), &keys).unwrap();
        let frames = vec![
            DataFrame::Data(Bytes::from_static(b"abc")),
            DataFrame::Checkpoint(foreign),
        ];

        let result = run(FrameVerifier::anchored(keys.public_key(), "file", MAX), frames).await;
        assert!(matches!(result, Err(GlobeError::Verification(_))));
    }
}
