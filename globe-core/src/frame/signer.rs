use super::{ByteStream, Checkpoint, CheckpointPolicy, DataFrame, DigestState, FrameStream, SignedCheckpoint};
use crate::crypto::{KeyHash, KeyPair, Signed};
use crate::error::Result;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use std::collections::VecDeque;
use std::sync::Arc;

/// Write-path transformer: turns plain bytes into data frames and signed checkpoints.
pub struct FrameSigner {
    keys: KeyPair,
    filename: String,
    key_hash: Option<KeyHash>,
    policy: Arc<dyn CheckpointPolicy>,
    digest: DigestState,
    next_checkpoint: u64,
    last_checkpoint: Option<u64>,
}

impl FrameSigner {
    /// `start` is the digest of the prefix already stored; a non-zero start is
    /// always an existing checkpoint and is not signed again.
    pub fn new(
        keys: KeyPair,
        filename: impl Into<String>,
        policy: Arc<dyn CheckpointPolicy>,
        start: DigestState,
        key_hash: Option<KeyHash>,
    ) -> Self {
        let position = start.position();
        Self {
            keys,
            filename: filename.into(),
            key_hash,
            next_checkpoint: policy.next_checkpoint(position),
            policy,
            digest: start,
            last_checkpoint: (position > 0).then_some(position),
        }
    }

    pub fn position(&self) -> u64 {
        self.digest.position()
    }

    pub fn push(&mut self, mut data: Bytes) -> Result<Vec<DataFrame>> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            let room = self.next_checkpoint - self.digest.position();
            let take = usize::try_from(room).unwrap_or(usize::MAX).min(data.len());
            let chunk = data.split_to(take);
            self.digest.update(&chunk);
            frames.push(DataFrame::Data(chunk));

            if self.digest.position() == self.next_checkpoint {
                frames.push(DataFrame::Checkpoint(self.checkpoint()?));
                self.next_checkpoint = self.policy.next_checkpoint(self.digest.position());
            }
        }
        Ok(frames)
    }

    /// Close the stream with a checkpoint at the current end, unless one is already there.
    pub fn finish(&mut self) -> Result<Option<DataFrame>> {
        if self.last_checkpoint == Some(self.digest.position()) {
            return Ok(None);
        }
        Ok(Some(DataFrame::Checkpoint(self.checkpoint()?)))
    }

    fn checkpoint(&mut self) -> Result<SignedCheckpoint> {
        let checkpoint = Checkpoint::at(&self.filename, &self.digest, self.key_hash);
        let signed = Signed::sign(checkpoint, &self.keys)?;
        self.last_checkpoint = Some(self.digest.position());
        tracing::debug!(
            "Signed checkpoint for {} at position {}",
            self.filename,
            self.digest.position()
        );
        Ok(signed)
    }
}

struct SignState {
    signer: FrameSigner,
    input: ByteStream,
    queue: VecDeque<DataFrame>,
    done: bool,
}

async fn next_signed(mut state: SignState) -> Result<Option<(DataFrame, SignState)>> {
    loop {
        if let Some(frame) = state.queue.pop_front() {
            return Ok(Some((frame, state)));
        }
        if state.done {
            return Ok(None);
        }
        match state.input.next().await {
            Some(chunk) => {
                let frames = state.signer.push(chunk?)?;
                state.queue.extend(frames);
            }
            None => {
                state.done = true;
                let last = state.signer.finish()?;
                state.queue.extend(last);
            }
        }
    }
}

pub fn sign_stream(signer: FrameSigner, input: ByteStream) -> FrameStream {
    let state = SignState {
        signer,
        input,
        queue: VecDeque::new(),
        done: false,
    };
    stream::try_unfold(state, next_signed).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FixedInterval;
    use crate::frame::codec::tests::collect_frames;

    fn positions(frames: &[DataFrame]) -> Vec<u64> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                DataFrame::Checkpoint(checkpoint) => Some(checkpoint.position()),
                DataFrame::Data(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_checkpoints_on_boundaries_and_end() {
        let keys = KeyPair::generate();
        let signer = FrameSigner::new(
            keys.clone(),
            "file",
            Arc::new(FixedInterval::new(10)),
            DigestState::new(),
            None,
        );
        let input = stream::iter(vec![
            Ok(Bytes::from_static(b"0123456")),
            Ok(Bytes::from_static(b"789abcdefghijklmnopqrstu")),
        ])
        .boxed();

        let frames = collect_frames(sign_stream(signer, input)).await.unwrap();
        assert_eq!(positions(&frames), vec![10, 20, 31]);
        assert!(frames.last().unwrap().is_checkpoint());

        for frame in &frames {
            if let DataFrame::Checkpoint(checkpoint) = frame {
                assert!(checkpoint.verify(&keys.public_key()).is_ok());
                assert_eq!(checkpoint.filename(), "file");
            }
        }
    }

    #[test]
    fn test_no_duplicate_final_checkpoint() {
        let mut signer = FrameSigner::new(
            KeyPair::generate(),
            "file",
            Arc::new(FixedInterval::new(4)),
            DigestState::new(),
            None,
        );
        let frames = signer.push(Bytes::from_static(b"abcdefgh")).unwrap();
        assert_eq!(positions(&frames), vec![4, 8]);
        assert!(signer.finish().unwrap().is_none());
    }

    #[test]
    fn test_resumed_signer_counts_prefix() {
        let mut prefix = DigestState::new();
        prefix.update(b"0123456789abcdefghijklmnopqrstuvwxyz");

        let mut signer = FrameSigner::new(
            KeyPair::generate(),
            "file",
            Arc::new(FixedInterval::new(10)),
            prefix,
            None,
        );
        assert!(signer.finish().unwrap().is_none());

        let mut frames = signer.push(Bytes::from_static(b"ABCDEF")).unwrap();
        frames.extend(signer.finish().unwrap());
        assert_eq!(positions(&frames), vec![40, 42]);
    }

    #[test]
    fn test_empty_file_gets_a_checkpoint() {
        let mut signer = FrameSigner::new(
            KeyPair::generate(),
            "empty",
            Arc::new(FixedInterval::new(10)),
            DigestState::new(),
            None,
        );
        let last = signer.finish().unwrap();
        assert!(matches!(last, Some(DataFrame::Checkpoint(c)) if c.position() == 0));
    }
}
