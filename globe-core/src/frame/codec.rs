use super::{ByteStream, DataFrame, FrameStream, SignedCheckpoint};
use crate::error::{GlobeError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{StreamExt, stream};

pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const TAG_DATA: u8 = 0;
const TAG_CHECKPOINT: u8 = 1;
const HEADER_LEN: usize = 5;

/// Frame layout: `tag: u8`, `len: u32` big-endian, then `len` payload bytes.
pub fn encode_frame(frame: &DataFrame, dst: &mut BytesMut) -> Result<()> {
    match frame {
        DataFrame::Data(data) => {
            for chunk in data.chunks(MAX_FRAME_LEN) {
                put_frame(dst, TAG_DATA, chunk);
            }
        }
        DataFrame::Checkpoint(checkpoint) => {
            let payload = checkpoint.to_bytes()?;
            if payload.len() > MAX_FRAME_LEN {
                return Err(GlobeError::InvalidRequest(format!(
                    "checkpoint frame of {} bytes exceeds limit",
                    payload.len()
                )));
            }
            put_frame(dst, TAG_CHECKPOINT, &payload);
        }
    }
    Ok(())
}

fn put_frame(dst: &mut BytesMut, tag: u8, payload: &[u8]) {
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u8(tag);
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
}

pub fn encode_frames(frames: FrameStream) -> ByteStream {
    frames
        .map(|frame| {
            frame.and_then(|frame| {
                let mut buf = BytesMut::new();
                encode_frame(&frame, &mut buf)?;
                Ok(buf.freeze())
            })
        })
        .boxed()
}

/// Incremental frame parser over arbitrarily split input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Result<Option<DataFrame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(GlobeError::Verification(format!(
                "frame of {} bytes exceeds limit",
                len
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();

        match tag {
            TAG_DATA => Ok(Some(DataFrame::Data(payload))),
            TAG_CHECKPOINT => Ok(Some(DataFrame::Checkpoint(SignedCheckpoint::from_bytes(
                &payload,
            )?))),
            other => Err(GlobeError::Verification(format!("unknown frame tag {}", other))),
        }
    }

    /// Fails if a partial frame is left in the buffer.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(GlobeError::Verification(format!(
                "stream ended inside a frame ({} trailing bytes)",
                self.buf.len()
            )))
        }
    }
}

struct DecodeState {
    input: ByteStream,
    decoder: FrameDecoder,
    done: bool,
}

async fn next_decoded(mut state: DecodeState) -> Result<Option<(DataFrame, DecodeState)>> {
    loop {
        if let Some(frame) = state.decoder.next_frame()? {
            return Ok(Some((frame, state)));
        }
        if state.done {
            state.decoder.finish()?;
            return Ok(None);
        }
        match state.input.next().await {
            Some(chunk) => state.decoder.extend(&chunk?),
            None => state.done = true,
        }
    }
}

pub fn decode_frames(input: ByteStream) -> FrameStream {
    let state = DecodeState {
        input,
        decoder: FrameDecoder::new(),
        done: false,
    };
    stream::try_unfold(state, next_decoded).boxed()
}
