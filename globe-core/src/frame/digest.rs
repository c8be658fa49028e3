use crate::error::{GlobeError, Result};
use sha2::compress256;
use sha2::digest::consts::U64;
use sha2::digest::generic_array::GenericArray;

const BLOCK_LEN: usize = 64;

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
    0x5be0cd19,
];

/// Resumable SHA-256 chaining state over a file prefix.
///
/// Serialized form: the eight chaining words (big-endian) followed by the
/// `position % 64` trailing bytes that have not been compressed yet. The encoding
/// depends only on the prefix bytes, so two signers that split the same bytes
/// differently produce identical checkpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestState {
    state: [u32; 8],
    position: u64,
    pending: Vec<u8>,
}

impl Default for DigestState {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestState {
    pub fn new() -> Self {
        Self {
            state: SHA256_IV,
            position: 0,
            pending: Vec::with_capacity(BLOCK_LEN),
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.position += data.len() as u64;

        if !self.pending.is_empty() {
            let take = (BLOCK_LEN - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < BLOCK_LEN {
                return;
            }
            let block = GenericArray::<u8, U64>::clone_from_slice(&self.pending);
            compress256(&mut self.state, &[block]);
            self.pending.clear();
        }

        let full = data.len() - data.len() % BLOCK_LEN;
        if full > 0 {
            let blocks: Vec<GenericArray<u8, U64>> = data[..full]
                .chunks_exact(BLOCK_LEN)
                .map(GenericArray::clone_from_slice)
                .collect();
            compress256(&mut self.state, &blocks);
        }
        self.pending.extend_from_slice(&data[full..]);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.pending.len());
        for word in self.state {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&self.pending);
        out
    }

    pub fn from_bytes(position: u64, bytes: &[u8]) -> Result<Self> {
        let tail = (position % BLOCK_LEN as u64) as usize;
        if bytes.len() != 32 + tail {
            return Err(GlobeError::Verification(format!(
                "digest for position {} must be {} bytes, got {}",
                position,
                32 + tail,
                bytes.len()
            )));
        }

        let mut state = [0u32; 8];
        for (word, chunk) in state.iter_mut().zip(bytes[..32].chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        Ok(Self {
            state,
            position,
            pending: bytes[32..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(chunks: &[&[u8]]) -> DigestState {
        let mut state = DigestState::new();
        for chunk in chunks {
            state.update(chunk);
        }
        state
    }

    #[test]
    fn test_split_independent() {
        let data: Vec<u8> = (0..300u32).map(|i| (i * 7 % 251) as u8).collect();

        let whole = digest_of(&[&data]);
        let bytewise = {
            let mut state = DigestState::new();
            for byte in &data {
                state.update(std::slice::from_ref(byte));
            }
            state
        };
        let uneven = digest_of(&[&data[..10], &data[10..75], &data[75..128], &data[128..]]);

        assert_eq!(whole, bytewise);
        assert_eq!(whole, uneven);
        assert_eq!(whole.position(), 300);
        assert_eq!(whole.to_bytes().len(), 32 + 300 % 64);
    }

    #[test]
    fn test_resume_from_bytes() {
        let data = b"hello, this is a test buffer data #01\nhello, this is a test buffer data #02\n";
        let prefix = digest_of(&[&data[..50]]);

        let mut resumed = DigestState::from_bytes(50, &prefix.to_bytes()).unwrap();
        resumed.update(&data[50..]);

        assert_eq!(resumed, digest_of(&[data]));
    }

    #[test]
    fn test_different_content_differs() {
        assert_ne!(digest_of(&[b"abc"]).to_bytes(), digest_of(&[b"abd"]).to_bytes());
    }

    #[test]
    fn test_rejects_wrong_length() {
        let state = digest_of(&[b"abc"]);
        assert!(DigestState::from_bytes(4, &state.to_bytes()).is_err());
    }
}
