use crate::crypto::SimKey;
use crate::error::{GlobeError, Result};
use bytes::Bytes;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{ChaCha20, Key, Nonce};
use sha2::{Digest, Sha256};

/// Length-preserving file cipher. The keystream is addressed by file position, so
/// any byte range can be encrypted or decrypted on its own.
pub struct FileCipher {
    cipher: ChaCha20,
}

impl FileCipher {
    pub fn new(key: &SimKey, filename: &str, position: u64) -> Result<Self> {
        let digest = Sha256::digest(filename.as_bytes());
        let mut cipher = ChaCha20::new(Key::from_slice(key.as_bytes()), Nonce::from_slice(&digest[..12]));
        cipher.try_seek(position).map_err(|_| {
            GlobeError::InvalidRequest(format!("position {} is beyond the cipher range", position))
        })?;
        Ok(Self { cipher })
    }

    pub fn apply(&mut self, data: &[u8]) -> Result<Bytes> {
        let mut buf = data.to_vec();
        self.cipher
            .try_apply_keystream(&mut buf)
            .map_err(|_| GlobeError::InvalidRequest("file exceeds the cipher range".to_string()))?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_decrypt_independently() {
        let key = SimKey::generate();
        let plain: Vec<u8> = (0..200u8).collect();

        let cipher_text = FileCipher::new(&key, "a.bin", 0).unwrap().apply(&plain).unwrap();
        assert_eq!(cipher_text.len(), plain.len());
        assert_ne!(&cipher_text[..], &plain[..]);

        let middle = FileCipher::new(&key, "a.bin", 70)
            .unwrap()
            .apply(&cipher_text[70..130])
            .unwrap();
        assert_eq!(&middle[..], &plain[70..130]);
    }

    #[test]
    fn test_filename_changes_keystream() {
        let key = SimKey::generate();
        let a = FileCipher::new(&key, "a", 0).unwrap().apply(&[0u8; 16]).unwrap();
        let b = FileCipher::new(&key, "b", 0).unwrap().apply(&[0u8; 16]).unwrap();
        assert_ne!(a, b);
    }
}
