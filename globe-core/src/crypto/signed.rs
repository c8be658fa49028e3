use super::keys::{KeyPair, PublicKey};
use crate::error::{GlobeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize)]
struct Envelope {
    payload: Vec<u8>,
    signature: Vec<u8>,
}

/// A value together with the exact bytes that were signed and the signature over them.
///
/// The canonical bytes are kept verbatim so that forwarding an envelope never re-encodes
/// the value; equality is byte equality of payload and signature.
#[derive(Clone)]
pub struct Signed<T> {
    value: T,
    payload: Vec<u8>,
    signature: [u8; 64],
}

impl<T: Serialize> Signed<T> {
    pub fn sign(value: T, keys: &KeyPair) -> Result<Self> {
        let payload = postcard::to_allocvec(&value)?;
        let signature = keys.sign(&payload);
        Ok(Self {
            value,
            payload,
            signature,
        })
    }
}

impl<T: DeserializeOwned> Signed<T> {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = postcard::from_bytes(bytes)?;
        let signature: [u8; 64] = envelope
            .signature
            .try_into()
            .map_err(|_| GlobeError::Serialization("signature must be 64 bytes".to_string()))?;
        let value = postcard::from_bytes(&envelope.payload)?;
        Ok(Self {
            value,
            payload: envelope.payload,
            signature,
        })
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| GlobeError::Serialization(format!("invalid envelope hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl<T> Signed<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn verify(&self, signer: &PublicKey) -> Result<()> {
        signer.verify(&self.payload, &self.signature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let envelope = Envelope {
            payload: self.payload.clone(),
            signature: self.signature.to_vec(),
        };
        Ok(postcard::to_allocvec(&envelope)?)
    }

    pub fn to_hex(&self) -> Result<String> {
        Ok(hex::encode(self.to_bytes()?))
    }
}

impl<T> PartialEq for Signed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload && self.signature == other.signature
    }
}

impl<T> Eq for Signed<T> {}

impl<T: fmt::Debug> fmt::Debug for Signed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signed").field("value", &self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        position: u64,
        text: String,
    }

    #[test]
    fn test_envelope_survives_wire() {
        let keys = KeyPair::generate();
        let note = Note {
            position: 42,
            text: "hello".to_string(),
        };
        let signed = Signed::sign(note.clone(), &keys).unwrap();

        let decoded: Signed<Note> = Signed::from_bytes(&signed.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.value(), &note);
        assert_eq!(decoded, signed);
        assert!(decoded.verify(&keys.public_key()).is_ok());
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let signed = Signed::sign(
            Note {
                position: 1,
                text: "x".to_string(),
            },
            &keys,
        )
        .unwrap();

        assert!(matches!(
            signed.verify(&other.public_key()),
            Err(GlobeError::Verification(_))
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let keys = KeyPair::generate();
        let signed = Signed::sign(
            Note {
                position: 1,
                text: "abc".to_string(),
            },
            &keys,
        )
        .unwrap();

        let mut bytes = signed.to_bytes().unwrap();
        let last_payload_byte = 1 + signed.payload().len() - 1;
        bytes[last_payload_byte] ^= 0x01;

        let tampered: Signed<Note> = Signed::from_bytes(&bytes).unwrap();
        assert!(tampered.verify(&keys.public_key()).is_err());
    }
}
