use crate::error::{GlobeError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek::constants::X25519_BASEPOINT;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const SEAL_INFO: &[u8] = b"globe sealed key v1";

/// Owner public key. Namespace root for every file the owner signs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| GlobeError::InvalidRequest(format!("invalid public key: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        Self::from_bytes(decode_hex32(value, "public key")?)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| GlobeError::Verification(format!("invalid public key: {}", e)))?;
        key.verify(message, &Signature::from_bytes(signature))
            .map_err(|_| GlobeError::Verification(format!("bad signature for {}", self)))
    }

    fn to_montgomery(self) -> Result<MontgomeryPoint> {
        let point = CompressedEdwardsY(self.0)
            .decompress()
            .ok_or_else(|| GlobeError::InvalidRequest("public key is not a curve point".to_string()))?;
        Ok(point.to_montgomery())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &self.to_hex()[..12])
    }
}

impl FromStr for PublicKey {
    type Err = GlobeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Owner signing identity.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_signing(SigningKey::from_bytes(&bytes))
    }

    pub fn from_secret_hex(value: &str) -> Result<Self> {
        Ok(Self::from_secret_bytes(decode_hex32(value, "secret key")?))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    fn x25519_scalar(&self) -> Scalar {
        self.signing.to_scalar()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish()
    }
}

/// Symmetric file encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct SimKey([u8; 32]);

impl SimKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hash(&self) -> KeyHash {
        KeyHash(Sha256::digest(self.0).into())
    }
}

impl fmt::Debug for SimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimKey({})", self.hash())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        Ok(Self(decode_hex32(value, "key hash")?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({}..)", &self.to_hex()[..12])
    }
}

/// A symmetric key sealed for a single receiver.
///
/// The sender derives an X25519 shared secret between a fresh ephemeral scalar and the
/// receiver's Ed25519 key (in Montgomery form), expands it with HKDF-SHA256 and encrypts
/// the key with ChaCha20-Poly1305. Only the receiver's secret scalar can reopen it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub ephemeral: [u8; 32],
    pub ciphertext: Vec<u8>,
}

impl SealedKey {
    pub fn seal(key: &SimKey, receiver: &PublicKey) -> Result<Self> {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let ephemeral_secret = Scalar::from_bytes_mod_order(seed);
        let ephemeral = &X25519_BASEPOINT * &ephemeral_secret;
        let shared = &receiver.to_montgomery()? * &ephemeral_secret;

        let cipher = seal_cipher(&shared, &ephemeral)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&[0u8; 12]), key.as_bytes().as_slice())
            .map_err(|_| GlobeError::Internal("failed to seal key".to_string()))?;

        Ok(Self {
            ephemeral: ephemeral.to_bytes(),
            ciphertext,
        })
    }

    pub fn open(&self, receiver: &KeyPair) -> Result<SimKey> {
        let ephemeral = MontgomeryPoint(self.ephemeral);
        let shared = &ephemeral * &receiver.x25519_scalar();

        let cipher = seal_cipher(&shared, &ephemeral)?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&[0u8; 12]), self.ciphertext.as_slice())
            .map_err(|_| GlobeError::Verification("sealed key cannot be opened".to_string()))?;

        let bytes: [u8; 32] = plain
            .try_into()
            .map_err(|_| GlobeError::Verification("sealed key has wrong length".to_string()))?;
        Ok(SimKey(bytes))
    }
}

fn seal_cipher(shared: &MontgomeryPoint, ephemeral: &MontgomeryPoint) -> Result<ChaCha20Poly1305> {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral.as_bytes()), shared.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(SEAL_INFO, &mut okm)
        .map_err(|e| GlobeError::Internal(format!("hkdf expand failed: {}", e)))?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&okm)))
}

fn decode_hex32(value: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| GlobeError::InvalidRequest(format!("invalid {} hex: {}", what, e)))?;
    bytes
        .try_into()
        .map_err(|_| GlobeError::InvalidRequest(format!("{} must be 32 bytes", what)))
}
