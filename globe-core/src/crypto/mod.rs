pub mod keys;
pub mod signed;

pub use keys::{KeyHash, KeyPair, PublicKey, SealedKey, SimKey};
pub use signed::Signed;
