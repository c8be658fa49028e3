//! Discovery directory: where owners publish replica announcements and shared keys.

pub mod http;
pub mod local;

use crate::crypto::{KeyHash, KeyPair, PublicKey, SealedKey, Signed, SimKey};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

pub use http::HttpDiscoveryService;
pub use local::LocalDiscoveryService;

pub type ServerId = String;

/// Signed declaration of which servers replicate (and master) an owner's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub timestamp: u64,
    pub servers: BTreeSet<ServerId>,
}

impl Announcement {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServerId>,
    {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            servers: servers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.servers.contains(server_id)
    }

    pub fn sign(self, owner: &KeyPair) -> Result<Signed<Announcement>> {
        Signed::sign(self, owner)
    }
}

/// An owner's symmetric key, sealed for one receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedKey {
    pub receiver: PublicKey,
    pub hash: KeyHash,
    pub sealed: SealedKey,
}

impl SharedKey {
    pub fn seal(key: &SimKey, receiver: &PublicKey) -> Result<Self> {
        Ok(Self {
            receiver: *receiver,
            hash: key.hash(),
            sealed: SealedKey::seal(key, receiver)?,
        })
    }
}

/// JSON body carrying a hex-encoded signed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeBody {
    pub envelope: String,
}

#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn announce(&self, owner: PublicKey, announcement: Signed<Announcement>) -> Result<()>;

    async fn find(&self, owner: PublicKey) -> Result<Option<Signed<Announcement>>>;

    async fn share_key(&self, owner: PublicKey, record: Signed<SharedKey>) -> Result<()>;

    async fn get_shared_key(
        &self,
        owner: PublicKey,
        receiver: PublicKey,
        hash: KeyHash,
    ) -> Result<Option<Signed<SharedKey>>>;
}

pub type DynDiscovery = Arc<dyn DiscoveryService>;
