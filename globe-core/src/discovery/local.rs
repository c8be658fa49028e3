use super::{Announcement, DiscoveryService, SharedKey};
use crate::crypto::{KeyHash, PublicKey, Signed};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory directory. Used in-process by tests and served over HTTP by an embedded node.
#[derive(Default)]
pub struct LocalDiscoveryService {
    announcements: RwLock<HashMap<PublicKey, Signed<Announcement>>>,
    shared_keys: RwLock<HashMap<(PublicKey, PublicKey, KeyHash), Signed<SharedKey>>>,
}

impl LocalDiscoveryService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscoveryService for LocalDiscoveryService {
    async fn announce(&self, owner: PublicKey, announcement: Signed<Announcement>) -> Result<()> {
        announcement.verify(&owner)?;

        let mut announcements = self.announcements.write().await;
        if let Some(existing) = announcements.get(&owner) {
            if existing.value().timestamp > announcement.value().timestamp {
                tracing::debug!("Ignoring stale announcement for {}", owner);
                return Ok(());
            }
        }

        tracing::debug!(
            "Announced {} on {:?}",
            owner,
            announcement.value().servers
        );
        announcements.insert(owner, announcement);
        Ok(())
    }

    async fn find(&self, owner: PublicKey) -> Result<Option<Signed<Announcement>>> {
        Ok(self.announcements.read().await.get(&owner).cloned())
    }

    async fn share_key(&self, owner: PublicKey, record: Signed<SharedKey>) -> Result<()> {
        record.verify(&owner)?;
        let key = (owner, record.value().receiver, record.value().hash);
        self.shared_keys.write().await.insert(key, record);
        Ok(())
    }

    async fn get_shared_key(
        &self,
        owner: PublicKey,
        receiver: PublicKey,
        hash: KeyHash,
    ) -> Result<Option<Signed<SharedKey>>> {
        Ok(self
            .shared_keys
            .read()
            .await
            .get(&(owner, receiver, hash))
            .cloned())
    }
}
