use crate::crypto::{KeyHash, SimKey};
use indexmap::IndexMap;

/// Bounded key cache; the least recently used key is evicted first.
#[derive(Debug)]
pub struct SimKeyCache {
    capacity: usize,
    keys: IndexMap<KeyHash, SimKey>,
}

impl SimKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            keys: IndexMap::new(),
        }
    }

    pub fn get(&mut self, hash: &KeyHash) -> Option<SimKey> {
        let key = self.keys.shift_remove(hash)?;
        self.keys.insert(*hash, key.clone());
        Some(key)
    }

    pub fn insert(&mut self, key: SimKey) {
        let hash = key.hash();
        self.keys.shift_remove(&hash);
        self.keys.insert(hash, key);
        while self.keys.len() > self.capacity {
            self.keys.shift_remove_index(0);
        }
    }

    pub fn forget(&mut self, hash: &KeyHash) -> bool {
        self.keys.shift_remove(hash).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Key state of one owner held by the gateway.
#[derive(Debug)]
pub struct OwnerKeyring {
    current: Option<SimKey>,
    cache: SimKeyCache,
}

impl OwnerKeyring {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: None,
            cache: SimKeyCache::new(capacity),
        }
    }

    /// Key used for new files.
    pub fn current(&self) -> Option<SimKey> {
        self.current.clone()
    }

    pub fn set_current(&mut self, key: SimKey) {
        self.cache.insert(key.clone());
        self.current = Some(key);
    }

    pub fn lookup(&mut self, hash: &KeyHash) -> Option<SimKey> {
        if let Some(current) = &self.current {
            if current.hash() == *hash {
                return Some(current.clone());
            }
        }
        self.cache.get(hash)
    }

    pub fn remember(&mut self, key: SimKey) {
        self.cache.insert(key);
    }

    /// Drop a key from the cache. Forgetting the current key also rotates away from it.
    pub fn forget(&mut self, hash: &KeyHash) -> bool {
        if self.current.as_ref().is_some_and(|k| k.hash() == *hash) {
            self.current = None;
        }
        self.cache.forget(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction() {
        let mut cache = SimKeyCache::new(2);
        let a = SimKey::generate();
        let b = SimKey::generate();
        let c = SimKey::generate();

        cache.insert(a.clone());
        cache.insert(b.clone());
        assert!(cache.get(&a.hash()).is_some());
        cache.insert(c.clone());

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&b.hash()).is_none());
        assert!(cache.get(&a.hash()).is_some());
        assert!(cache.get(&c.hash()).is_some());
    }

    #[test]
    fn test_forget_current_key() {
        let mut keyring = OwnerKeyring::new(4);
        assert!(keyring.current().is_none());

        let first = SimKey::generate();
        keyring.set_current(first.clone());
        assert_eq!(keyring.current(), Some(first.clone()));
        assert_eq!(keyring.lookup(&first.hash()), Some(first.clone()));

        assert!(keyring.forget(&first.hash()));
        assert!(keyring.lookup(&first.hash()).is_none());
        assert!(keyring.current().is_none());
    }
}
