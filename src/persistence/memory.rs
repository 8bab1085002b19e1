use super::SharedStore;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// In-process shared store.
///
/// Same semantics as the Redis store, without the cross-process part.
#[derive(Default)]
pub struct MemoryStore {
    strings: RwLock<HashMap<String, String>>,
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    sets: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let strings = self.strings.read().unwrap_or_else(|e| e.into_inner());
        Ok(strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut strings = self.strings.write().unwrap_or_else(|e| e.into_inner());
        strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        self.hashes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        self.sets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let hashes = self.hashes.read().unwrap_or_else(|e| e.into_inner());
        Ok(hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut hashes = self.hashes.write().unwrap_or_else(|e| e.into_inner());
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let hashes = self.hashes.read().unwrap_or_else(|e| e.into_inner());
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        sets.entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
        Ok(sets.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_and_hash_roundtrip() {
        let store = MemoryStore::new();

        store.set("k", "v").await.unwrap();
        store.hset("h", "f", "1").await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.hget("h", "f").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hget("h", "missing").await.unwrap(), None);

        store.del("h").await.unwrap();
        assert!(store.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_membership_is_idempotent() {
        let store = MemoryStore::new();

        store.sadd("s", "a").await.unwrap();
        store.sadd("s", "a").await.unwrap();
        store.srem("s", "missing").await.unwrap();

        assert_eq!(store.smembers("s").await.unwrap().len(), 1);
    }
}
