//! In-process backing store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::validate_entry_id;
use crate::storage::BackingStore;

/// A backing store kept in a sorted map.
///
/// Clone this to share across tasks - it uses Arc internally.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Check if an entry exists.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, id: &str) -> StoreResult<Vec<u8>> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn put(&self, id: &str, blob: Vec<u8>) -> StoreResult<()> {
        validate_entry_id(id)?;
        let mut entries = self.entries.write();
        if entries.contains_key(id) {
            return Err(StoreError::already_exists(id));
        }
        entries.insert(id.to_string(), blob);
        Ok(())
    }

    async fn upsert(&self, id: &str, blob: Vec<u8>) -> StoreResult<()> {
        validate_entry_id(id)?;
        self.entries.write().insert(id.to_string(), blob);
        Ok(())
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        self.entries
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(id))
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Memory store that yields to the runtime before every call, so flows
/// running side by side interleave at each store access.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct YieldingStore(pub MemoryStore);

#[cfg(test)]
#[async_trait]
impl BackingStore for YieldingStore {
    async fn get(&self, id: &str) -> StoreResult<Vec<u8>> {
        tokio::task::yield_now().await;
        self.0.get(id).await
    }

    async fn put(&self, id: &str, blob: Vec<u8>) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.0.put(id, blob).await
    }

    async fn upsert(&self, id: &str, blob: Vec<u8>) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.0.upsert(id, blob).await
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.0.remove(id).await
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.0.list().await
    }
}
