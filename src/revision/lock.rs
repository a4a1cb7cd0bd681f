//! Per-document write serialization.
//!
//! Both engines read a side-car, edit it in memory and write it back. Two
//! writers on one id must not interleave between those steps, so each write
//! holds the id's lock for its whole flow. Writers on different ids run
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::storage::DocId;

/// Lock table keyed by document id, shared by clones of an engine.
#[derive(Clone, Default)]
pub(crate) struct DocLocks {
    inner: Arc<Mutex<HashMap<DocId, Arc<AsyncMutex<()>>>>>,
}

impl DocLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. Released when the guard drops.
    pub(crate) async fn lock(&self, id: &DocId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut table = self.inner.lock();
            // entries only the table still references are idle
            table.retain(|_, slot| Arc::strong_count(slot) > 1);
            table.entry(id.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl std::fmt::Debug for DocLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocLocks").field("held", &self.inner.lock().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> DocId {
        DocId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let locks = DocLocks::new();
        let guard = locks.lock(&id("d")).await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock(&id("d")).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_ids_do_not_block() {
        let locks = DocLocks::new();
        let _a = locks.lock(&id("a")).await;
        let _b = locks.lock(&id("b")).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_idle_entries_are_dropped() {
        let locks = DocLocks::new();
        drop(locks.lock(&id("a")).await);
        drop(locks.lock(&id("b")).await);
        let _c = locks.lock(&id("c")).await;
        assert_eq!(locks.len(), 1);
    }
}
