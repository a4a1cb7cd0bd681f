//! backing store layer for revstore
//!
//! The revision engines only ever see a flat namespace of opaque blobs.
//! This module defines that contract and ships two implementations:
//!
//!  # Architecture
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │        TreeEngine        │   │      MetadataEngine      │
//! └──────────────────────────┘   └──────────────────────────┘
//!               │                              │
//!               └──────────────┬───────────────┘
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │  dyn BackingStore     │
//!                  │ get/put/upsert/remove │
//!                  └───────────────────────┘
//!                      │               │
//!                      ▼               ▼
//!              ┌─────────────┐  ┌─────────────┐
//!              │ MemoryStore │  │  GitStore   │
//!              └─────────────┘  └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use revstore::storage::{BackingStore, GitStore};
//!
//! let store = GitStore::open_or_init("./my_database")?;
//! store.put("doc.1-abc", b"{}".to_vec()).await?;
//! let bytes = store.get("doc.1-abc").await?;
//! ```

mod error;
mod git;
mod memory;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use error::{StoreError, StoreResult};
pub use git::{GitStore, StoreStats};
pub use memory::MemoryStore;
#[cfg(test)]
pub(crate) use memory::YieldingStore;
pub use types::{validate_entry_id, DocId, GitSignature, InvalidNameError};

/// A flat blob store the revision engines sit on.
///
/// `put` is create-only and must fail with [`StoreError::AlreadyExists`]
/// when the id is taken; the engines rely on that signal to detect
/// idempotent re-submissions. `upsert` overwrites and is used for side-cars.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Read the blob stored under `id`.
    async fn get(&self, id: &str) -> StoreResult<Vec<u8>>;

    /// Create a blob. Fails if `id` already exists.
    async fn put(&self, id: &str, blob: Vec<u8>) -> StoreResult<()>;

    /// Create or overwrite a blob.
    async fn upsert(&self, id: &str, blob: Vec<u8>) -> StoreResult<()>;

    /// Remove a blob. Fails if `id` does not exist.
    async fn remove(&self, id: &str) -> StoreResult<()>;

    /// List every stored id, sorted.
    async fn list(&self) -> StoreResult<Vec<String>>;
}

/// Shared handle to a backing store.
pub type SharedStore = Arc<dyn BackingStore>;
