//! revstore - revision-tracking documents over flat blob stores
//!
//! Two interchangeable engines keep every document as a set of immutable,
//! content-addressed revisions plus one side-car describing how they relate:
//!
//! - [`tree::TreeEngine`] keeps the full branch structure and picks a
//!   deterministic winner among diverged leaves.
//! - [`metadata::MetadataEngine`] keeps only the current revisions and
//!   reports divergence as a resolvable conflict.
//!
//! Both run their I/O as [`job`] flows over a [`storage::BackingStore`],
//! either a git repository (one commit per mutation) or memory.
//!
//! # Example
//!
//! ```no_run
//! use revstore::db::Database;
//! use revstore::revision::{Document, GetOptions};
//! use serde_json::json;
//!
//! # async fn example() -> revstore::db::DatabaseResult<()> {
//! let db = Database::open("./my_database")?;
//! let doc = Document::from_value(json!({"_id": "alice", "name": "Alice"}))?;
//! let written = db.tree().put(doc).await?;
//! let read = db.tree().get("alice", &GetOptions::new()).await?;
//! assert_eq!(read.rev, written.rev);
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod job;
pub mod metadata;
pub mod revision;
pub mod storage;
pub mod tree;
