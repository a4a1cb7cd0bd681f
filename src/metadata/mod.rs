//! Metadata-map revision engine.
//!
//! Every document has a side-car entry `<id>.metadata` mapping each current
//! revision to its bookkeeping, next to one content entry per revision.
//!
//! ```text
//!  <id>.metadata                                      <id>.<rev>
//!  ┌─────────────────────────────────────────────┐   ┌──────────────┐
//!  │ "2-b": {creation_date, last_modified,       │   │ payload JSON │
//!  │         revisions: ["b", "a"], conflict,    │   └──────────────┘
//!  │         deleted}                            │
//!  │ "1-x": {...}                                │
//!  └─────────────────────────────────────────────┘
//! ```
//!
//! Only leaves are kept in the map. A write whose previous revision is not
//! the sole key commits anyway and reports the divergence as a
//! [`ConflictObject`]; [`ConflictRow::solve`] collapses it again.
//!
//! # Usage
//!
//! ```ignore
//! use revstore::metadata::{MetadataEngine, WriteOptions};
//!
//! let engine = MetadataEngine::new(store);
//! let outcome = engine.put(doc, &WriteOptions::new()).await?;
//! if let Some(conflicts) = outcome.conflicts {
//!     conflicts.rows[0].solve(Some(merged), &WriteOptions::new()).await?;
//! }
//! ```

mod conflict;
mod engine;
mod map;

pub use conflict::{ConflictObject, ConflictRow};
pub use engine::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, FetchedDocument, MetadataEngine, RowValue,
    WriteOptions, WriteOutcome, LAST_REVISION, METADATA_SUFFIX,
};
pub use map::{MetadataEntry, MetadataMap};
