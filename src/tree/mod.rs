//! Tree-based revision engine.
//!
//! Every document has a side-car entry `<id>.revision_tree.json` holding the
//! full branch structure of its revisions, next to one content entry per
//! revision.
//!
//! # Architecture
//!
//! ```text
//!  <id>.revision_tree.json          <id>.<rev>           <id>.<rev>@<name>
//!  ┌───────────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//!  │ 1-a ── 2-b ─┬─ 3-d    │   │ payload JSON     │   │ attachment bytes │
//!  │             └─ 3-c    │   │ + _attachments   │   └──────────────────┘
//!  │ 1-x                   │   └──────────────────┘
//!  └───────────────────────┘
//! ```
//!
//! The winner is the deepest non-deleted leaf, left-most on ties. Since new
//! branches are prepended, left-most is the most recently created.
//!
//! # Usage
//!
//! ```ignore
//! use revstore::tree::TreeEngine;
//!
//! let engine = TreeEngine::new(store);
//! let written = engine.post(Document::new(body)).await?;
//! let doc = engine.get(written.id.as_str(), &GetOptions::new().conflicts(true)).await?;
//! ```

mod attachment;
mod engine;
mod node;

pub use attachment::{Attachment, AttachmentStub};
pub use engine::{TreeEngine, TREE_SUFFIX};
pub use node::{Node, RevisionTree};
