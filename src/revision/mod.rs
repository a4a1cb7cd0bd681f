//! Revision identifiers, document shapes and errors shared by both engines.
//!
//! Revision ids are content addressed: [`next_revision`] hashes the payload
//! together with the history it descends from, so writing the same edit twice
//! lands on the same id and the second blob write is a no-op.
//!
//! # Usage
//!
//! ```ignore
//! use revstore::revision::{next_revision, RevisionId};
//!
//! let prev = RevisionId::parse("1-abc")?;
//! let rev = next_revision(Some(&prev), &payload, &history, false)?;
//! assert_eq!(rev.generation(), 2);
//! ```

pub(crate) mod blob;
mod document;
mod error;
mod id;
pub(crate) mod lock;

pub use document::{strip_reserved, Document, GetOptions, RevisedDocument, WriteResponse};
pub use error::{RevisionError, RevisionResult};
pub use id::{
    digest, hash_parts, next_generation, next_revision, parse_previous, RevisionHistory,
    RevisionId, RevisionInfo, RevisionStatus,
};
