//! Conflict objects handed back to callers of the metadata engine.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::metadata::engine::{MetadataEngine, WriteOptions, WriteOutcome};
use crate::revision::{RevisionId, RevisionResult};
use crate::storage::DocId;

/// `{total_rows, rows}` listing diverged documents.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConflictObject {
    pub total_rows: usize,
    pub rows: Vec<ConflictRow>,
}

impl ConflictObject {
    pub fn new(rows: Vec<ConflictRow>) -> Self {
        Self {
            total_rows: rows.len(),
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One diverged document: every revision id known for it, and a resolver
/// bound to one of them.
#[derive(Clone, Serialize)]
pub struct ConflictRow {
    pub id: DocId,
    pub key: Vec<RevisionId>,
    #[serde(rename = "rev")]
    revision: RevisionId,
    #[serde(skip)]
    engine: MetadataEngine,
}

impl ConflictRow {
    pub(crate) fn new(
        engine: MetadataEngine,
        id: DocId,
        key: Vec<RevisionId>,
        revision: RevisionId,
    ) -> Self {
        Self {
            id,
            key,
            revision,
            engine,
        }
    }

    /// The revision the resolver continues from.
    pub fn revision(&self) -> &RevisionId {
        &self.revision
    }

    /// Resolve the conflict.
    ///
    /// Writes `content` as the successor of the bound revision, or a
    /// deletion when `content` is `None`. Every revision listed in `key` is
    /// dropped from the map and its blob deleted afterwards.
    pub async fn solve(
        &self,
        content: Option<Map<String, Value>>,
        options: &WriteOptions,
    ) -> RevisionResult<WriteOutcome> {
        self.engine
            .solve_conflict(&self.id, &self.revision, &self.key, content, options)
            .await
    }
}

impl fmt::Debug for ConflictRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictRow")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("revision", &self.revision)
            .finish()
    }
}
