//! Documents as callers hand them in and as the engines hand them back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::revision::id::{RevisionHistory, RevisionId, RevisionInfo};
use crate::storage::DocId;

/// A document submitted for writing.
///
/// Bookkeeping fields use the reserved `_` prefix; everything else is the
/// caller's payload and is kept in `body`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Declared previous revision.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Explicit ancestor history, set when importing a replicated branch.
    #[serde(rename = "_revisions", default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionHistory>,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(body: Map<String, Value>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Parse a JSON object, picking up `_id`, `_rev` and `_revisions`.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    pub fn with_revisions(mut self, history: RevisionHistory) -> Self {
        self.revisions = Some(history);
        self
    }

    /// The caller's payload with every reserved `_` key stripped.
    pub fn payload(&self) -> Map<String, Value> {
        strip_reserved(&self.body)
    }
}

/// Copy of `body` without reserved `_` keys.
pub fn strip_reserved(body: &Map<String, Value>) -> Map<String, Value> {
    body.iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Read options shared by both engines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Explicit revision; the winner is used when absent.
    pub rev: Option<String>,
    /// Attach `_revisions`.
    pub revs: bool,
    /// Attach `_revs_info`.
    pub revs_info: bool,
    /// Attach `_conflicts`.
    pub conflicts: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    pub fn revs(mut self, value: bool) -> Self {
        self.revs = value;
        self
    }

    pub fn revs_info(mut self, value: bool) -> Self {
        self.revs_info = value;
        self
    }

    pub fn conflicts(mut self, value: bool) -> Self {
        self.conflicts = value;
        self
    }
}

/// A stored revision with its requested annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisedDocument {
    #[serde(rename = "_id")]
    pub id: DocId,

    #[serde(rename = "_rev")]
    pub rev: RevisionId,

    #[serde(rename = "_revisions", default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionHistory>,

    #[serde(rename = "_revs_info", default, skip_serializing_if = "Option::is_none")]
    pub revs_info: Option<Vec<RevisionInfo>>,

    #[serde(rename = "_conflicts", default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<RevisionId>>,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl RevisedDocument {
    pub fn new(id: DocId, rev: RevisionId, body: Map<String, Value>) -> Self {
        Self {
            id,
            rev,
            revisions: None,
            revs_info: None,
            conflicts: None,
            body,
        }
    }

    /// Look up a payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

/// `{ok, id, rev}` returned by successful writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub ok: bool,
    pub id: DocId,
    pub rev: RevisionId,
}

impl WriteResponse {
    pub fn new(id: DocId, rev: RevisionId) -> Self {
        Self { ok: true, id, rev }
    }
}
