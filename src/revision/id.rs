//! Revision identifiers and their derivation.
//!
//! A revision id is `"{generation}-{hash}"`. The hash is a SHA-256 digest of
//! the canonical JSON of the payload, the ancestor history it descends from
//! and the deletion flag, so the same edit applied on two different
//! histories yields two different ids, while replaying an identical edit
//! yields the identical id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::revision::error::{RevisionError, RevisionResult};

/// A parsed `"G-H"` revision id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u64,
    hash: String,
}

impl RevisionId {
    /// Build an id from its parts, validating the hash alphabet.
    pub fn new(generation: u64, hash: impl Into<String>) -> RevisionResult<Self> {
        let hash = hash.into();
        if !is_hash(&hash) {
            return Err(RevisionError::wrong_format(format!(
                "revision hash '{}' is not alphanumeric",
                hash
            )));
        }
        Ok(Self { generation, hash })
    }

    /// Parse a revision string, enforcing `^[0-9]+-[0-9a-zA-Z]+$`.
    pub fn parse(rev: &str) -> RevisionResult<Self> {
        let malformed = || {
            RevisionError::wrong_format(format!(
                "the document revision '{}' does not match ^[0-9]+-[0-9a-zA-Z]+$",
                rev
            ))
        };

        let (generation, hash) = rev.split_once('-').ok_or_else(malformed)?;
        if generation.is_empty() || !generation.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        if !is_hash(hash) {
            return Err(malformed());
        }
        let generation = generation.parse::<u64>().map_err(|_| malformed())?;
        Ok(Self {
            generation,
            hash: hash.to_string(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

fn is_hash(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for RevisionId {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = RevisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RevisionId> for String {
    fn from(rev: RevisionId) -> Self {
        rev.to_string()
    }
}

/// Parse an optional caller-supplied previous revision.
///
/// Called before any storage access so a malformed string never costs a
/// round-trip.
pub fn parse_previous(rev: Option<&str>) -> RevisionResult<Option<RevisionId>> {
    rev.map(RevisionId::parse).transpose()
}

/// SHA-256 of the concatenated parts, lowercase hex.
pub fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Content digest of attachment bytes, `sha256-<hex>`.
pub fn digest(bytes: &[u8]) -> String {
    format!("sha256-{}", hex::encode(Sha256::digest(bytes)))
}

/// Generation of the revision that follows `previous`.
pub fn next_generation(previous: Option<&RevisionId>) -> RevisionResult<u64> {
    match previous {
        None => Ok(1),
        Some(prev) => prev.generation().checked_add(1).ok_or_else(|| {
            RevisionError::wrong_format(format!("revision generation of '{}' overflows", prev))
        }),
    }
}

/// Derive the id of the revision that follows `previous`.
///
/// `serde_json::Value` objects serialize with sorted keys, which makes the
/// digest independent of the caller's key order.
pub fn next_revision(
    previous: Option<&RevisionId>,
    payload: &Value,
    ancestor_history: &Value,
    deleted: bool,
) -> RevisionResult<RevisionId> {
    let payload = payload.to_string();
    let history = ancestor_history.to_string();
    let flag = if deleted { "true" } else { "false" };

    Ok(RevisionId {
        generation: next_generation(previous)?,
        hash: hash_parts(&[&payload, &history, flag]),
    })
}

/// The `_revisions` shape: newest hash first, `start` is the newest generation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RevisionHistory {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// History of a revision given its root-to-node path.
    pub fn from_path<'a>(path: impl IntoIterator<Item = &'a RevisionId>) -> Self {
        let mut ids: Vec<String> = Vec::new();
        let mut start = 0;
        for rev in path {
            start = rev.generation();
            ids.push(rev.hash().to_string());
        }
        ids.reverse();
        Self { start, ids }
    }

    /// Check that the history can be expanded into revision ids.
    pub fn validate(&self) -> RevisionResult<()> {
        if self.start == 0 || self.ids.is_empty() || self.ids.len() as u64 > self.start {
            return Err(RevisionError::wrong_format(
                "the document revision history is not well formatted",
            ));
        }
        if let Some(bad) = self.ids.iter().find(|id| !is_hash(id)) {
            return Err(RevisionError::wrong_format(format!(
                "revision hash '{}' is not alphanumeric",
                bad
            )));
        }
        Ok(())
    }

    /// Expand into ids, newest first.
    pub fn to_list(&self) -> Vec<RevisionId> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, hash)| RevisionId {
                generation: self.start - i as u64,
                hash: hash.clone(),
            })
            .collect()
    }

    /// The newest revision of the history.
    pub fn head(&self) -> Option<RevisionId> {
        self.ids.first().map(|hash| RevisionId {
            generation: self.start,
            hash: hash.clone(),
        })
    }
}

/// Status of a revision as recorded by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionStatus {
    Available,
    Missing,
    Deleted,
}

impl fmt::Display for RevisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionStatus::Available => write!(f, "available"),
            RevisionStatus::Missing => write!(f, "missing"),
            RevisionStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// One `_revs_info` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub rev: RevisionId,
    pub status: RevisionStatus,
}
