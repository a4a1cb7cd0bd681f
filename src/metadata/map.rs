//! The per-document revision map stored in `<id>.metadata`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::revision::{RevisionHistory, RevisionId, RevisionInfo, RevisionStatus};

/// Bookkeeping of one current revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Milliseconds since the Unix epoch, inherited along the history.
    pub creation_date: i64,
    pub last_modified: i64,
    /// Revision hashes, newest first.
    pub revisions: Vec<String>,
    pub conflict: bool,
    pub deleted: bool,
}

/// Current revisions of a document, keyed by revision id.
///
/// Only leaves are kept: writing a revision removes the entry it descends
/// from, so more than one key means the document has diverged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMap {
    entries: BTreeMap<RevisionId, MetadataEntry>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rev: &RevisionId) -> Option<&MetadataEntry> {
        self.entries.get(rev)
    }

    pub fn contains(&self, rev: &RevisionId) -> bool {
        self.entries.contains_key(rev)
    }

    /// Revision ids, oldest generation first.
    pub fn keys(&self) -> Vec<RevisionId> {
        self.entries.keys().cloned().collect()
    }

    pub fn remove(&mut self, rev: &RevisionId) -> Option<MetadataEntry> {
        self.entries.remove(rev)
    }

    /// The revision a read without explicit `rev` returns: latest
    /// `last_modified`, then highest generation, then highest hash.
    pub fn winner(&self) -> Option<&RevisionId> {
        self.entries
            .iter()
            .max_by(|(a_rev, a), (b_rev, b)| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a_rev.cmp(b_rev))
            })
            .map(|(rev, _)| rev)
    }

    /// Whether the map holds any revision other than `previous`.
    pub fn diverges_from(&self, previous: Option<&RevisionId>) -> bool {
        self.entries.keys().any(|rev| Some(rev) != previous)
    }

    /// Generation of the revision that replaces `previous`: one more than
    /// the length of the history it inherits. A previous revision no longer
    /// in the map hands down only its own hash.
    pub fn next_generation(&self, previous: Option<&RevisionId>) -> u64 {
        let inherited = match previous {
            Some(prev) => self.entries.get(prev).map_or(1, |entry| entry.revisions.len()),
            None => 0,
        };
        inherited as u64 + 1
    }

    /// Replace `previous` by `rev`.
    ///
    /// The new entry continues the history and creation date of `previous`.
    /// A previous revision no longer in the map only contributes its own
    /// hash to the history.
    pub fn advance(
        &mut self,
        previous: Option<&RevisionId>,
        rev: RevisionId,
        now: i64,
        conflict: bool,
        deleted: bool,
    ) {
        let (creation_date, mut revisions) = match previous {
            Some(prev) => match self.entries.remove(prev) {
                Some(entry) => (entry.creation_date, entry.revisions),
                None => (now, vec![prev.hash().to_string()]),
            },
            None => (now, Vec::new()),
        };
        revisions.insert(0, rev.hash().to_string());

        self.entries.insert(
            rev,
            MetadataEntry {
                creation_date,
                last_modified: now,
                revisions,
                conflict,
                deleted,
            },
        );
    }

    /// `_revisions` of a current revision.
    pub fn history(&self, rev: &RevisionId) -> Option<RevisionHistory> {
        self.entries.get(rev).map(|entry| RevisionHistory {
            start: rev.generation(),
            ids: entry.revisions.clone(),
        })
    }

    /// `_revs_info` over every current revision, newest first.
    pub fn revs_info(&self) -> Vec<RevisionInfo> {
        self.entries
            .iter()
            .rev()
            .map(|(rev, entry)| RevisionInfo {
                rev: rev.clone(),
                status: if entry.deleted {
                    RevisionStatus::Deleted
                } else {
                    RevisionStatus::Available
                },
            })
            .collect()
    }
}
