//! Metadata-map revision engine.
//!
//! Writes never fail on divergence. A write whose previous revision is not
//! the only current one still commits, and the outcome carries
//! `conflict: true` with a [`ConflictObject`] the caller may resolve later.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::job::{self, Flow, Job};
use crate::metadata::conflict::{ConflictObject, ConflictRow};
use crate::metadata::map::MetadataMap;
use crate::revision::blob::{content_entry, drop_entry, load_content, load_side_car, put_once};
use crate::revision::lock::DocLocks;
use crate::revision::{
    hash_parts, parse_previous, Document, GetOptions, RevisedDocument, RevisionError,
    RevisionHistory, RevisionId, RevisionInfo, RevisionResult,
};
use crate::storage::{DocId, InvalidNameError, SharedStore};

/// Suffix of the metadata side-car entry.
pub const METADATA_SUFFIX: &str = ".metadata";

/// Previous revision accepted by [`MetadataEngine::remove`] meaning "the
/// current winner".
pub const LAST_REVISION: &str = "last";

/// Annotations requested on a write outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub revs: bool,
    pub revs_info: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revs(mut self, value: bool) -> Self {
        self.revs = value;
        self
    }

    pub fn revs_info(mut self, value: bool) -> Self {
        self.revs_info = value;
        self
    }
}

/// Result of a metadata engine write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub ok: bool,
    pub id: DocId,
    pub rev: RevisionId,
    /// Whether the document had diverged when the write committed.
    pub conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<ConflictObject>,
    #[serde(rename = "_revisions", skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionHistory>,
    #[serde(rename = "_revs_info", skip_serializing_if = "Option::is_none")]
    pub revs_info: Option<Vec<RevisionInfo>>,
}

/// A revision read through the metadata engine.
#[derive(Debug, Clone, Serialize)]
pub struct FetchedDocument {
    #[serde(flatten)]
    pub document: RevisedDocument,
    #[serde(rename = "_creation_date")]
    pub creation_date: i64,
    #[serde(rename = "_last_modified")]
    pub last_modified: i64,
    #[serde(rename = "_conflict_object", skip_serializing_if = "Option::is_none")]
    pub conflict_object: Option<ConflictObject>,
}

impl FetchedDocument {
    /// Look up a payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllDocsOptions {
    pub include_docs: bool,
    pub conflicts: bool,
}

impl AllDocsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_docs(mut self, value: bool) -> Self {
        self.include_docs = value;
        self
    }

    pub fn conflicts(mut self, value: bool) -> Self {
        self.conflicts = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowValue {
    pub rev: RevisionId,
    pub creation_date: i64,
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllDocsRow {
    pub id: DocId,
    pub key: DocId,
    pub value: RowValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllDocsResponse {
    pub total_rows: usize,
    pub rows: Vec<AllDocsRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<ConflictObject>,
}

/// Revision engine keeping a map of current revisions per document.
///
/// Writes to one id are serialized across clones, so each one sees the
/// map its predecessor saved and divergence is always reported.
#[derive(Clone)]
pub struct MetadataEngine {
    store: SharedStore,
    locks: DocLocks,
}

impl MetadataEngine {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            locks: DocLocks::new(),
        }
    }

    /// Write a document, generating its id when `_id` is absent.
    pub async fn post(&self, mut doc: Document, options: &WriteOptions) -> RevisionResult<WriteOutcome> {
        if doc.id.is_none() {
            doc.id = Some(DocId::generate().into_string());
        }
        self.put(doc, options).await
    }

    /// Write a new revision descending from `_rev`.
    #[instrument(skip_all, fields(id = ?doc.id))]
    pub async fn put(&self, doc: Document, options: &WriteOptions) -> RevisionResult<WriteOutcome> {
        let id = doc.id.as_deref().ok_or(InvalidNameError::Empty)?;
        let id = DocId::new(id)?;
        let previous = parse_previous(doc.rev.as_deref())?;

        self.write(
            id,
            Previous::Declared(previous),
            Change::Put(doc.payload()),
            options,
        )
        .await
    }

    /// Write a deletion revision descending from `rev`, or from the winner
    /// when `rev` is `"last"`.
    #[instrument(skip(self, options))]
    pub async fn remove(
        &self,
        id: &str,
        rev: Option<&str>,
        options: &WriteOptions,
    ) -> RevisionResult<WriteOutcome> {
        let id = DocId::new(id)?;
        let previous = match rev {
            Some(LAST_REVISION) => Previous::Last,
            rev => Previous::Declared(parse_previous(rev)?),
        };

        self.write(id, previous, Change::Remove, options).await
    }

    /// Read a revision: the winner, or `options.rev` when given.
    pub async fn get(&self, id: &str, options: &GetOptions) -> RevisionResult<FetchedDocument> {
        let rev = parse_previous(options.rev.as_deref())?;
        let flow = Get {
            engine: self.clone(),
            id: DocId::new(id)?,
            rev,
            options: options.clone(),
            map: Mutex::new(MetadataMap::new()),
        };
        job::run(&flow, GetStep::LoadMetadata).await
    }

    /// List every document whose winner is not deleted, ordered by id.
    pub async fn all_docs(&self, options: &AllDocsOptions) -> RevisionResult<AllDocsResponse> {
        let flow = AllDocs {
            engine: self.clone(),
            options: *options,
            rows: Mutex::new(Vec::new()),
            conflicts: Mutex::new(Vec::new()),
        };
        job::run(&flow, AllDocsStep::List).await
    }

    /// Remove content blobs of `id` whose revision is no longer current.
    /// Returns the number of entries removed.
    pub async fn prune(&self, id: &str) -> RevisionResult<usize> {
        let flow = Prune {
            store: self.store.clone(),
            id: DocId::new(id)?,
            map: Mutex::new(MetadataMap::new()),
            removed: AtomicUsize::new(0),
        };
        let _guard = self.locks.lock(&flow.id).await;
        job::run(&flow, PruneStep::LoadMetadata).await
    }

    /// Write the successor of `revision` on behalf of a [`ConflictRow`].
    #[instrument(skip(self, key, content, options))]
    pub(crate) async fn solve_conflict(
        &self,
        id: &DocId,
        revision: &RevisionId,
        key: &[RevisionId],
        content: Option<Map<String, Value>>,
        options: &WriteOptions,
    ) -> RevisionResult<WriteOutcome> {
        self.write(
            id.clone(),
            Previous::Declared(Some(revision.clone())),
            Change::Solve {
                content,
                key: key.to_vec(),
            },
            options,
        )
        .await
    }

    /// Run a write flow while holding the document's lock.
    async fn write(
        &self,
        id: DocId,
        previous: Previous,
        change: Change,
        options: &WriteOptions,
    ) -> RevisionResult<WriteOutcome> {
        let flow = Write {
            engine: self.clone(),
            id,
            previous,
            change,
            options: *options,
            state: Mutex::new(WriteState::default()),
        };
        let _guard = self.locks.lock(&flow.id).await;
        job::run(&flow, WriteStep::LoadMetadata).await
    }

    fn conflict_row(&self, id: &DocId, key: Vec<RevisionId>, revision: RevisionId) -> ConflictRow {
        ConflictRow::new(self.clone(), id.clone(), key, revision)
    }
}

impl std::fmt::Debug for MetadataEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataEngine").finish_non_exhaustive()
    }
}

async fn load_metadata(store: &SharedStore, id: &DocId) -> RevisionResult<Option<MetadataMap>> {
    load_side_car(store, &id.entry(METADATA_SUFFIX), "cannot get document metadata").await
}

enum Previous {
    Declared(Option<RevisionId>),
    Last,
}

enum Change {
    Put(Map<String, Value>),
    Remove,
    Solve {
        content: Option<Map<String, Value>>,
        key: Vec<RevisionId>,
    },
}

impl Change {
    /// Content of the new revision; `None` writes a deletion.
    fn content(&self) -> Option<&Map<String, Value>> {
        match self {
            Change::Put(content) => Some(content),
            Change::Remove => None,
            Change::Solve { content, .. } => content.as_ref(),
        }
    }
}

#[derive(Default)]
struct WriteState {
    map: MetadataMap,
    previous: Option<RevisionId>,
    /// Revision ids known when divergence was detected, new one included.
    conflict_key: Option<Vec<RevisionId>>,
}

struct Write {
    engine: MetadataEngine,
    id: DocId,
    previous: Previous,
    change: Change,
    options: WriteOptions,
    state: Mutex<WriteState>,
}

#[derive(Debug)]
enum WriteStep {
    LoadMetadata,
    SaveRevision(RevisionId),
    UpdateMetadata(RevisionId),
    SaveMetadata(RevisionId),
    DropRevision(RevisionId),
}

impl Write {
    fn content_json(&self) -> Option<String> {
        self.change
            .content()
            .map(|content| Value::Object(content.clone()).to_string())
    }

    /// Resolve the previous revision against the stored map and derive the
    /// id of the new revision.
    fn next(&self, map: &MetadataMap) -> RevisionResult<(Option<RevisionId>, RevisionId)> {
        let previous = match &self.previous {
            Previous::Declared(previous) => previous.clone(),
            Previous::Last => Some(
                map.winner()
                    .cloned()
                    .ok_or_else(|| RevisionError::not_found("document not found"))?,
            ),
        };
        if let (Change::Solve { .. }, Some(bound)) = (&self.change, &previous) {
            if !map.contains(bound) {
                return Err(RevisionError::not_found(
                    "conflicting revision is no longer present",
                ));
            }
        }

        let map_json = serde_json::to_string(map)
            .map_err(RevisionError::corrupted(self.id.entry(METADATA_SUFFIX)))?;
        let previous_text = previous
            .as_ref()
            .map_or_else(|| "0".to_string(), RevisionId::to_string);
        let hash = hash_parts(&[
            &self.content_json().unwrap_or_default(),
            &previous_text,
            &map_json,
        ]);
        let generation = map.next_generation(previous.as_ref());
        Ok((previous, RevisionId::new(generation, hash)?))
    }
}

#[async_trait]
impl Flow for Write {
    type Step = WriteStep;
    type Output = WriteOutcome;
    type Error = RevisionError;
    const NAME: &'static str = "metadata.write";

    async fn step(&self, step: WriteStep, job: &Job<Self>) -> RevisionResult<()> {
        match step {
            WriteStep::LoadMetadata => {
                let (map, previous, rev) = match load_metadata(&self.engine.store, &self.id).await? {
                    Some(map) => {
                        let (previous, rev) = self.next(&map)?;
                        (map, previous, rev)
                    }
                    None => match &self.change {
                        // first revision of a new document
                        Change::Put(_) => {
                            let content = self.content_json().unwrap_or_default();
                            let rev = RevisionId::new(1, hash_parts(&[&content]))?;
                            (MetadataMap::new(), None, rev)
                        }
                        _ => return Err(RevisionError::not_found("document not found")),
                    },
                };
                debug!(id = %self.id, %rev, previous = ?previous, "next revision");
                {
                    let mut state = self.state.lock();
                    state.map = map;
                    state.previous = previous;
                }

                if self.change.content().is_some() {
                    job.wait(&WriteStep::SaveMetadata(rev.clone()), 1);
                    job.call(WriteStep::SaveRevision(rev.clone()));
                }
                job.call(WriteStep::UpdateMetadata(rev));
            }

            WriteStep::SaveRevision(rev) => {
                let entry = content_entry(&self.id, &rev);
                if let Some(content) = self.change.content() {
                    let blob = serde_json::to_vec(content)
                        .map_err(RevisionError::corrupted(entry.as_str()))?;
                    put_once(&self.engine.store, &entry, blob).await?;
                }
                job.call(WriteStep::SaveMetadata(rev));
            }

            WriteStep::UpdateMetadata(rev) => {
                {
                    let mut state = self.state.lock();
                    let previous = state.previous.clone();
                    if let Change::Solve { key, .. } = &self.change {
                        // the bound revision stays until advance() consumes it
                        for other in key.iter().filter(|k| Some(*k) != previous.as_ref()) {
                            state.map.remove(other);
                        }
                    }

                    let conflict = state.map.diverges_from(previous.as_ref());
                    if conflict {
                        let mut key = state.map.keys();
                        key.push(rev.clone());
                        key.sort();
                        key.dedup();
                        state.conflict_key = Some(key);
                    }

                    let now = Utc::now().timestamp_millis();
                    let deleted = self.change.content().is_none();
                    state
                        .map
                        .advance(previous.as_ref(), rev.clone(), now, conflict, deleted);
                }
                job.call(WriteStep::SaveMetadata(rev));
            }

            WriteStep::SaveMetadata(rev) => {
                let entry = self.id.entry(METADATA_SUFFIX);
                let (blob, outcome) = {
                    let state = self.state.lock();
                    let conflicts = state.conflict_key.clone().map(|key| {
                        ConflictObject::new(vec![self.engine.conflict_row(&self.id, key, rev.clone())])
                    });
                    let outcome = WriteOutcome {
                        ok: true,
                        id: self.id.clone(),
                        rev: rev.clone(),
                        conflict: conflicts.is_some(),
                        conflicts,
                        revisions: self.options.revs.then(|| state.map.history(&rev)).flatten(),
                        revs_info: self.options.revs_info.then(|| state.map.revs_info()),
                    };
                    (serde_json::to_vec(&state.map), outcome)
                };
                let blob = blob.map_err(RevisionError::corrupted(entry.as_str()))?;
                self.engine
                    .store
                    .upsert(&entry, blob)
                    .await
                    .map_err(RevisionError::storage("cannot store document metadata"))?;

                info!(id = %self.id, %rev, conflict = outcome.conflict, "revision written");
                job.succeed(outcome);
                if let Change::Solve { key, .. } = &self.change {
                    for solved in key.iter().filter(|k| **k != rev) {
                        job.call(WriteStep::DropRevision(solved.clone()));
                    }
                }
            }

            WriteStep::DropRevision(rev) => {
                drop_entry(&self.engine.store, &content_entry(&self.id, &rev)).await;
            }
        }
        Ok(())
    }
}

struct Get {
    engine: MetadataEngine,
    id: DocId,
    rev: Option<RevisionId>,
    options: GetOptions,
    map: Mutex<MetadataMap>,
}

#[derive(Debug)]
enum GetStep {
    LoadMetadata,
    LoadDocument(RevisionId),
}

#[async_trait]
impl Flow for Get {
    type Step = GetStep;
    type Output = FetchedDocument;
    type Error = RevisionError;
    const NAME: &'static str = "metadata.get";

    async fn step(&self, step: GetStep, job: &Job<Self>) -> RevisionResult<()> {
        match step {
            GetStep::LoadMetadata => {
                let map = load_metadata(&self.engine.store, &self.id)
                    .await?
                    .filter(|map| !map.is_empty())
                    .ok_or_else(|| RevisionError::not_found("document not found"))?;
                let rev = match &self.rev {
                    Some(rev) => rev.clone(),
                    None => map
                        .winner()
                        .cloned()
                        .ok_or_else(|| RevisionError::not_found("document not found"))?,
                };
                let entry = map
                    .get(&rev)
                    .ok_or_else(|| RevisionError::not_found("document revision does not exist"))?;
                if entry.deleted {
                    return Err(RevisionError::not_found("document has been removed"));
                }
                *self.map.lock() = map;
                job.call(GetStep::LoadDocument(rev));
            }

            GetStep::LoadDocument(rev) => {
                let body = load_content(&self.engine.store, &self.id, &rev).await?;
                let mut document = RevisedDocument::new(self.id.clone(), rev.clone(), body);

                let map = self.map.lock();
                let entry = map
                    .get(&rev)
                    .ok_or_else(|| RevisionError::not_found("document revision does not exist"))?;
                if self.options.revs {
                    document.revisions = map.history(&rev);
                }
                if self.options.revs_info {
                    document.revs_info = Some(map.revs_info());
                }
                let mut conflict_object = None;
                if self.options.conflicts {
                    let others: Vec<RevisionId> =
                        map.keys().into_iter().filter(|other| *other != rev).collect();
                    if !others.is_empty() {
                        document.conflicts = Some(others);
                        conflict_object = Some(ConflictObject::new(vec![self
                            .engine
                            .conflict_row(&self.id, map.keys(), rev.clone())]));
                    }
                }

                job.succeed(FetchedDocument {
                    document,
                    creation_date: entry.creation_date,
                    last_modified: entry.last_modified,
                    conflict_object,
                });
            }
        }
        Ok(())
    }
}

struct AllDocs {
    engine: MetadataEngine,
    options: AllDocsOptions,
    rows: Mutex<Vec<AllDocsRow>>,
    conflicts: Mutex<Vec<ConflictRow>>,
}

#[derive(Debug)]
enum AllDocsStep {
    List,
    LoadMetadata(DocId),
    LoadDocument(AllDocsRow),
    Done,
}

impl AllDocs {
    fn response(&self) -> AllDocsResponse {
        let mut rows = std::mem::take(&mut *self.rows.lock());
        rows.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        let conflicts = if self.options.conflicts {
            let mut conflicts = std::mem::take(&mut *self.conflicts.lock());
            conflicts.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
            Some(ConflictObject::new(conflicts))
        } else {
            None
        };

        AllDocsResponse {
            total_rows: rows.len(),
            rows,
            conflicts,
        }
    }
}

#[async_trait]
impl Flow for AllDocs {
    type Step = AllDocsStep;
    type Output = AllDocsResponse;
    type Error = RevisionError;
    const NAME: &'static str = "metadata.all_docs";

    async fn step(&self, step: AllDocsStep, job: &Job<Self>) -> RevisionResult<()> {
        match step {
            AllDocsStep::List => {
                let entries = self
                    .engine
                    .store
                    .list()
                    .await
                    .map_err(RevisionError::storage("cannot list documents"))?;
                let ids: Vec<DocId> = entries
                    .iter()
                    .filter_map(|entry| entry.strip_suffix(METADATA_SUFFIX))
                    .filter_map(|id| DocId::new(id).ok())
                    .collect();

                if ids.is_empty() {
                    job.succeed(self.response());
                    return Ok(());
                }
                job.wait(&AllDocsStep::Done, ids.len() - 1);
                for id in ids {
                    job.call(AllDocsStep::LoadMetadata(id));
                }
            }

            AllDocsStep::LoadMetadata(id) => {
                let map = load_metadata(&self.engine.store, &id).await?;
                let winner = map.as_ref().and_then(|map| {
                    let rev = map.winner()?;
                    let entry = map.get(rev)?;
                    (!entry.deleted).then(|| (rev.clone(), entry.clone()))
                });
                let (Some(map), Some((rev, entry))) = (map.as_ref(), winner) else {
                    debug!(%id, "skipping deleted document");
                    job.call(AllDocsStep::Done);
                    return Ok(());
                };

                if self.options.conflicts && map.len() > 1 {
                    self.conflicts
                        .lock()
                        .push(self.engine.conflict_row(&id, map.keys(), rev.clone()));
                }
                let row = AllDocsRow {
                    id: id.clone(),
                    key: id,
                    value: RowValue {
                        rev,
                        creation_date: entry.creation_date,
                        last_modified: entry.last_modified,
                    },
                    doc: None,
                };
                if self.options.include_docs {
                    job.call(AllDocsStep::LoadDocument(row));
                } else {
                    self.rows.lock().push(row);
                    job.call(AllDocsStep::Done);
                }
            }

            AllDocsStep::LoadDocument(mut row) => {
                let body = load_content(&self.engine.store, &row.id, &row.value.rev).await?;
                row.doc = Some(body);
                self.rows.lock().push(row);
                job.call(AllDocsStep::Done);
            }

            AllDocsStep::Done => {
                job.succeed(self.response());
            }
        }
        Ok(())
    }
}

struct Prune {
    store: SharedStore,
    id: DocId,
    map: Mutex<MetadataMap>,
    removed: AtomicUsize,
}

#[derive(Debug)]
enum PruneStep {
    LoadMetadata,
    List,
    Remove(String),
    Done,
}

#[async_trait]
impl Flow for Prune {
    type Step = PruneStep;
    type Output = usize;
    type Error = RevisionError;
    const NAME: &'static str = "metadata.prune";

    async fn step(&self, step: PruneStep, job: &Job<Self>) -> RevisionResult<()> {
        match step {
            PruneStep::LoadMetadata => {
                let map = load_metadata(&self.store, &self.id)
                    .await?
                    .ok_or_else(|| RevisionError::not_found("document not found"))?;
                *self.map.lock() = map;
                job.call(PruneStep::List);
            }

            PruneStep::List => {
                let entries = self
                    .store
                    .list()
                    .await
                    .map_err(RevisionError::storage("cannot list entries"))?;
                let prefix = self.id.entry(".");
                let stale: Vec<String> = {
                    let map = self.map.lock();
                    entries
                        .into_iter()
                        .filter(|entry| {
                            entry
                                .strip_prefix(&prefix)
                                .and_then(|suffix| RevisionId::parse(suffix).ok())
                                .is_some_and(|rev| !map.contains(&rev))
                        })
                        .collect()
                };

                if stale.is_empty() {
                    job.succeed(0);
                    return Ok(());
                }
                job.wait(&PruneStep::Done, stale.len() - 1);
                for entry in stale {
                    job.call(PruneStep::Remove(entry));
                }
            }

            PruneStep::Remove(entry) => {
                match self.store.remove(&entry).await {
                    Ok(()) => {
                        self.removed.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(RevisionError::storage("cannot remove entry")(e)),
                }
                job.call(PruneStep::Done);
            }

            PruneStep::Done => {
                let removed = self.removed.load(Ordering::Acquire);
                info!(id = %self.id, removed, "pruned revisions");
                job.succeed(removed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::storage::{BackingStore, MemoryStore, YieldingStore};

    fn setup() -> (MemoryStore, MetadataEngine) {
        let store = MemoryStore::new();
        let engine = MetadataEngine::new(Arc::new(store.clone()));
        (store, engine)
    }

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn rev(s: &str) -> RevisionId {
        RevisionId::parse(s).unwrap()
    }

    fn reason(err: RevisionError) -> (u16, String) {
        (err.status(), err.reason())
    }

    async fn stored_map(store: &MemoryStore, id: &str) -> MetadataMap {
        let bytes = store.get(&format!("{}{}", id, METADATA_SUFFIX)).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Store a metadata side-car as is, with one blob per revision.
    async fn seed(store: &MemoryStore, id: &str, map: Value) -> MetadataMap {
        let map: MetadataMap = serde_json::from_value(map).unwrap();
        let entry = format!("{}{}", id, METADATA_SUFFIX);
        store.upsert(&entry, serde_json::to_vec(&map).unwrap()).await.unwrap();
        for rev in map.keys() {
            let blob = serde_json::to_vec(&json!({"rev": rev.to_string()})).unwrap();
            store.put(&format!("{}.{}", id, rev), blob).await.unwrap();
        }
        map
    }

    fn entry(date: i64, revisions: &[&str], deleted: bool) -> Value {
        json!({
            "creation_date": date,
            "last_modified": date,
            "revisions": revisions,
            "conflict": false,
            "deleted": deleted
        })
    }

    /// Every current entry carries one history hash per generation.
    fn assert_history_lengths(map: &MetadataMap) {
        for rev in map.keys() {
            let entry = map.get(&rev).unwrap();
            assert_eq!(entry.revisions.len() as u64, rev.generation(), "{}", rev);
            assert_eq!(entry.revisions[0], rev.hash());
        }
    }

    #[tokio::test]
    async fn test_bootstrap_and_update() {
        let (store, engine) = setup();

        let first = engine
            .put(doc(json!({"_id": "d", "title": "A"})), &WriteOptions::new())
            .await
            .unwrap();
        assert!(first.ok);
        assert!(!first.conflict);
        assert_eq!(first.rev.generation(), 1);
        assert_eq!(first.rev.hash(), hash_parts(&[r#"{"title":"A"}"#]));

        let second = engine
            .put(
                doc(json!({"_id": "d", "_rev": first.rev.to_string(), "title": "B"})),
                &WriteOptions::new().revs(true).revs_info(true),
            )
            .await
            .unwrap();
        assert!(!second.conflict);
        assert_eq!(second.rev.generation(), 2);
        assert_eq!(
            second.revisions.unwrap().ids,
            vec![second.rev.hash().to_string(), first.rev.hash().to_string()]
        );
        assert_eq!(second.revs_info.unwrap().len(), 1);

        let map = stored_map(&store, "d").await;
        assert_eq!(map.keys(), vec![second.rev.clone()]);
        assert_history_lengths(&map);

        // superseded blobs stay until a conflict is solved or the id is pruned
        assert!(store.contains(&format!("d.{}", first.rev)));

        let got = engine.get("d", &GetOptions::new()).await.unwrap();
        assert_eq!(got.get("title"), Some(&json!("B")));
        assert_eq!(got.creation_date, map.get(&second.rev).unwrap().creation_date);
        assert!(got.conflict_object.is_none());
    }

    #[tokio::test]
    async fn test_post_generates_id() {
        let (_store, engine) = setup();
        let written = engine
            .post(doc(json!({"n": 1})), &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(written.id.as_str().len(), 26);

        let err = engine
            .put(doc(json!({"n": 1})), &WriteOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_every_known_revision() {
        let (store, engine) = setup();

        seed(
            &store,
            "d",
            json!({"1-aaa": entry(10, &["aaa"], false), "1-bbb": entry(20, &["bbb"], false)}),
        )
        .await;

        let written = engine
            .put(
                doc(json!({"_id": "d", "_rev": "1-aaa", "v": 2})),
                &WriteOptions::new(),
            )
            .await
            .unwrap();
        assert!(written.ok);
        assert!(written.conflict);

        let conflicts = written.conflicts.unwrap();
        assert_eq!(conflicts.total_rows, 1);
        let row = &conflicts.rows[0];
        assert_eq!(row.id.as_str(), "d");
        assert_eq!(row.key, vec![rev("1-aaa"), rev("1-bbb"), written.rev.clone()]);
        assert_eq!(row.revision(), &written.rev);

        // the write still committed
        let map = stored_map(&store, "d").await;
        assert_eq!(map.keys(), vec![rev("1-bbb"), written.rev.clone()]);
        assert!(map.get(&written.rev).unwrap().conflict);
        assert_eq!(map.get(&written.rev).unwrap().creation_date, 10);
        assert_history_lengths(&map);
    }

    #[tokio::test]
    async fn test_put_without_previous_on_existing_document_conflicts() {
        let (store, engine) = setup();

        let first = engine
            .put(doc(json!({"_id": "d", "v": 1})), &WriteOptions::new())
            .await
            .unwrap();
        let second = engine
            .put(doc(json!({"_id": "d", "v": 2})), &WriteOptions::new())
            .await
            .unwrap();

        assert!(second.conflict);
        assert_eq!(second.rev.generation(), 1);
        let map = stored_map(&store, "d").await;
        assert_eq!(map.len(), 2);
        assert!(map.contains(&first.rev));
    }

    #[tokio::test]
    async fn test_get_errors_and_conflicts() {
        let (store, engine) = setup();

        let err = engine.get("d", &GetOptions::new()).await.unwrap_err();
        assert_eq!(reason(err), (404, "document not found".to_string()));

        let map = seed(
            &store,
            "d",
            json!({
                "1-aaa": entry(10, &["aaa"], false),
                "1-bbb": entry(20, &["bbb"], false),
                "2-ddd": entry(5, &["ddd", "ccc"], true)
            }),
        )
        .await;

        let err = engine
            .get("d", &GetOptions::new().rev("1-zzz"))
            .await
            .unwrap_err();
        assert_eq!(reason(err), (404, "document revision does not exist".to_string()));

        let err = engine
            .get("d", &GetOptions::new().rev("2-ddd"))
            .await
            .unwrap_err();
        assert_eq!(reason(err), (404, "document has been removed".to_string()));

        let got = engine
            .get("d", &GetOptions::new().conflicts(true).revs(true).revs_info(true))
            .await
            .unwrap();
        assert_eq!(got.document.rev, rev("1-bbb"));
        assert_eq!(got.get("rev"), Some(&json!("1-bbb")));
        assert_eq!(got.last_modified, 20);
        assert_eq!(got.document.conflicts, Some(vec![rev("1-aaa"), rev("2-ddd")]));
        assert_eq!(got.document.revisions.as_ref().unwrap().start, 1);
        assert_eq!(got.document.revs_info.as_ref().unwrap().len(), 3);

        let object = got.conflict_object.unwrap();
        assert_eq!(object.rows[0].key, map.keys());

        let value = serde_json::to_value(
            &engine.get("d", &GetOptions::new()).await.unwrap(),
        )
        .unwrap();
        assert_eq!(value["_id"], json!("d"));
        assert_eq!(value["_rev"], json!("1-bbb"));
        assert_eq!(value["_creation_date"], json!(20));
        assert!(value.get("_conflict_object").is_none());
    }

    #[tokio::test]
    async fn test_solve_conflict() {
        let (store, engine) = setup();

        let first = engine
            .put(doc(json!({"_id": "d", "v": 1})), &WriteOptions::new())
            .await
            .unwrap();
        let second = engine
            .put(doc(json!({"_id": "d", "v": 2})), &WriteOptions::new())
            .await
            .unwrap();
        let row = second.conflicts.unwrap().rows.remove(0);
        assert_eq!(row.key.len(), 2);

        let solved = row
            .solve(
                Some(json!({"v": 3}).as_object().unwrap().clone()),
                &WriteOptions::new().revs(true),
            )
            .await
            .unwrap();
        assert!(!solved.conflict);
        assert_eq!(solved.rev.generation(), 2);

        let map = stored_map(&store, "d").await;
        assert_eq!(map.keys(), vec![solved.rev.clone()]);
        assert_history_lengths(&map);
        assert_eq!(
            solved.revisions.unwrap().ids,
            vec![solved.rev.hash().to_string(), second.rev.hash().to_string()]
        );

        // blobs of every solved revision are gone
        assert!(!store.contains(&format!("d.{}", first.rev)));
        assert!(!store.contains(&format!("d.{}", second.rev)));
        let got = engine.get("d", &GetOptions::new()).await.unwrap();
        assert_eq!(got.get("v"), Some(&json!(3)));

        let err = row.solve(None, &WriteOptions::new()).await.unwrap_err();
        assert_eq!(
            reason(err),
            (404, "conflicting revision is no longer present".to_string())
        );
    }

    #[tokio::test]
    async fn test_solve_by_deletion() {
        let (store, engine) = setup();

        engine
            .put(doc(json!({"_id": "d", "v": 1})), &WriteOptions::new())
            .await
            .unwrap();
        let second = engine
            .put(doc(json!({"_id": "d", "v": 2})), &WriteOptions::new())
            .await
            .unwrap();
        let conflicts = second.conflicts.unwrap();
        let row = &conflicts.rows[0];

        let solved = row.solve(None, &WriteOptions::new()).await.unwrap();
        assert!(!store.contains(&format!("d.{}", solved.rev)));
        let map = stored_map(&store, "d").await;
        assert!(map.get(&solved.rev).unwrap().deleted);

        let err = engine.get("d", &GetOptions::new()).await.unwrap_err();
        assert_eq!(reason(err), (404, "document has been removed".to_string()));
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, engine) = setup();

        let err = engine
            .remove("d", Some(LAST_REVISION), &WriteOptions::new())
            .await
            .unwrap_err();
        assert_eq!(reason(err), (404, "document not found".to_string()));

        let first = engine
            .put(doc(json!({"_id": "d", "v": 1})), &WriteOptions::new())
            .await
            .unwrap();
        let blobs = store.len();
        let removed = engine
            .remove("d", Some(LAST_REVISION), &WriteOptions::new())
            .await
            .unwrap();
        assert!(!removed.conflict);
        assert_eq!(removed.rev.generation(), 2);
        assert_eq!(store.len(), blobs);

        let map = stored_map(&store, "d").await;
        assert_eq!(map.keys(), vec![removed.rev.clone()]);
        assert!(map.get(&removed.rev).unwrap().deleted);

        let err = engine
            .get("d", &GetOptions::new().rev(first.rev.to_string()))
            .await
            .unwrap_err();
        assert_eq!(reason(err), (404, "document revision does not exist".to_string()));

        let err = engine
            .remove("d", Some("bad"), &WriteOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RevisionError::WrongRevisionFormat { .. }));
    }

    #[tokio::test]
    async fn test_remove_stale_revision_conflicts() {
        let (_store, engine) = setup();

        let first = engine
            .put(doc(json!({"_id": "d", "v": 1})), &WriteOptions::new())
            .await
            .unwrap();
        engine
            .put(
                doc(json!({"_id": "d", "_rev": first.rev.to_string(), "v": 2})),
                &WriteOptions::new(),
            )
            .await
            .unwrap();

        let removed = engine
            .remove("d", Some(first.rev.to_string().as_str()), &WriteOptions::new())
            .await
            .unwrap();
        assert!(removed.conflict);
    }

    #[tokio::test]
    async fn test_unknown_previous_keeps_history_length() {
        let (store, engine) = setup();

        engine
            .put(doc(json!({"_id": "d", "v": 1})), &WriteOptions::new())
            .await
            .unwrap();
        let written = engine
            .put(
                doc(json!({"_id": "d", "_rev": "5-zzz", "v": 2})),
                &WriteOptions::new().revs(true),
            )
            .await
            .unwrap();

        assert!(written.conflict);
        assert_eq!(written.rev.generation(), 2);
        let history = written.revisions.unwrap();
        assert_eq!(history.start, 2);
        assert_eq!(history.ids, vec![written.rev.hash(), "zzz"]);

        let map = stored_map(&store, "d").await;
        assert_eq!(map.len(), 2);
        assert_history_lengths(&map);
    }

    #[tokio::test]
    async fn test_concurrent_writes_on_one_revision_report_conflict() {
        let store = YieldingStore::default();
        let engine = MetadataEngine::new(Arc::new(store.clone()));

        let base = engine
            .put(doc(json!({"_id": "d", "v": 0})), &WriteOptions::new())
            .await
            .unwrap();
        let rev = base.rev.to_string();
        let opts = WriteOptions::new();
        let (a, b) = tokio::join!(
            engine.put(doc(json!({"_id": "d", "_rev": rev, "v": "a"})), &opts),
            engine.put(doc(json!({"_id": "d", "_rev": rev, "v": "b"})), &opts),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // whichever lands second sees the first and reports it
        assert!(a.conflict ^ b.conflict);
        let map = stored_map(&store.0, "d").await;
        assert_eq!(map.len(), 2);
        assert!(map.contains(&a.rev));
        assert!(map.contains(&b.rev));
        assert_history_lengths(&map);

        for written in [a, b] {
            let got = engine
                .get("d", &GetOptions::new().rev(written.rev.to_string()))
                .await
                .unwrap();
            assert_eq!(got.document.rev, written.rev);
        }
    }

    #[tokio::test]
    async fn test_all_docs() {
        let (store, engine) = setup();

        let empty = engine.all_docs(&AllDocsOptions::new()).await.unwrap();
        assert_eq!(empty.total_rows, 0);

        engine
            .put(doc(json!({"_id": "b", "v": "b"})), &WriteOptions::new())
            .await
            .unwrap();
        engine
            .put(doc(json!({"_id": "a", "v": "a1"})), &WriteOptions::new())
            .await
            .unwrap();
        engine
            .put(doc(json!({"_id": "a", "v": "a2"})), &WriteOptions::new())
            .await
            .unwrap();
        engine
            .put(doc(json!({"_id": "c", "v": "c"})), &WriteOptions::new())
            .await
            .unwrap();
        engine
            .remove("c", Some(LAST_REVISION), &WriteOptions::new())
            .await
            .unwrap();
        store.put("noise.txt", vec![]).await.unwrap();

        let listed = engine.all_docs(&AllDocsOptions::new()).await.unwrap();
        let ids: Vec<&str> = listed.rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(listed.rows.iter().all(|row| row.doc.is_none()));
        assert!(listed.conflicts.is_none());

        let full = engine
            .all_docs(&AllDocsOptions::new().include_docs(true).conflicts(true))
            .await
            .unwrap();
        assert_eq!(full.total_rows, 2);
        assert_eq!(full.rows[1].doc.as_ref().unwrap()["v"], json!("b"));
        let conflicts = full.conflicts.unwrap();
        assert_eq!(conflicts.total_rows, 1);
        assert_eq!(conflicts.rows[0].id.as_str(), "a");
        assert_eq!(conflicts.rows[0].key.len(), 2);
    }

    #[tokio::test]
    async fn test_prune() {
        let (store, engine) = setup();

        let first = engine
            .put(doc(json!({"_id": "d", "v": 1})), &WriteOptions::new())
            .await
            .unwrap();
        let second = engine
            .put(
                doc(json!({"_id": "d", "_rev": first.rev.to_string(), "v": 2})),
                &WriteOptions::new(),
            )
            .await
            .unwrap();
        store.put("dd.1-other", vec![]).await.unwrap();

        assert_eq!(engine.prune("d").await.unwrap(), 1);
        assert!(!store.contains(&format!("d.{}", first.rev)));
        assert!(store.contains(&format!("d.{}", second.rev)));
        assert!(store.contains("d.metadata"));
        assert!(store.contains("dd.1-other"));
        assert_eq!(engine.prune("d").await.unwrap(), 0);

        let err = engine.prune("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
