//! Tree-based revision engine.
//!
//! Each operation is a [`Flow`] over the backing store. Writes always land
//! the content blob before the tree, so a failure in between leaves at worst
//! an orphan blob that [`TreeEngine::prune`] reclaims.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument};

use crate::job::{self, Flow, Job};
use crate::revision::blob::{content_entry, drop_entry, load_content, load_side_car, put_once};
use crate::revision::lock::DocLocks;
use crate::revision::{
    digest, next_generation, next_revision, parse_previous, Document, GetOptions, RevisedDocument, RevisionError,
    RevisionHistory, RevisionId, RevisionInfo, RevisionResult, RevisionStatus, WriteResponse,
};
use crate::storage::{DocId, InvalidNameError, SharedStore};
use crate::tree::attachment::{
    entry_suffix, read_stubs, validate_name, write_stubs, Attachment, AttachmentStub,
};
use crate::tree::node::{history, revs_info, Node, RevisionTree};

/// Suffix of the tree side-car entry.
pub const TREE_SUFFIX: &str = ".revision_tree.json";

/// Revision engine keeping one revision tree per document.
///
/// Clone this to share across tasks - the store handle is reference counted.
/// Clones also share the per-document write locks, so writes to one id
/// through any clone run one after the other.
#[derive(Clone)]
pub struct TreeEngine {
    store: SharedStore,
    keep_revision_history: bool,
    locks: DocLocks,
}

impl TreeEngine {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            keep_revision_history: false,
            locks: DocLocks::new(),
        }
    }

    /// Keep the content blobs of superseded revisions instead of deleting
    /// them once a child is written.
    pub fn keep_revision_history(mut self, value: bool) -> Self {
        self.keep_revision_history = value;
        self
    }

    /// Write a document, generating its id when `_id` is absent.
    pub async fn post(&self, mut doc: Document) -> RevisionResult<WriteResponse> {
        if doc.id.is_none() {
            doc.id = Some(DocId::generate().into_string());
        }
        self.put(doc).await
    }

    /// Write a new revision of a document.
    ///
    /// With `_revisions` the given branch is imported as is; otherwise the
    /// new revision descends from `_rev`, or starts a new root branch.
    #[instrument(skip_all, fields(id = ?doc.id))]
    pub async fn put(&self, doc: Document) -> RevisionResult<WriteResponse> {
        let id = required_id(doc.id.as_deref())?;
        let previous = parse_previous(doc.rev.as_deref())?;
        if let Some(history) = &doc.revisions {
            history.validate()?;
        }

        let body = doc.payload();
        self.write(
            id,
            previous,
            Change::Document {
                body,
                import: doc.revisions,
            },
        )
        .await
    }

    /// Read a revision: the winner, or `options.rev` when given.
    pub async fn get(&self, id: &str, options: &GetOptions) -> RevisionResult<RevisedDocument> {
        let rev = parse_previous(options.rev.as_deref())?;
        let flow = Get {
            store: self.store.clone(),
            id: DocId::new(id)?,
            rev,
            options: options.clone(),
            tree: Mutex::new(RevisionTree::new()),
        };
        job::run(&flow, GetStep::LoadTree).await
    }

    /// Mark the leaf named by `_rev` as deleted.
    #[instrument(skip_all, fields(id = ?doc.id))]
    pub async fn remove(&self, doc: Document) -> RevisionResult<WriteResponse> {
        let id = required_id(doc.id.as_deref())?;
        let previous = parse_previous(doc.rev.as_deref())?;
        if previous.is_none() {
            return Err(RevisionError::conflict("no document revision was provided"));
        }

        self.write(id, previous, Change::Delete).await
    }

    /// Store `data` as attachment `name` in a new revision descending from
    /// `rev`. Without `rev` the new revision starts a new branch with an
    /// empty body.
    pub async fn put_attachment(
        &self,
        id: &str,
        rev: Option<&str>,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> RevisionResult<WriteResponse> {
        let id = DocId::new(id)?;
        let previous = parse_previous(rev)?;
        validate_name(name)?;

        self.write(
            id,
            previous,
            Change::PutAttachment {
                name: name.to_string(),
                content_type: content_type.to_string(),
                data,
            },
        )
        .await
    }

    /// Drop attachment `name` in a new revision descending from `rev`.
    pub async fn remove_attachment(
        &self,
        id: &str,
        rev: &str,
        name: &str,
    ) -> RevisionResult<WriteResponse> {
        let id = DocId::new(id)?;
        let previous = parse_previous(Some(rev))?;
        validate_name(name)?;

        self.write(
            id,
            previous,
            Change::RemoveAttachment {
                name: name.to_string(),
            },
        )
        .await
    }

    /// Read attachment `name` as seen from the winner or `options.rev`.
    pub async fn get_attachment(
        &self,
        id: &str,
        options: &GetOptions,
        name: &str,
    ) -> RevisionResult<Attachment> {
        let rev = parse_previous(options.rev.as_deref())?;
        validate_name(name)?;

        let flow = GetAttachment {
            store: self.store.clone(),
            id: DocId::new(id)?,
            rev,
            name: name.to_string(),
            tree: Mutex::new(RevisionTree::new()),
        };
        job::run(&flow, GetAttachmentStep::LoadTree).await
    }

    /// Remove blobs of `id` that no tree node accounts for. Returns the
    /// number of entries removed.
    pub async fn prune(&self, id: &str) -> RevisionResult<usize> {
        let flow = Prune {
            store: self.store.clone(),
            keep_revision_history: self.keep_revision_history,
            id: DocId::new(id)?,
            tree: Mutex::new(RevisionTree::new()),
            removed: AtomicUsize::new(0),
        };
        let _guard = self.locks.lock(&flow.id).await;
        job::run(&flow, PruneStep::LoadTree).await
    }

    /// Listing is not supported: the tree engine only knows documents by id.
    pub async fn all_docs(&self) -> RevisionResult<Vec<DocId>> {
        Err(RevisionError::MethodNotAllowed { method: "all_docs" })
    }

    /// Run a write flow while holding the document's lock.
    async fn write(
        &self,
        id: DocId,
        previous: Option<RevisionId>,
        change: Change,
    ) -> RevisionResult<WriteResponse> {
        let flow = Write {
            store: self.store.clone(),
            keep_revision_history: self.keep_revision_history,
            generation: next_generation(previous.as_ref())?,
            id,
            previous,
            change,
            state: Mutex::new(WriteState::default()),
        };
        let _guard = self.locks.lock(&flow.id).await;
        job::run(&flow, WriteStep::LoadTree).await
    }
}

impl std::fmt::Debug for TreeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeEngine")
            .field("keep_revision_history", &self.keep_revision_history)
            .finish_non_exhaustive()
    }
}

fn required_id(id: Option<&str>) -> RevisionResult<DocId> {
    let id = id.ok_or(InvalidNameError::Empty)?;
    Ok(DocId::new(id)?)
}

async fn load_tree(store: &SharedStore, id: &DocId) -> RevisionResult<Option<RevisionTree>> {
    load_side_car(store, &id.entry(TREE_SUFFIX), "cannot get document revision tree").await
}

/// Path to the revision a read should return.
fn select<'a>(tree: &'a RevisionTree, rev: Option<&RevisionId>) -> RevisionResult<Vec<&'a Node>> {
    let path = match rev {
        Some(rev) => tree
            .path(rev)
            .ok_or_else(|| RevisionError::not_found("revision not found"))?,
        None => tree
            .winner()
            .ok_or_else(|| RevisionError::not_found("document is deleted"))?,
    };
    match path.last().map(|node| node.status) {
        Some(RevisionStatus::Deleted) => Err(RevisionError::not_found("document has been removed")),
        Some(RevisionStatus::Missing) => Err(RevisionError::not_found("revision content is missing")),
        _ => Ok(path),
    }
}

enum Change {
    Document {
        body: Map<String, Value>,
        import: Option<RevisionHistory>,
    },
    Delete,
    PutAttachment {
        name: String,
        content_type: String,
        data: Vec<u8>,
    },
    RemoveAttachment {
        name: String,
    },
}

#[derive(Default)]
struct WriteState {
    tree: RevisionTree,
    /// Body of the previous revision, for attachment edits.
    previous_body: Map<String, Value>,
    /// Body of the new revision.
    body: Map<String, Value>,
    superseded: Vec<RevisionId>,
    /// The revision was already an internal node, its blob is not rewritten.
    skip_blob: bool,
}

struct Write {
    store: SharedStore,
    keep_revision_history: bool,
    /// Generation of the revision a non-import write creates.
    generation: u64,
    id: DocId,
    previous: Option<RevisionId>,
    change: Change,
    state: Mutex<WriteState>,
}

#[derive(Debug)]
enum WriteStep {
    LoadTree,
    LoadPrevious(RevisionId),
    Graft,
    WriteBlob(RevisionId),
    WriteAttachment(RevisionId),
    WriteTree(RevisionId),
    DropSuperseded(RevisionId),
}

impl Write {
    /// Check the loaded tree allows this change before anything is written.
    fn check(&self, tree: &RevisionTree) -> RevisionResult<()> {
        match (&self.change, &self.previous) {
            (Change::Delete, Some(prev)) => {
                let node = tree
                    .find(prev)
                    .ok_or_else(|| RevisionError::not_found("unable to remove an inexistent document"))?;
                if node.status == RevisionStatus::Deleted {
                    return Err(RevisionError::not_found("document has been removed"));
                }
                if !node.is_leaf() {
                    return Err(RevisionError::conflict("trying to remove non-latest revision"));
                }
                Ok(())
            }
            (Change::PutAttachment { .. } | Change::RemoveAttachment { .. }, Some(prev)) => {
                select(tree, Some(prev)).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Body of the new revision.
    fn new_body(&self, previous_body: Map<String, Value>, generation: u64) -> RevisionResult<Map<String, Value>> {
        let entry = || match &self.previous {
            Some(prev) => content_entry(&self.id, prev),
            None => self.id.to_string(),
        };

        match &self.change {
            Change::Document { body, .. } => Ok(body.clone()),
            Change::Delete => Ok(Map::new()),
            Change::PutAttachment {
                name,
                content_type,
                data,
            } => {
                let mut body = previous_body;
                let mut stubs = read_stubs(&body, &entry())?;
                stubs.insert(
                    name.clone(),
                    AttachmentStub {
                        content_type: content_type.clone(),
                        digest: digest(data),
                        length: data.len(),
                        revpos: generation,
                    },
                );
                write_stubs(&mut body, &stubs)?;
                Ok(body)
            }
            Change::RemoveAttachment { name } => {
                let mut body = previous_body;
                let mut stubs = read_stubs(&body, &entry())?;
                if stubs.remove(name).is_none() {
                    return Err(RevisionError::not_found(
                        "unable to remove an inexistent attachment",
                    ));
                }
                write_stubs(&mut body, &stubs)?;
                Ok(body)
            }
        }
    }

    /// New revision id and the branch, oldest first, that leads to it.
    fn branch(
        &self,
        tree: &RevisionTree,
        body: &Map<String, Value>,
    ) -> RevisionResult<(RevisionId, Vec<RevisionInfo>)> {
        if let Change::Document {
            import: Some(imported),
            ..
        } = &self.change
        {
            let list = imported.to_list();
            let branch: Vec<RevisionInfo> = list
                .iter()
                .rev()
                .map(|rev| RevisionInfo {
                    rev: rev.clone(),
                    status: RevisionStatus::Missing,
                })
                .collect();
            if let Some((head, ancestors)) = branch.split_last() {
                let mut branch = ancestors.to_vec();
                branch.push(RevisionInfo {
                    rev: head.rev.clone(),
                    status: RevisionStatus::Available,
                });
                return Ok((head.rev.clone(), branch));
            }
        }

        let (ancestry, mut branch) = match &self.previous {
            Some(prev) => match tree.path(prev) {
                Some(path) => (
                    history(&path),
                    path.iter()
                        .map(|node| RevisionInfo {
                            rev: node.rev.clone(),
                            status: node.status,
                        })
                        .collect(),
                ),
                // unknown parent: start from a pseudo history holding only it
                None => (
                    RevisionHistory {
                        start: prev.generation(),
                        ids: vec![prev.hash().to_string()],
                    },
                    vec![RevisionInfo {
                        rev: prev.clone(),
                        status: RevisionStatus::Missing,
                    }],
                ),
            },
            None => (RevisionHistory::default(), Vec::new()),
        };

        let deleted = matches!(self.change, Change::Delete);
        let rev = next_revision(
            self.previous.as_ref(),
            &Value::Object(body.clone()),
            &json!({"start": ancestry.start, "ids": ancestry.ids}),
            deleted,
        )?;
        branch.push(RevisionInfo {
            rev: rev.clone(),
            status: if deleted {
                RevisionStatus::Deleted
            } else {
                RevisionStatus::Available
            },
        });
        Ok((rev, branch))
    }
}

#[async_trait]
impl Flow for Write {
    type Step = WriteStep;
    type Output = WriteResponse;
    type Error = RevisionError;
    const NAME: &'static str = "tree.write";

    async fn step(&self, step: WriteStep, job: &Job<Self>) -> RevisionResult<()> {
        match step {
            WriteStep::LoadTree => {
                let tree = load_tree(&self.store, &self.id).await?.unwrap_or_default();
                self.check(&tree)?;
                self.state.lock().tree = tree;

                let edits_attachments = matches!(
                    self.change,
                    Change::PutAttachment { .. } | Change::RemoveAttachment { .. }
                );
                match &self.previous {
                    Some(prev) if edits_attachments => job.call(WriteStep::LoadPrevious(prev.clone())),
                    _ => job.call(WriteStep::Graft),
                }
            }

            WriteStep::LoadPrevious(prev) => {
                let body = load_content(&self.store, &self.id, &prev).await?;
                self.state.lock().previous_body = body;
                job.call(WriteStep::Graft);
            }

            WriteStep::Graft => {
                let (rev, skip_blob) = {
                    let mut state = self.state.lock();
                    let previous_body = std::mem::take(&mut state.previous_body);
                    let body = self.new_body(previous_body, self.generation)?;

                    let (rev, branch) = self.branch(&state.tree, &body)?;
                    let leaves_before: BTreeSet<RevisionId> = state
                        .tree
                        .leaves()
                        .into_iter()
                        .filter(|leaf| leaf.status == RevisionStatus::Available)
                        .map(|leaf| leaf.rev.clone())
                        .collect();

                    if !state.tree.graft(&branch) {
                        debug!(id = %self.id, %rev, "revision already in tree");
                        state.skip_blob = !self.keep_revision_history
                            && state.tree.find(&rev).is_some_and(|node| !node.is_leaf());
                    }

                    if !self.keep_revision_history {
                        let tree = &state.tree;
                        let superseded = leaves_before
                            .into_iter()
                            .filter(|rev| tree.find(rev).is_some_and(|node| !node.is_leaf()))
                            .collect();
                        state.superseded = superseded;
                    }
                    state.body = body;
                    (rev, state.skip_blob)
                };

                match self.change {
                    Change::Delete => job.call(WriteStep::WriteTree(rev)),
                    _ if skip_blob => job.call(WriteStep::WriteTree(rev)),
                    Change::PutAttachment { .. } => {
                        job.wait(&WriteStep::WriteTree(rev.clone()), 1);
                        job.call(WriteStep::WriteBlob(rev.clone()));
                        job.call(WriteStep::WriteAttachment(rev));
                    }
                    _ => job.call(WriteStep::WriteBlob(rev)),
                }
            }

            WriteStep::WriteBlob(rev) => {
                let entry = content_entry(&self.id, &rev);
                let blob = {
                    let state = self.state.lock();
                    serde_json::to_vec(&state.body)
                };
                let blob = blob.map_err(RevisionError::corrupted(entry.as_str()))?;
                put_once(&self.store, &entry, blob).await?;
                job.call(WriteStep::WriteTree(rev));
            }

            WriteStep::WriteAttachment(rev) => {
                if let Change::PutAttachment { name, data, .. } = &self.change {
                    let entry = self.id.entry(&entry_suffix(&rev, name));
                    put_once(&self.store, &entry, data.clone()).await?;
                }
                job.call(WriteStep::WriteTree(rev));
            }

            WriteStep::WriteTree(rev) => {
                let entry = self.id.entry(TREE_SUFFIX);
                let (blob, superseded) = {
                    let state = self.state.lock();
                    (serde_json::to_vec(&state.tree), state.superseded.clone())
                };
                let blob = blob.map_err(RevisionError::corrupted(entry.as_str()))?;
                self.store
                    .upsert(&entry, blob)
                    .await
                    .map_err(RevisionError::storage("cannot store document revision tree"))?;

                info!(id = %self.id, %rev, "revision written");
                job.succeed(WriteResponse::new(self.id.clone(), rev));
                for rev in superseded {
                    job.call(WriteStep::DropSuperseded(rev));
                }
            }

            WriteStep::DropSuperseded(rev) => {
                drop_entry(&self.store, &content_entry(&self.id, &rev)).await;
            }
        }
        Ok(())
    }
}

struct Get {
    store: SharedStore,
    id: DocId,
    rev: Option<RevisionId>,
    options: GetOptions,
    tree: Mutex<RevisionTree>,
}

#[derive(Debug)]
enum GetStep {
    LoadTree,
    LoadDocument(RevisionId),
}

#[async_trait]
impl Flow for Get {
    type Step = GetStep;
    type Output = RevisedDocument;
    type Error = RevisionError;
    const NAME: &'static str = "tree.get";

    async fn step(&self, step: GetStep, job: &Job<Self>) -> RevisionResult<()> {
        match step {
            GetStep::LoadTree => {
                let tree = load_tree(&self.store, &self.id)
                    .await?
                    .ok_or_else(|| RevisionError::not_found("document not found"))?;
                let selected = select(&tree, self.rev.as_ref())?
                    .last()
                    .map(|node| node.rev.clone())
                    .ok_or_else(|| RevisionError::not_found("revision not found"))?;
                *self.tree.lock() = tree;
                job.call(GetStep::LoadDocument(selected));
            }

            GetStep::LoadDocument(rev) => {
                let body = load_content(&self.store, &self.id, &rev).await?;
                let mut doc = RevisedDocument::new(self.id.clone(), rev.clone(), body);
                {
                    let tree = self.tree.lock();
                    let path = tree
                        .path(&rev)
                        .ok_or_else(|| RevisionError::not_found("revision not found"))?;
                    if self.options.revs {
                        doc.revisions = Some(history(&path));
                    }
                    if self.options.revs_info {
                        doc.revs_info = Some(revs_info(&path));
                    }
                    if self.options.conflicts {
                        let conflicts = tree.conflicts(&rev);
                        if !conflicts.is_empty() {
                            doc.conflicts = Some(conflicts);
                        }
                    }
                }
                job.succeed(doc);
            }
        }
        Ok(())
    }
}

struct GetAttachment {
    store: SharedStore,
    id: DocId,
    rev: Option<RevisionId>,
    name: String,
    tree: Mutex<RevisionTree>,
}

#[derive(Debug)]
enum GetAttachmentStep {
    LoadTree,
    LoadStub(RevisionId),
    LoadData(RevisionId, AttachmentStub),
}

#[async_trait]
impl Flow for GetAttachment {
    type Step = GetAttachmentStep;
    type Output = Attachment;
    type Error = RevisionError;
    const NAME: &'static str = "tree.get_attachment";

    async fn step(&self, step: GetAttachmentStep, job: &Job<Self>) -> RevisionResult<()> {
        match step {
            GetAttachmentStep::LoadTree => {
                let tree = load_tree(&self.store, &self.id)
                    .await?
                    .ok_or_else(|| RevisionError::not_found("document not found"))?;
                let selected = select(&tree, self.rev.as_ref())?
                    .last()
                    .map(|node| node.rev.clone())
                    .ok_or_else(|| RevisionError::not_found("revision not found"))?;
                *self.tree.lock() = tree;
                job.call(GetAttachmentStep::LoadStub(selected));
            }

            GetAttachmentStep::LoadStub(rev) => {
                let body = load_content(&self.store, &self.id, &rev).await?;
                let stub = read_stubs(&body, &content_entry(&self.id, &rev))?
                    .remove(&self.name)
                    .ok_or_else(|| RevisionError::not_found("attachment not found"))?;

                // bytes live with the newest revision at or before revpos
                let holder = {
                    let tree = self.tree.lock();
                    tree.path(&rev).and_then(|path| {
                        path.iter()
                            .rev()
                            .find(|node| node.rev.generation() <= stub.revpos)
                            .map(|node| node.rev.clone())
                    })
                };
                let holder =
                    holder.ok_or_else(|| RevisionError::not_found("attachment data is missing"))?;
                job.call(GetAttachmentStep::LoadData(holder, stub));
            }

            GetAttachmentStep::LoadData(holder, stub) => {
                let entry = self.id.entry(&entry_suffix(&holder, &self.name));
                let data = match self.store.get(&entry).await {
                    Ok(data) => data,
                    Err(e) if e.is_not_found() => {
                        return Err(RevisionError::not_found("attachment data is missing"))
                    }
                    Err(e) => return Err(RevisionError::storage("cannot get attachment")(e)),
                };
                job.succeed(Attachment {
                    name: self.name.clone(),
                    stub,
                    data,
                });
            }
        }
        Ok(())
    }
}

struct Prune {
    store: SharedStore,
    keep_revision_history: bool,
    id: DocId,
    tree: Mutex<RevisionTree>,
    removed: AtomicUsize,
}

#[derive(Debug)]
enum PruneStep {
    LoadTree,
    List,
    Remove(String),
    Done,
}

impl Prune {
    /// Whether a backing entry of this document is no longer needed.
    fn is_stale(&self, tree: &RevisionTree, suffix: &str) -> bool {
        let (rev, is_attachment) = match suffix.split_once('@') {
            Some((rev, _)) => (rev, true),
            None => (suffix, false),
        };
        let Ok(rev) = RevisionId::parse(rev) else {
            return false;
        };
        match tree.find(&rev) {
            None => true,
            Some(node) => !is_attachment && !self.keep_revision_history && !node.is_leaf(),
        }
    }
}

#[async_trait]
impl Flow for Prune {
    type Step = PruneStep;
    type Output = usize;
    type Error = RevisionError;
    const NAME: &'static str = "tree.prune";

    async fn step(&self, step: PruneStep, job: &Job<Self>) -> RevisionResult<()> {
        match step {
            PruneStep::LoadTree => {
                let tree = load_tree(&self.store, &self.id)
                    .await?
                    .ok_or_else(|| RevisionError::not_found("document not found"))?;
                *self.tree.lock() = tree;
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
                    let tree = self.tree.lock();
                    entries
                        .into_iter()
                        .filter(|entry| {
                            entry
                                .strip_prefix(&prefix)
                                .is_some_and(|suffix| self.is_stale(&tree, suffix))
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
