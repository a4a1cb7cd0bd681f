//! Git-backed flat blob store.
//!
//! Every entry is a file at the root of the `main` branch's tree and every
//! mutation is one commit, so the full write history of the backing store
//! is preserved in `.git/`. libgit2 calls are blocking; they run on tokio's
//! blocking pool while the repository handle is held behind a mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::{FileMode, ObjectType, Oid, Repository};
use parking_lot::Mutex;
use tracing::debug;

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::{validate_entry_id, GitSignature};
use crate::storage::BackingStore;

const MAIN_REF: &str = "refs/heads/main";

/// The git-backed store.
///
/// Clone this to share across tasks - it uses Arc internally.
#[derive(Clone)]
pub struct GitStore {
    inner: Arc<GitStoreInner>,
}

struct GitStoreInner {
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: GitSignature,
}

impl GitStore {
    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_signature(path, GitSignature::default())
    }

    /// Initialize a new repository with an empty first commit on `main`.
    pub fn init(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::init_with_signature(path, GitSignature::default())
    }

    /// Open or initialize a repository.
    pub fn open_or_init(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_or_init_with_signature(path, GitSignature::default())
    }

    pub fn open_with_signature(path: impl AsRef<Path>, signature: GitSignature) -> StoreResult<Self> {
        let path = path.as_ref();
        let repo =
            Repository::open(path).map_err(|_| StoreError::NotInitialized(path.to_path_buf()))?;
        Ok(Self::from_parts(repo, path, signature))
    }

    pub fn init_with_signature(path: impl AsRef<Path>, signature: GitSignature) -> StoreResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init(path)?;

        {
            let tree_id = repo.treebuilder(None)?.write()?;
            let tree = repo.find_tree(tree_id)?;
            let sig = signature.to_git2_signature()?;
            repo.commit(Some(MAIN_REF), &sig, &sig, "initialize revstore", &tree, &[])?;
            repo.set_head(MAIN_REF)?;
        }

        Ok(Self::from_parts(repo, path, signature))
    }

    pub fn open_or_init_with_signature(
        path: impl AsRef<Path>,
        signature: GitSignature,
    ) -> StoreResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open_with_signature(path, signature)
        } else {
            Self::init_with_signature(path, signature)
        }
    }

    fn from_parts(repo: Repository, path: &Path, signature: GitSignature) -> Self {
        Self {
            inner: Arc::new(GitStoreInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature,
            }),
        }
    }

    /// Get the repository path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Get statistics about the store.
    pub async fn stats(&self) -> StoreResult<StoreStats> {
        self.blocking(|inner| {
            let repo = inner.repo.lock();
            let head = repo.find_reference(MAIN_REF)?.peel_to_commit()?;
            let entries = head.tree()?.len();
            let mut walk = repo.revwalk()?;
            walk.push(head.id())?;
            Ok(StoreStats {
                entries,
                commits: walk.count(),
            })
        })
        .await
    }

    /// Run libgit2 work on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&GitStoreInner) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Internal(format!("git worker failed: {}", e)))?
    }
}

impl GitStoreInner {
    /// Look up the blob id stored under `id` at the tip of `main`.
    fn lookup(repo: &Repository, id: &str) -> StoreResult<Option<Oid>> {
        let tree = repo.find_reference(MAIN_REF)?.peel_to_tree()?;
        let found = match tree.get_name(id) {
            Some(entry) => {
                if entry.kind() != Some(ObjectType::Blob) {
                    return Err(StoreError::UnexpectedEntryType {
                        id: id.to_string(),
                        expected: "blob (file)".to_string(),
                        found: format!("{:?}", entry.kind()),
                    });
                }
                Some(entry.id())
            }
            None => None,
        };
        Ok(found)
    }

    /// Rewrite the root tree with `edit` and commit the result on `main`.
    fn commit_edit<F>(&self, message: &str, edit: F) -> StoreResult<()>
    where
        F: FnOnce(&Repository, &mut git2::TreeBuilder<'_>) -> StoreResult<()>,
    {
        let repo = self.repo.lock();
        let parent = repo.find_reference(MAIN_REF)?.peel_to_commit()?;
        let tree = parent.tree()?;

        let mut builder = repo.treebuilder(Some(&tree))?;
        edit(&*repo, &mut builder)?;
        let new_tree_id = builder.write()?;
        if new_tree_id == tree.id() {
            return Ok(());
        }

        let new_tree = repo.find_tree(new_tree_id)?;
        let sig = self.signature.to_git2_signature()?;
        let commit_id = repo.commit(Some(MAIN_REF), &sig, &sig, message, &new_tree, &[&parent])?;
        debug!(commit = %commit_id, summary = message, "git store commit");
        Ok(())
    }
}

#[async_trait]
impl BackingStore for GitStore {
    async fn get(&self, id: &str) -> StoreResult<Vec<u8>> {
        let id = id.to_string();
        self.blocking(move |inner| {
            let repo = inner.repo.lock();
            let oid = GitStoreInner::lookup(&repo, &id)?.ok_or_else(|| StoreError::not_found(&id))?;
            let blob = repo.find_blob(oid)?;
            Ok(blob.content().to_vec())
        })
        .await
    }

    async fn put(&self, id: &str, blob: Vec<u8>) -> StoreResult<()> {
        validate_entry_id(id)?;
        let id = id.to_string();
        self.blocking(move |inner| {
            inner.commit_edit(&format!("put {}", id), |repo, builder| {
                if GitStoreInner::lookup(repo, &id)?.is_some() {
                    return Err(StoreError::already_exists(&id));
                }
                let oid = repo.blob(&blob)?;
                builder.insert(id.as_str(), oid, FileMode::Blob.into())?;
                Ok(())
            })
        })
        .await
    }

    async fn upsert(&self, id: &str, blob: Vec<u8>) -> StoreResult<()> {
        validate_entry_id(id)?;
        let id = id.to_string();
        self.blocking(move |inner| {
            inner.commit_edit(&format!("upsert {}", id), |repo, builder| {
                let oid = repo.blob(&blob)?;
                builder.insert(id.as_str(), oid, FileMode::Blob.into())?;
                Ok(())
            })
        })
        .await
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.blocking(move |inner| {
            inner.commit_edit(&format!("remove {}", id), |repo, builder| {
                if GitStoreInner::lookup(repo, &id)?.is_none() {
                    return Err(StoreError::not_found(&id));
                }
                builder.remove(id.as_str())?;
                Ok(())
            })
        })
        .await
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        self.blocking(|inner| {
            let repo = inner.repo.lock();
            let tree = repo.find_reference(MAIN_REF)?.peel_to_tree()?;
            let mut ids: Vec<String> = tree
                .iter()
                .filter(|entry| entry.kind() == Some(ObjectType::Blob))
                .filter_map(|entry| entry.name().map(str::to_string))
                .collect();
            ids.sort();
            Ok(ids)
        })
        .await
    }
}

impl std::fmt::Debug for GitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

/// Statistics about the git store.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub entries: usize,
    pub commits: usize,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store Statistics:")?;
        writeln!(f, "  Entries: {}", self.entries)?;
        writeln!(f, "  Commits: {}", self.commits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitStore) {
        let dir = TempDir::new().unwrap();
        let store = GitStore::init(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_init_and_open() {
        let dir = TempDir::new().unwrap();

        let store = GitStore::init(dir.path()).unwrap();
        store.put("a", b"1".to_vec()).await.unwrap();
        drop(store);

        let store = GitStore::open(dir.path()).unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"1".to_vec());
    }

    #[tokio::test]
    async fn test_open_or_init() {
        let dir = TempDir::new().unwrap();

        let first = GitStore::open_or_init(dir.path()).unwrap();
        first.put("x", vec![7]).await.unwrap();
        drop(first);

        let second = GitStore::open_or_init(dir.path()).unwrap();
        assert_eq!(second.list().await.unwrap(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_open_missing_fails() {
        let dir = TempDir::new().unwrap();
        let result = GitStore::open(dir.path().join("nothing"));
        assert!(matches!(result, Err(StoreError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_blob_crud() {
        let (_dir, store) = setup();

        store.put("doc.1-abc", b"{\"a\":1}".to_vec()).await.unwrap();
        assert_eq!(store.get("doc.1-abc").await.unwrap(), b"{\"a\":1}".to_vec());

        store.upsert("doc.metadata", b"{}".to_vec()).await.unwrap();
        store.upsert("doc.metadata", b"{\"x\":{}}".to_vec()).await.unwrap();
        assert_eq!(store.get("doc.metadata").await.unwrap(), b"{\"x\":{}}".to_vec());

        store.remove("doc.1-abc").await.unwrap();
        assert!(store.get("doc.1-abc").await.unwrap_err().is_not_found());
        assert_eq!(store.list().await.unwrap(), vec!["doc.metadata"]);
    }

    #[tokio::test]
    async fn test_put_duplicate_fails() {
        let (_dir, store) = setup();
        store.put("a", vec![1]).await.unwrap();

        let err = store.put("a", vec![1]).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_remove_missing_fails() {
        let (_dir, store) = setup();
        let err = store.remove("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_every_mutation_is_a_commit() {
        let (_dir, store) = setup();
        assert_eq!(store.stats().await.unwrap().commits, 1);

        store.put("a", vec![1]).await.unwrap();
        store.upsert("b", vec![2]).await.unwrap();
        store.remove("a").await.unwrap();

        // identical content leaves the tree unchanged, so no commit
        store.upsert("b", vec![2]).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.commits, 4);
        assert_eq!(stats.entries, 1);
    }
}
