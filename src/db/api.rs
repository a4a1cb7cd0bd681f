//! Database API - opens a backing store and hands out revision engines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::metadata::MetadataEngine;
use crate::revision::RevisionError;
use crate::storage::{GitSignature, GitStore, MemoryStore, SharedStore, StoreError};
use crate::tree::TreeEngine;

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("{0}")]
    Revision(#[from] RevisionError),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DatabaseError {
    /// HTTP-style status code.
    pub fn status(&self) -> u16 {
        match self {
            DatabaseError::Storage(e) => e.status(),
            DatabaseError::Revision(e) => e.status(),
            DatabaseError::Json(_) => 400,
            DatabaseError::NotFound(_) => 404,
            DatabaseError::InvalidConfig(_) => 400,
        }
    }

    /// Short human readable reason.
    pub fn reason(&self) -> String {
        match self {
            DatabaseError::Revision(e) => e.reason(),
            other => other.to_string(),
        }
    }
}

/// Where entries are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// A git repository at the configured path, one commit per mutation.
    #[default]
    Git,
    /// A process-local map, gone when the database is dropped.
    Memory,
}

/// Database configuration options.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database directory.
    pub path: PathBuf,
    /// Create if doesn't exist.
    pub create_if_missing: bool,
    pub backend: Backend,
    /// Keep content of superseded revisions in the tree engine.
    pub keep_revision_history: bool,
    /// Author and committer of git commits.
    pub signature: GitSignature,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".revstore"),
            create_if_missing: true,
            backend: Backend::Git,
            keep_revision_history: false,
            signature: GitSignature::default(),
        }
    }
}

impl DatabaseConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Configuration of a throwaway in-memory database.
    pub fn memory() -> Self {
        Self::default().backend(Backend::Memory)
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn keep_revision_history(mut self, value: bool) -> Self {
        self.keep_revision_history = value;
        self
    }

    /// Set the commit signature.
    pub fn signature(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.signature = GitSignature::new(name, email);
        self
    }

    fn validate(&self) -> DatabaseResult<()> {
        if self.backend == Backend::Git && self.path.as_os_str().is_empty() {
            return Err(DatabaseError::InvalidConfig("empty database path".to_string()));
        }
        if self.signature.name.trim().is_empty() || self.signature.email.trim().is_empty() {
            return Err(DatabaseError::InvalidConfig(
                "signature name and email must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The main database handle.
///
/// Both engines share the same store; a document should only ever be written
/// through one of them.
pub struct Database {
    config: DatabaseConfig,
    store: SharedStore,
    git: Option<GitStore>,
    tree: TreeEngine,
    metadata: MetadataEngine,
}

impl Database {
    /// Open or create a git-backed database at the given path.
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        Self::open_with_config(DatabaseConfig::new(path.as_ref()))
    }

    /// Open or create a database with custom configuration.
    pub fn open_with_config(config: DatabaseConfig) -> DatabaseResult<Self> {
        config.validate()?;

        let (store, git): (SharedStore, Option<GitStore>) = match config.backend {
            Backend::Memory => (Arc::new(MemoryStore::new()), None),
            Backend::Git => {
                let signature = config.signature.clone();
                let git = if config.create_if_missing {
                    GitStore::open_or_init_with_signature(&config.path, signature)?
                } else if config.path.exists() {
                    GitStore::open_with_signature(&config.path, signature)?
                } else {
                    return Err(DatabaseError::NotFound(config.path.clone()));
                };
                (Arc::new(git.clone()), Some(git))
            }
        };
        info!(backend = ?config.backend, path = %config.path.display(), "database opened");

        let tree = TreeEngine::new(store.clone()).keep_revision_history(config.keep_revision_history);
        let metadata = MetadataEngine::new(store.clone());
        Ok(Self {
            config,
            store,
            git,
            tree,
            metadata,
        })
    }

    /// Create a new in-memory database (for testing).
    pub fn in_memory() -> DatabaseResult<Self> {
        Self::open_with_config(DatabaseConfig::memory())
    }

    /// The tree-based revision engine.
    pub fn tree(&self) -> &TreeEngine {
        &self.tree
    }

    /// The metadata-map revision engine.
    pub fn metadata(&self) -> &MetadataEngine {
        &self.metadata
    }

    /// The backing store both engines write to.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Get database statistics.
    pub async fn stats(&self) -> DatabaseResult<DatabaseStats> {
        match &self.git {
            Some(git) => {
                let stats = git.stats().await?;
                Ok(DatabaseStats {
                    entries: stats.entries,
                    commits: Some(stats.commits),
                })
            }
            None => Ok(DatabaseStats {
                entries: self.store.list().await?.len(),
                commits: None,
            }),
        }
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get the configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Database statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Number of stored entries, side-cars included.
    pub entries: usize,
    /// Number of commits, git backend only.
    pub commits: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::metadata::WriteOptions;
    use crate::revision::{Document, GetOptions};

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_open_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.path(), dir.path());
        assert_eq!(db.stats().await.unwrap().entries, 0);
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig::new(dir.path().join("absent")).create_if_missing(false);
        let err = Database::open_with_config(config).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn test_invalid_config() {
        let config = DatabaseConfig::memory().signature("", "a@b");
        let err = Database::open_with_config(config).unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_tree_engine_commits() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let written = db.tree().put(doc(json!({"_id": "d", "v": 1}))).await.unwrap();
        let got = db.tree().get("d", &GetOptions::new()).await.unwrap();
        assert_eq!(got.rev, written.rev);

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.commits.unwrap() >= 3);
    }

    #[tokio::test]
    async fn test_in_memory_metadata_engine() {
        let db = Database::in_memory().unwrap();

        db.metadata()
            .put(doc(json!({"_id": "d", "v": 1})), &WriteOptions::new())
            .await
            .unwrap();
        let got = db.metadata().get("d", &GetOptions::new()).await.unwrap();
        assert_eq!(got.get("v"), Some(&json!(1)));

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.commits.is_none());
    }

    #[tokio::test]
    async fn test_revision_error_passes_through() {
        let db = Database::in_memory().unwrap();
        let err: DatabaseError = db
            .tree()
            .get("missing", &GetOptions::new())
            .await
            .unwrap_err()
            .into();
        assert_eq!(err.status(), 404);
        assert_eq!(err.reason(), "document not found");
    }
}
