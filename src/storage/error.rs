//! Backing store error types
//!
//! Every store implementation maps its native failures onto this enum so the
//! revision engines can classify them without knowing the backend.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::InvalidNameError;

/// the main error type for backing store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// no entry is stored under this id
    #[error("entry not found: {id}")]
    NotFound { id: String },

    /// a create-only write hit an existing entry
    #[error("entry already exists: {id}")]
    AlreadyExists { id: String },

    /// the id cannot be used as a key by this backend
    #[error("invalid entry id: {0}")]
    InvalidId(#[from] InvalidNameError),

    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    /// the tree entry has an unexpected type
    #[error("unexpected entry type for {id}: expected {expected}, found {found}")]
    UnexpectedEntryType {
        id: String,
        expected: String,
        found: String,
    },

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound { id: id.into() }
    }

    pub fn already_exists(id: impl Into<String>) -> Self {
        StoreError::AlreadyExists { id: id.into() }
    }

    /// check if this error indicates the entry doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// check if this error is the create-only "already exists" signal
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    /// HTTP-like status code for this failure
    pub fn status(&self) -> u16 {
        match self {
            StoreError::NotFound { .. } => 404,
            StoreError::AlreadyExists { .. } => 409,
            StoreError::InvalidId(_) => 400,
            _ => 500,
        }
    }
}

/// result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StoreError::not_found("doc.metadata");
        assert!(not_found.is_not_found());
        assert!(!not_found.is_already_exists());
        assert_eq!(not_found.status(), 404);

        let exists = StoreError::already_exists("doc.1-abc");
        assert!(!exists.is_not_found());
        assert!(exists.is_already_exists());
        assert_eq!(exists.status(), 409);

        let internal = StoreError::Internal("boom".to_string());
        assert_eq!(internal.status(), 500);
    }

    #[test]
    fn test_error_messages() {
        let err = StoreError::not_found("a.revision_tree.json");
        assert_eq!(err.to_string(), "entry not found: a.revision_tree.json");
    }
}
