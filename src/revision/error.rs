//! Error types shared by both revision engines.
//!
//! Every public engine operation resolves to a success value or a
//! [`RevisionError`]; raw backing store failures are wrapped with the step
//! they happened in so callers always get a status and a reason.

use thiserror::Error;

use crate::job::JobError;
use crate::storage::{InvalidNameError, StoreError};

/// Result type for revision engine operations.
pub type RevisionResult<T> = Result<T, RevisionError>;

/// Errors surfaced by the tree and metadata engines.
#[derive(Debug, Error)]
pub enum RevisionError {
    /// A previous revision or history was not well formed. Raised before I/O.
    #[error("wrong revision: {message}")]
    WrongRevisionFormat { message: String },

    #[error("not found: {reason}")]
    NotFound { reason: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("method not allowed: {method}")]
    MethodNotAllowed { method: &'static str },

    #[error("invalid document id: {0}")]
    InvalidId(#[from] InvalidNameError),

    /// Backing store failure, tagged with the step that issued the call.
    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: StoreError,
    },

    /// A side-car entry could not be decoded.
    #[error("corrupted entry {id}: {source}")]
    Corrupted {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("job failed: {0}")]
    Job(#[from] JobError),
}

impl RevisionError {
    pub fn wrong_format(message: impl Into<String>) -> Self {
        RevisionError::WrongRevisionFormat {
            message: message.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        RevisionError::NotFound {
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        RevisionError::Conflict {
            reason: reason.into(),
        }
    }

    /// Wrap a store error with the step it happened in.
    ///
    /// Meant for `map_err`: `.map_err(RevisionError::storage("cannot get document"))`.
    pub fn storage(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| RevisionError::Storage { context, source }
    }

    pub fn corrupted(id: impl Into<String>) -> impl FnOnce(serde_json::Error) -> Self {
        let id = id.into();
        move |source| RevisionError::Corrupted { id, source }
    }

    /// Stable HTTP-like status code.
    pub fn status(&self) -> u16 {
        match self {
            RevisionError::WrongRevisionFormat { .. } => 409,
            RevisionError::NotFound { .. } => 404,
            RevisionError::Conflict { .. } => 409,
            RevisionError::MethodNotAllowed { .. } => 405,
            RevisionError::InvalidId(_) => 400,
            RevisionError::Storage { source, .. } => source.status(),
            RevisionError::Corrupted { .. } | RevisionError::Job(_) => 500,
        }
    }

    /// Short human-readable reason, without the error chain.
    pub fn reason(&self) -> String {
        match self {
            RevisionError::WrongRevisionFormat { .. } => "wrong revision".to_string(),
            RevisionError::NotFound { reason } | RevisionError::Conflict { reason } => {
                reason.clone()
            }
            RevisionError::MethodNotAllowed { method } => {
                format!("{} is not supported by this engine", method)
            }
            RevisionError::InvalidId(e) => e.to_string(),
            RevisionError::Storage { context, .. } => (*context).to_string(),
            RevisionError::Corrupted { id, .. } => format!("cannot decode {}", id),
            RevisionError::Job(e) => e.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == 404
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RevisionError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RevisionError::wrong_format("x").status(), 409);
        assert_eq!(RevisionError::not_found("document not found").status(), 404);
        assert_eq!(RevisionError::conflict("x").status(), 409);
        assert_eq!(
            RevisionError::MethodNotAllowed { method: "all_docs" }.status(),
            405
        );
        assert_eq!(RevisionError::Job(JobError::Stalled { flow: "put" }).status(), 500);
    }

    #[test]
    fn test_storage_keeps_store_status() {
        let err = RevisionError::storage("cannot get revision tree")(StoreError::not_found("a"));
        assert_eq!(err.status(), 404);
        assert!(err.is_not_found());
        assert_eq!(err.reason(), "cannot get revision tree");

        let err = RevisionError::storage("cannot write")(StoreError::Internal("x".into()));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_reasons() {
        let err = RevisionError::not_found("document has been removed");
        assert_eq!(err.reason(), "document has been removed");
        assert_eq!(err.to_string(), "not found: document has been removed");

        let err = RevisionError::wrong_format("bad");
        assert_eq!(err.reason(), "wrong revision");
        assert!(err.to_string().contains("bad"));
    }
}
