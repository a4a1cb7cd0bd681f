//! core type-safe wrappers shared by the stores and the revision engines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A validated document id.
///
/// Document ids are embedded in backing entry ids (`{id}.metadata`,
/// `{id}.{rev}`), so they are restricted to characters that can never be
/// confused with the suffix separators:
/// - 1-128 characters
/// - Alphanumeric, underscores, hyphens only
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocId(String);

impl DocId {
    /// create a new DocId, validating the input
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidNameError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> Result<(), InvalidNameError> {
        if id.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if id.len() > 128 {
            return Err(InvalidNameError::TooLong(id.len()));
        }

        for (i, c) in id.chars().enumerate() {
            // alphanumeric, underscore, hyphen allowed
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    /// Generate a new ULID-based document id.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }

    /// backing entry id of a side-car or revision blob: `{id}{suffix}`
    pub fn entry(&self, suffix: &str) -> String {
        format!("{}{}", self.0, suffix)
    }
}

impl TryFrom<String> for DocId {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DocId> for String {
    fn from(id: DocId) -> Self {
        id.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DocId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a flat backing entry id.
///
/// Entry ids become file names in the git store, so path separators and
/// the special directory names are rejected.
pub fn validate_entry_id(id: &str) -> Result<(), InvalidNameError> {
    if id.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    if id.len() > 255 {
        return Err(InvalidNameError::TooLong(id.len()));
    }
    if id == "." || id == ".." || id == ".git" {
        return Err(InvalidNameError::Reserved(id.to_string()));
    }
    for (i, c) in id.chars().enumerate() {
        if c == '/' || c == '\\' || c == '\0' {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }
    Ok(())
}

/// git signature (author/committer info)
#[derive(Debug, Clone)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    /// create a new signature
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// default signature for revstore commits
    pub fn revstore() -> Self {
        Self::new("revstore", "revstore@localhost")
    }

    /// convert to git2::Signature
    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::revstore()
    }
}

/// error type for invalid names (document ids, entry ids)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
        }
    }
}

impl std::error::Error for InvalidNameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_valid() {
        assert!(DocId::new("abc123").is_ok());
        assert!(DocId::new("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_ok());
        assert!(DocId::new("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(DocId::new("simple_key").is_ok());
    }

    #[test]
    fn test_doc_id_invalid() {
        assert!(DocId::new("").is_err());
        assert!(DocId::new("a.b").is_err()); // suffix separator
        assert!(DocId::new("a@b").is_err());
        assert!(DocId::new("a/b").is_err());
        assert!(DocId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_doc_id_generate() {
        let id1 = DocId::generate();
        let id2 = DocId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 26); // ULID length
        assert_eq!(id1.as_str(), id1.as_str().to_lowercase());
    }

    #[test]
    fn test_doc_id_entry() {
        let id = DocId::new("doc").unwrap();
        assert_eq!(id.entry(".metadata"), "doc.metadata");
        assert_eq!(id.entry(".1-abc"), "doc.1-abc");
    }

    #[test]
    fn test_doc_id_serde() {
        let id: DocId = serde_json::from_str("\"doc-1\"").unwrap();
        assert_eq!(id.as_str(), "doc-1");
        assert!(serde_json::from_str::<DocId>("\"doc.1\"").is_err());
    }

    #[test]
    fn test_entry_id_validation() {
        assert!(validate_entry_id("doc.revision_tree.json").is_ok());
        assert!(validate_entry_id("doc.2-ab12@photo.png").is_ok());
        assert!(validate_entry_id("").is_err());
        assert!(validate_entry_id("..").is_err());
        assert!(validate_entry_id("a/b").is_err());
    }
}
