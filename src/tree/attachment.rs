//! Attachment stubs kept in a revision's `_attachments` map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::revision::{RevisionError, RevisionId, RevisionResult};
use crate::storage::InvalidNameError;

/// Key of the stub map inside a stored body.
pub const ATTACHMENTS_KEY: &str = "_attachments";

/// Metadata of an attachment as recorded in the revision that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentStub {
    pub content_type: String,
    pub digest: String,
    pub length: usize,
    /// Generation of the revision that stored the bytes.
    pub revpos: u64,
}

/// Stub map of a body; absent means no attachments.
pub type Stubs = BTreeMap<String, AttachmentStub>;

/// An attachment read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub stub: AttachmentStub,
    pub data: Vec<u8>,
}

/// Backing entry id of attachment bytes: `<id>.<rev>@<name>`.
pub fn entry_suffix(rev: &RevisionId, name: &str) -> String {
    format!(".{}@{}", rev, name)
}

/// Read the stub map out of a stored body.
pub fn read_stubs(body: &Map<String, Value>, entry: &str) -> RevisionResult<Stubs> {
    match body.get(ATTACHMENTS_KEY) {
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(RevisionError::corrupted(entry))
        }
        None => Ok(Stubs::new()),
    }
}

/// Replace the stub map of `body`, dropping the key when empty.
pub fn write_stubs(body: &mut Map<String, Value>, stubs: &Stubs) -> RevisionResult<()> {
    if stubs.is_empty() {
        body.remove(ATTACHMENTS_KEY);
        return Ok(());
    }
    let value = serde_json::to_value(stubs)
        .map_err(RevisionError::corrupted(ATTACHMENTS_KEY))?;
    body.insert(ATTACHMENTS_KEY.to_string(), value);
    Ok(())
}

/// Check an attachment name can be embedded in an entry id.
pub fn validate_name(name: &str) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    for (i, c) in name.chars().enumerate() {
        if c == '/' || c == '\\' || c == '\0' {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stub(revpos: u64) -> AttachmentStub {
        AttachmentStub {
            content_type: "text/plain".into(),
            digest: "sha256-00".into(),
            length: 2,
            revpos,
        }
    }

    #[test]
    fn test_stub_roundtrip_in_body() {
        let mut body = json!({"title": "A"}).as_object().unwrap().clone();
        assert!(read_stubs(&body, "d.1-a").unwrap().is_empty());

        let mut stubs = Stubs::new();
        stubs.insert("note.txt".into(), stub(2));
        write_stubs(&mut body, &stubs).unwrap();
        assert_eq!(body["_attachments"]["note.txt"]["revpos"], json!(2));
        assert_eq!(read_stubs(&body, "d.2-b").unwrap(), stubs);

        write_stubs(&mut body, &Stubs::new()).unwrap();
        assert!(!body.contains_key("_attachments"));
    }

    #[test]
    fn test_corrupted_stubs() {
        let body = json!({"_attachments": 3}).as_object().unwrap().clone();
        let err = read_stubs(&body, "d.1-a").unwrap_err();
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_entry_suffix_and_names() {
        let rev = RevisionId::parse("2-ab").unwrap();
        assert_eq!(entry_suffix(&rev, "photo.png"), ".2-ab@photo.png");
        assert!(validate_name("photo.png").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
    }
}
