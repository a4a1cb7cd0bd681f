//! Backing store access shared by the engines.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::revision::error::{RevisionError, RevisionResult};
use crate::revision::id::RevisionId;
use crate::storage::{DocId, SharedStore};

/// Backing entry id of a revision's content: `<id>.<rev>`.
pub(crate) fn content_entry(id: &DocId, rev: &RevisionId) -> String {
    id.entry(&format!(".{}", rev))
}

/// Read and decode a side-car. `None` when the entry does not exist.
pub(crate) async fn load_side_car<T: DeserializeOwned>(
    store: &SharedStore,
    entry: &str,
    context: &'static str,
) -> RevisionResult<Option<T>> {
    match store.get(entry).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(RevisionError::corrupted(entry)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(RevisionError::storage(context)(e)),
    }
}

/// Read the content of a revision.
pub(crate) async fn load_content(
    store: &SharedStore,
    id: &DocId,
    rev: &RevisionId,
) -> RevisionResult<Map<String, Value>> {
    let entry = content_entry(id, rev);
    load_side_car(store, &entry, "cannot get document revision")
        .await?
        .ok_or_else(|| RevisionError::not_found("revision content is missing"))
}

/// Create-only write; an existing entry is the same content-addressed blob.
pub(crate) async fn put_once(store: &SharedStore, entry: &str, blob: Vec<u8>) -> RevisionResult<()> {
    match store.put(entry, blob).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_exists() => {
            debug!(entry, "blob already stored");
            Ok(())
        }
        Err(e) => Err(RevisionError::storage("cannot store document revision")(e)),
    }
}

/// Best-effort removal of a superseded entry.
pub(crate) async fn drop_entry(store: &SharedStore, entry: &str) {
    match store.remove(entry).await {
        Ok(()) => debug!(entry, "superseded entry dropped"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(entry, error = %e, "cannot drop superseded entry"),
    }
}
