//! Document identity resolution.
//!
//! Archive documents have been known under several id schemes over time.
//! Callers may pass any of them, with or without leading path separators
//! (`/104-10003-10041` and `104-10003-10041` are the same document).

use anyhow::Result;

use crate::models::Document;
use crate::store::Store;

/// Strip leading `/` and `\` characters and surrounding whitespace.
pub fn clean_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches(['/', '\\'])
        .trim()
        .to_string()
}

/// Find the persisted document matching `candidate` by primary id, archive
/// id or old id.
///
/// `Ok(None)` means the document has never been seen; callers create it.
/// Errors only come from the store itself.
pub async fn resolve(store: &dyn Store, candidate: &str) -> Result<Option<Document>> {
    let id = clean_id(candidate);
    if id.is_empty() {
        return Ok(None);
    }
    store.find_by_any_id(&id).await
}
