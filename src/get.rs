//! Document retrieval by id.
//!
//! Loads a record and every row it owns. Used by the `arx get` command.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::identity;
use crate::models::{Document, DocumentChildren};
use crate::sqlite_store::SqliteStore;
use crate::store::Store;

/// A document together with its pages, notes and stamps.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: Document,
    #[serde(flatten)]
    pub children: DocumentChildren,
}

/// Resolve `id` under any id scheme and load the full record.
pub async fn get_document(store: &dyn Store, id: &str) -> Result<DocumentView> {
    let Some(document) = identity::resolve(store, id).await? else {
        bail!("document not found: {}", identity::clean_id(id));
    };
    let children = store.get_children(&document.id).await?;
    Ok(DocumentView { document, children })
}

/// CLI entry point: print the record as pretty JSON.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let result = get_document(&store, id).await;
    pool.close().await;

    let view = result?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_get_by_old_id_flattens_children() {
        let store = InMemoryStore::new();
        let mut doc = Document::placeholder("doc-1", Utc::now());
        doc.old_id = Some("OLD".into());
        doc.title = Some("Memo".into());
        store.seed(doc, DocumentChildren::default());

        let view = get_document(&store, "/OLD").await.unwrap();
        assert_eq!(view.document.id, "doc-1");

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["title"], "Memo");
        assert_eq!(json["processingStage"], "waitingForAnalysis");
        assert!(json["pages"].as_array().unwrap().is_empty());
        assert!(json.get("contentJson").is_none());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = InMemoryStore::new();
        let err = get_document(&store, "nope").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
