//! Storage abstraction for the archive engine.
//!
//! The [`Store`] trait is the only way the engine touches persisted state.
//! Two backends exist: [`SqliteStore`](crate::sqlite_store::SqliteStore)
//! for real deployments and [`memory::InMemoryStore`] for tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use crate::models::{Document, DocumentChildren, DocumentHealth};

/// Whether a reconciled record is written as a new row or over an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Insert,
    Update,
}

/// Lightweight status change that leaves content and children untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub completed_steps: Vec<String>,
    pub processing_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counts over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub documents: i64,
    pub ready: i64,
    pub waiting_for_analysis: i64,
    pub with_errors: i64,
    pub pages: i64,
    pub handwritten_notes: i64,
    pub stamps: i64,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`find_by_any_id`](Store::find_by_any_id) | Lookup by primary, archive or old id |
/// | [`save_document`](Store::save_document) | Write scalars and replace all children atomically |
/// | [`insert_placeholder`](Store::insert_placeholder) | Create a bare record if none exists |
/// | [`update_status`](Store::update_status) | Status-only update |
/// | [`get_children`](Store::get_children) | Pages, notes and stamps of a document |
/// | [`count_pages`](Store::count_pages) | Number of page rows |
/// | [`list_health`](Store::list_health) | Structural facts for every document |
/// | [`stats`](Store::stats) | Aggregate counts |
#[async_trait]
pub trait Store: Send + Sync {
    /// Find the record whose id, archive id or old id equals `id`.
    ///
    /// When several records match, the one with the lowest primary id wins.
    async fn find_by_any_id(&self, id: &str) -> Result<Option<Document>>;

    /// Persist `doc` and replace every child row it owns with `children`,
    /// as one atomic operation.
    async fn save_document(
        &self,
        doc: &Document,
        children: &DocumentChildren,
        mode: WriteMode,
    ) -> Result<()>;

    /// Insert `doc` without children. Returns `false` if the id is taken.
    async fn insert_placeholder(&self, doc: &Document) -> Result<bool>;

    /// Apply a status-only update. Returns `false` if the document is unknown.
    async fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool>;

    async fn get_children(&self, id: &str) -> Result<DocumentChildren>;

    async fn count_pages(&self, id: &str) -> Result<i64>;

    /// Structural facts for every document, ordered by id.
    async fn list_health(&self) -> Result<Vec<DocumentHealth>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Run a store operation under `timeout`. Expiry is reported as an error
/// naming `what`.
pub async fn bounded<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow!("store {} timed out after {:?}", what, timeout))?
}
