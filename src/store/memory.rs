//! In-memory [`Store`] implementation for tests.
//!
//! Documents live in a `BTreeMap` so lookups that may match several records
//! resolve in primary-id order, the same as the SQLite backend. Writes can
//! be made to fail, and health listings to stall, on demand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{Document, DocumentChildren, DocumentHealth, ProcessingStage};

use super::{StatusUpdate, Store, StoreStats, WriteMode};

const CONTENT_PREFIX_LEN: usize = 32;

/// In-memory store for tests.
pub struct InMemoryStore {
    docs: RwLock<BTreeMap<String, Document>>,
    children: RwLock<BTreeMap<String, DocumentChildren>>,
    fail_writes: AtomicBool,
    list_delay_ms: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            children: RwLock::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
            list_delay_ms: AtomicU64::new(0),
        }
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every [`list_health`](Store::list_health) call by `delay`.
    pub fn set_list_delay(&self, delay: Duration) {
        self.list_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Insert a record and its children exactly as given, bypassing
    /// reconciliation. Used to seed inconsistent states.
    pub fn seed(&self, doc: Document, children: DocumentChildren) {
        let mut docs = self.docs.write().unwrap();
        self.children
            .write()
            .unwrap()
            .insert(doc.id.clone(), children);
        docs.insert(doc.id.clone(), doc);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("store unavailable: writes disabled");
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_by_any_id(&self, id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .values()
            .find(|d| {
                d.id == id
                    || d.archive_id.as_deref() == Some(id)
                    || d.old_id.as_deref() == Some(id)
            })
            .cloned())
    }

    async fn save_document(
        &self,
        doc: &Document,
        children: &DocumentChildren,
        mode: WriteMode,
    ) -> Result<()> {
        self.check_writable()?;

        let mut docs = self.docs.write().unwrap();
        match mode {
            WriteMode::Insert if docs.contains_key(&doc.id) => {
                bail!("document already exists: {}", doc.id)
            }
            WriteMode::Update if !docs.contains_key(&doc.id) => {
                bail!("document not found: {}", doc.id)
            }
            _ => {}
        }

        let mut stored_children = self.children.write().unwrap();
        docs.insert(doc.id.clone(), doc.clone());
        stored_children.insert(doc.id.clone(), children.clone());
        Ok(())
    }

    async fn insert_placeholder(&self, doc: &Document) -> Result<bool> {
        self.check_writable()?;
        let mut docs = self.docs.write().unwrap();
        if docs.contains_key(&doc.id) {
            return Ok(false);
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(true)
    }

    async fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool> {
        self.check_writable()?;
        let mut docs = self.docs.write().unwrap();
        match docs.get_mut(id) {
            Some(doc) => {
                doc.completed_steps = update.completed_steps.clone();
                doc.processing_error = update.processing_error.clone();
                doc.updated_at = update.updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_children(&self, id: &str) -> Result<DocumentChildren> {
        Ok(self
            .children
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn count_pages(&self, id: &str) -> Result<i64> {
        Ok(self
            .children
            .read()
            .unwrap()
            .get(id)
            .map(|c| c.pages.len() as i64)
            .unwrap_or(0))
    }

    async fn list_health(&self) -> Result<Vec<DocumentHealth>> {
        let delay = self.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let docs = self.docs.read().unwrap();
        let children = self.children.read().unwrap();
        Ok(docs
            .values()
            .map(|d| DocumentHealth {
                id: d.id.clone(),
                page_count: d.page_count,
                page_rows: children
                    .get(&d.id)
                    .map(|c| c.pages.len() as i64)
                    .unwrap_or(0),
                analysis_complete: d.analysis_complete,
                content_prefix: d
                    .content_json
                    .as_ref()
                    .map(|c| c.chars().take(CONTENT_PREFIX_LEN).collect()),
            })
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let docs = self.docs.read().unwrap();
        let children = self.children.read().unwrap();
        let mut stats = StoreStats {
            documents: docs.len() as i64,
            ..StoreStats::default()
        };
        for doc in docs.values() {
            match doc.processing_stage {
                ProcessingStage::Ready => stats.ready += 1,
                ProcessingStage::WaitingForAnalysis => stats.waiting_for_analysis += 1,
            }
            if doc.processing_error.is_some() {
                stats.with_errors += 1;
            }
        }
        for c in children.values() {
            stats.pages += c.pages.len() as i64;
            stats.handwritten_notes += c.handwritten_notes.len() as i64;
            stats.stamps += c.stamps.len() as i64;
        }
        Ok(stats)
    }
}
