//! Document status reports and the best-effort status cache.
//!
//! The store is authoritative. [`StatusCache`] remembers the last report
//! served per document and is consulted only when the store cannot be
//! read; such answers carry `cached: true`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::models::{Document, ProcessingStage};

/// Externally visible status of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub document_id: String,
    pub processing_stage: ProcessingStage,
    pub has_summary: bool,
    pub has_pages: bool,
    pub page_count: i64,
    pub analysis_complete: bool,
    pub last_processed: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    #[serde(default)]
    pub cached: bool,
}

impl StatusReport {
    /// Build a report from a stored record and its number of page rows.
    pub fn from_document(doc: &Document, page_rows: i64) -> Self {
        Self {
            document_id: doc.id.clone(),
            processing_stage: doc.processing_stage,
            has_summary: doc.has_summary(),
            has_pages: page_rows > 0,
            page_count: doc.page_count,
            analysis_complete: doc.analysis_complete,
            last_processed: doc.last_processed,
            processing_error: doc.processing_error.clone(),
            cached: false,
        }
    }
}

/// Bounded, TTL'd cache of the last status served per document id.
#[derive(Clone)]
pub struct StatusCache {
    inner: Cache<String, StatusReport>,
}

impl StatusCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, Duration::from_secs(config.ttl_secs))
    }

    pub async fn insert(&self, report: &StatusReport) {
        let mut stored = report.clone();
        stored.cached = false;
        self.inner.insert(report.document_id.clone(), stored).await;
    }

    /// Last known report for `id`, flagged as cached.
    pub async fn get(&self, id: &str) -> Option<StatusReport> {
        self.inner.get(id).await.map(|mut r| {
            r.cached = true;
            r
        })
    }

    pub async fn invalidate(&self, id: &str) {
        self.inner.invalidate(id).await;
    }

    /// Serve `id` from `load`, remembering the answer.
    ///
    /// If `load` fails, a cached report is returned instead when one
    /// exists; otherwise the load error is propagated.
    pub async fn read_through<F, Fut>(&self, id: &str, load: F) -> Result<Option<StatusReport>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<StatusReport>>>,
    {
        match load().await {
            Ok(Some(report)) => {
                self.insert(&report).await;
                Ok(Some(report))
            }
            Ok(None) => {
                self.invalidate(id).await;
                Ok(None)
            }
            Err(e) => match self.get(id).await {
                Some(report) => {
                    tracing::warn!(document_id = id, error = %e, "store read failed, serving cached status");
                    Ok(Some(report))
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn report(id: &str) -> StatusReport {
        let mut doc = Document::placeholder(id, Utc::now());
        doc.summary = Some("memo".into());
        doc.page_count = 2;
        StatusReport::from_document(&doc, 2)
    }

    #[test]
    fn test_report_from_document() {
        let r = report("a");
        assert_eq!(r.document_id, "a");
        assert!(r.has_summary);
        assert!(r.has_pages);
        assert_eq!(r.processing_stage, ProcessingStage::WaitingForAnalysis);
        assert!(!r.cached);

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["processingStage"], "waitingForAnalysis");
        assert_eq!(json["hasPages"], true);
    }

    #[tokio::test]
    async fn test_read_through_prefers_store() {
        let cache = StatusCache::new(10, Duration::from_secs(60));
        let served = cache
            .read_through("a", || async { Ok(Some(report("a"))) })
            .await
            .unwrap()
            .unwrap();
        assert!(!served.cached);
        assert!(cache.get("a").await.unwrap().cached);
    }

    #[tokio::test]
    async fn test_read_through_falls_back_on_error() {
        let cache = StatusCache::new(10, Duration::from_secs(60));
        cache.insert(&report("a")).await;

        let served = cache
            .read_through("a", || async { Err(anyhow!("db down")) })
            .await
            .unwrap()
            .unwrap();
        assert!(served.cached);

        let miss = cache
            .read_through("b", || async { Err(anyhow!("db down")) })
            .await;
        assert!(miss.is_err());
    }

    #[tokio::test]
    async fn test_not_found_evicts() {
        let cache = StatusCache::new(10, Duration::from_secs(60));
        cache.insert(&report("a")).await;
        let served = cache.read_through("a", || async { Ok(None) }).await.unwrap();
        assert!(served.is_none());
        assert!(cache.get("a").await.is_none());
    }
}
