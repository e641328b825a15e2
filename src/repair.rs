//! Detection and repair of inconsistent documents.
//!
//! [`classify`] is the single definition of "broken"; the scan, the repair
//! commands and the self-healing status read all go through it.
//!
//! Repair of one document runs a standard repair (one fetch, reconcile if
//! the payload is complete) and falls back to a forced update (bounded
//! retry). A batch never aborts on a single failure.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::ingest::{IngestError, Ingestor, UpdateError};
use crate::models::{Document, DocumentHealth};
use crate::status::StatusReport;
use crate::store::{bounded, Store};

const CONTENT_PREFIX_LEN: usize = 32;

/// Why a document is considered broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BrokenReason {
    /// Marked complete, yet no pages exist or the page count is zero.
    CompleteWithoutPages,
    /// Content blob was written by a bad migration.
    LegacyContent,
    ZeroPageCount,
    NoPageRows,
}

impl BrokenReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokenReason::CompleteWithoutPages => "completeWithoutPages",
            BrokenReason::LegacyContent => "legacyContent",
            BrokenReason::ZeroPageCount => "zeroPageCount",
            BrokenReason::NoPageRows => "noPageRows",
        }
    }
}

impl fmt::Display for BrokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First reason `health` is broken, or `None` for a healthy document.
pub fn classify(health: &DocumentHealth, legacy_markers: &[String]) -> Option<BrokenReason> {
    let no_pages = health.page_rows == 0 || health.page_count == 0;
    if health.analysis_complete && no_pages {
        return Some(BrokenReason::CompleteWithoutPages);
    }
    if let Some(prefix) = &health.content_prefix {
        if legacy_markers
            .iter()
            .any(|m| !m.is_empty() && prefix.starts_with(m.as_str()))
        {
            return Some(BrokenReason::LegacyContent);
        }
    }
    if health.page_count == 0 {
        return Some(BrokenReason::ZeroPageCount);
    }
    if health.page_rows == 0 {
        return Some(BrokenReason::NoPageRows);
    }
    None
}

/// Health facts of a loaded record.
pub fn health_of(doc: &Document, page_rows: i64) -> DocumentHealth {
    DocumentHealth {
        id: doc.id.clone(),
        page_count: doc.page_count,
        page_rows,
        analysis_complete: doc.analysis_complete,
        content_prefix: doc
            .content_json
            .as_ref()
            .map(|c| c.chars().take(CONTENT_PREFIX_LEN).collect()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokenDocument {
    pub document_id: String,
    pub reason: BrokenReason,
}

/// Every broken document in the store, ordered by id. Read-only.
pub async fn scan_for_broken(
    store: &dyn Store,
    legacy_markers: &[String],
    store_timeout: Duration,
) -> Result<Vec<BrokenDocument>> {
    let health = bounded(store_timeout, "list health", store.list_health()).await?;
    Ok(broken_in(&health, legacy_markers))
}

fn broken_in(health: &[DocumentHealth], legacy_markers: &[String]) -> Vec<BrokenDocument> {
    health
        .iter()
        .filter_map(|h| {
            classify(h, legacy_markers).map(|reason| BrokenDocument {
                document_id: h.id.clone(),
                reason,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RepairOutcome {
    Repaired,
    ForceRepaired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    pub document_id: String,
    pub reason: BrokenReason,
    pub outcome: RepairOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub scanned: usize,
    pub broken: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<RepairResult>,
}

/// Standard repair, then a forced update with `attempts` attempts.
///
/// Each step is followed by a fresh [`classify`]. A document still broken
/// after the forced update is reported as [`UpdateError::StillBroken`].
async fn repair_inner(
    ingestor: &Ingestor,
    id: &str,
    attempts: Option<u32>,
) -> Result<(RepairOutcome, StatusReport), IngestError> {
    match ingestor.standard_repair(id).await {
        Ok(true) => {
            let (doc, reason) = recheck(ingestor, id).await?;
            match reason {
                None => return Ok((RepairOutcome::Repaired, ingestor.report_for(&doc).await?)),
                Some(reason) => tracing::info!(
                    document_id = id,
                    %reason,
                    "standard repair left document broken"
                ),
            }
        }
        Ok(false) => {}
        Err(e) => tracing::debug!(document_id = id, error = %e, "standard repair failed"),
    }

    ingestor.force_update(id, attempts, None).await?;
    let (doc, reason) = recheck(ingestor, id).await?;
    if let Some(reason) = reason {
        return Err(UpdateError::StillBroken {
            id: doc.id,
            reason: reason.to_string(),
        }
        .into());
    }
    Ok((RepairOutcome::ForceRepaired, ingestor.report_for(&doc).await?))
}

/// Re-read `id` and classify it again.
async fn recheck(
    ingestor: &Ingestor,
    id: &str,
) -> Result<(Document, Option<BrokenReason>), IngestError> {
    let (doc, rows) = ingestor
        .find_with_rows(id)
        .await?
        .ok_or_else(|| IngestError::NotFound(id.to_string()))?;
    let reason = classify(&health_of(&doc, rows), &ingestor.config().repair.legacy_markers);
    Ok((doc, reason))
}

/// Repair one known document. Unknown ids are `NotFound`.
pub async fn repair_document(
    ingestor: &Ingestor,
    document_id: &str,
    attempts: Option<u32>,
) -> Result<(RepairOutcome, StatusReport), IngestError> {
    if ingestor.find(document_id).await?.is_none() {
        return Err(IngestError::NotFound(document_id.to_string()));
    }
    repair_inner(ingestor, document_id, attempts).await
}

/// Scan the store and repair every broken document.
///
/// Documents are processed `repair.concurrency` at a time (one by default).
pub async fn repair_all(ingestor: &Ingestor, attempts: Option<u32>) -> Result<RepairReport> {
    let config = ingestor.config();
    let health = bounded(
        config.store_timeout(),
        "list health",
        ingestor.store().list_health(),
    )
    .await?;
    let scanned = health.len();
    let broken = broken_in(&health, &config.repair.legacy_markers);

    tracing::info!(scanned, broken = broken.len(), "repair batch started");

    let results: Vec<RepairResult> = stream::iter(broken)
        .map(|b| async move {
            match repair_inner(ingestor, &b.document_id, attempts).await {
                Ok((outcome, _)) => RepairResult {
                    document_id: b.document_id,
                    reason: b.reason,
                    outcome,
                    error: None,
                },
                Err(e) => {
                    let message = match &e {
                        IngestError::Exhausted(x) => x.last_message(),
                        other => other.to_string(),
                    };
                    tracing::warn!(document_id = %b.document_id, error = %message, "repair failed");
                    RepairResult {
                        document_id: b.document_id,
                        reason: b.reason,
                        outcome: RepairOutcome::Failed,
                        error: Some(message),
                    }
                }
            }
        })
        .buffered(config.repair.concurrency.max(1))
        .collect()
        .await;

    let failed = results
        .iter()
        .filter(|r| r.outcome == RepairOutcome::Failed)
        .count();
    let report = RepairReport {
        scanned,
        broken: results.len(),
        succeeded: results.len() - failed,
        failed,
        results,
    };

    tracing::info!(
        scanned = report.scanned,
        broken = report.broken,
        succeeded = report.succeeded,
        failed = report.failed,
        "repair batch finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::{complete_payload, engine, fast_config, FakeSource};
    use crate::models::{DocumentChildren, Page};
    use crate::store::memory::InMemoryStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn markers() -> Vec<String> {
        vec!["\"".to_string(), "[object".to_string()]
    }

    fn health(page_count: i64, page_rows: i64, complete: bool, prefix: Option<&str>) -> DocumentHealth {
        DocumentHealth {
            id: "d".into(),
            page_count,
            page_rows,
            analysis_complete: complete,
            content_prefix: prefix.map(String::from),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&health(5, 0, false, None), &markers()),
            Some(BrokenReason::NoPageRows)
        );
        assert_eq!(classify(&health(5, 5, false, Some("{\"title\"")), &markers()), None);
        assert_eq!(
            classify(&health(5, 5, false, Some("\"{\\\"title")), &markers()),
            Some(BrokenReason::LegacyContent)
        );
        assert_eq!(
            classify(&health(5, 5, true, Some("[object Object]")), &markers()),
            Some(BrokenReason::LegacyContent)
        );
        assert_eq!(
            classify(&health(0, 3, false, None), &markers()),
            Some(BrokenReason::ZeroPageCount)
        );
        assert_eq!(
            classify(&health(4, 0, true, None), &markers()),
            Some(BrokenReason::CompleteWithoutPages)
        );
        assert_eq!(classify(&health(5, 5, false, Some("\"x")), &[]), None);
    }

    fn seed_page(doc_id: &str, n: i64) -> Page {
        Page {
            id: format!("{}-p{}", doc_id, n),
            document_id: doc_id.to_string(),
            page_number: n,
            image_url: None,
            summary: None,
            full_text: None,
            names: vec![],
            places: vec![],
            dates: vec![],
            objects: vec![],
            has_image: false,
            has_text: false,
        }
    }

    fn seed(store: &crate::store::memory::InMemoryStore, id: &str, page_count: i64, rows: i64) {
        let mut doc = Document::placeholder(id, Utc::now());
        doc.page_count = page_count;
        doc.content_json = Some("{}".into());
        let children = DocumentChildren {
            pages: (1..=rows).map(|n| seed_page(id, n)).collect(),
            ..Default::default()
        };
        store.seed(doc, children);
    }

    #[tokio::test]
    async fn test_scan_is_read_only() {
        let (store, source, _ingestor) = engine(FakeSource::default());
        seed(&store, "broken", 5, 0);
        seed(&store, "healthy", 2, 2);

        let broken = scan_for_broken(store.as_ref(), &markers(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            broken,
            vec![BrokenDocument {
                document_id: "broken".into(),
                reason: BrokenReason::NoPageRows
            }]
        );
        assert!(source.fetches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repair_all_continues_past_failures() {
        let source = FakeSource::default()
            .with("a", vec![Some(complete_payload())])
            .with("b", vec![None])
            .with("c", vec![Some(json!({ "pages": [] })), Some(complete_payload())]);
        let (store, _source, ingestor) = engine(source);
        seed(&store, "a", 0, 0);
        seed(&store, "b", 3, 0);
        seed(&store, "c", 1, 0);
        seed(&store, "ok", 1, 1);

        let report = repair_all(&ingestor, Some(2)).await.unwrap();
        assert_eq!(report.scanned, 4);
        assert_eq!(report.broken, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);

        let outcome = |id: &str| {
            report
                .results
                .iter()
                .find(|r| r.document_id == id)
                .unwrap()
                .clone()
        };
        assert_eq!(outcome("a").outcome, RepairOutcome::Repaired);
        assert_eq!(outcome("c").outcome, RepairOutcome::ForceRepaired);
        let b = outcome("b");
        assert_eq!(b.outcome, RepairOutcome::Failed);
        assert_eq!(b.error.as_deref(), Some("analysis unavailable for b"));

        let a = store.find_by_any_id("a").await.unwrap().unwrap();
        assert!(a.processing_stage.is_ready());
    }

    #[tokio::test]
    async fn test_repair_document_fetches_once() {
        let source = FakeSource::default().with("claims", vec![Some(complete_payload())]);
        let (store, source, ingestor) = engine(source);
        let mut doc = Document::placeholder("claims", Utc::now());
        doc.analysis_complete = true;
        doc.page_count = 3;
        store.seed(doc, DocumentChildren::default());

        let (outcome, report) = repair_document(&ingestor, "claims", Some(2)).await.unwrap();
        assert_eq!(outcome, RepairOutcome::Repaired);
        assert_eq!(report.page_count, 1);
        assert_eq!(source.fetch_count("claims"), 1);
    }

    #[tokio::test]
    async fn test_repair_rechecks_classification() {
        // Every serialized payload starts with '{', so reconciling cannot
        // clear this marker.
        let mut config = fast_config();
        config.repair.legacy_markers.push("{".to_string());
        let store = Arc::new(InMemoryStore::new());
        let source = Arc::new(FakeSource::default().with("leg", vec![Some(complete_payload())]));
        let ingestor = Ingestor::new(store.clone(), source.clone(), config);
        seed(&store, "leg", 1, 1);

        let err = repair_document(&ingestor, "leg", Some(2)).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Update(UpdateError::StillBroken { .. })
        ));
        // Standard repair, then one successful forced attempt.
        assert_eq!(source.fetch_count("leg"), 2);

        let report = repair_all(&ingestor, Some(1)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.results[0].outcome, RepairOutcome::Failed);
        assert!(report.results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("still broken"));
    }

    #[tokio::test]
    async fn test_zero_page_count_payload_stays_healthy() {
        let source = FakeSource::default().with(
            "z",
            vec![Some(json!({ "summary": "S", "pageCount": 0, "pages": [{ "fullText": "x" }] }))],
        );
        let (store, source, ingestor) = engine(source);

        let report = ingestor.update_once("z", None, false).await.unwrap();
        assert!(report.processing_stage.is_ready());
        assert_eq!(report.page_count, 1);

        ingestor.status("z").await.unwrap().unwrap();
        ingestor.status("z").await.unwrap().unwrap();
        assert_eq!(source.fetch_count("z"), 1);

        let broken = scan_for_broken(store.as_ref(), &markers(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(broken.is_empty());
    }

    #[tokio::test]
    async fn test_health_listing_is_bounded() {
        let mut config = fast_config();
        config.db.timeout_secs = 1;
        let store = Arc::new(InMemoryStore::new());
        store.set_list_delay(Duration::from_secs(10));
        let ingestor = Ingestor::new(store.clone(), Arc::new(FakeSource::default()), config);

        let err = scan_for_broken(store.as_ref(), &markers(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let err = repair_all(&ingestor, None).await.unwrap_err();
        assert!(err.to_string().contains("list health"));
    }

    #[tokio::test]
    async fn test_repair_document_unknown() {
        let (_store, _source, ingestor) = engine(FakeSource::default());
        let err = repair_document(&ingestor, "missing", None).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
