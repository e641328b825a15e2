//! End-to-end tests of the ingestion engine against SQLite and a mock
//! analysis service.

mod common;

use archive_sync::analysis::{AnalysisClient, AnalysisSource};
use archive_sync::config::Config;
use archive_sync::db;
use archive_sync::ingest::{IngestError, Ingestor, KickoffRequest, WebhookEvent};
use archive_sync::migrate;
use archive_sync::models::{Document, DocumentChildren, ProcessingStage};
use archive_sync::repair::{self, BrokenReason, RepairOutcome};
use archive_sync::sqlite_store::SqliteStore;
use archive_sync::store::{Store, WriteMode};
use chrono::{NaiveDate, Utc};
use common::{memo_payload, start_mock, test_config, MockAnalysis, MockReply};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

async fn setup(mock: &MockAnalysis) -> (TempDir, Config, Arc<SqliteStore>, Ingestor) {
    let base = start_mock(mock.clone()).await;
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp, &base);

    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    let ingestor = Ingestor::with_http_source(store.clone(), cfg.clone()).unwrap();
    (tmp, cfg, store, ingestor)
}

#[tokio::test]
async fn test_fetch_types_payload() {
    let mock = MockAnalysis::default();
    mock.reply(
        "doc-1",
        MockReply::Json(json!({
            "title": "Memo",
            "pageCount": "2",
            "allNames": ["Oswald", 7, null],
            "allPlaces": "Dallas",
            "pages": [{ "pageNumber": 1, "image": "p1.png" }, "garbage"]
        })),
    );
    let base = start_mock(mock.clone()).await;
    let tmp = TempDir::new().unwrap();
    let client = AnalysisClient::new(&test_config(&tmp, &base).analysis).unwrap();

    let payload = client.fetch("/doc-1", "jfk").await.unwrap();
    assert_eq!(payload.title.as_deref(), Some("Memo"));
    assert_eq!(payload.page_count, Some(2));
    assert_eq!(payload.all_names, vec!["Oswald".to_string(), "7".to_string()]);
    assert!(payload.all_places.is_empty());
    assert_eq!(payload.pages.len(), 1);
    assert_eq!(payload.pages[0].image_url.as_deref(), Some("p1.png"));
    assert_eq!(mock.fetched_collections(), vec!["jfk".to_string()]);
}

#[tokio::test]
async fn test_fetch_failures_are_none() {
    let mock = MockAnalysis::default();
    mock.reply("array", MockReply::Json(json!([1, 2, 3])));
    mock.reply("broken", MockReply::Status(500));
    mock.reply("slow", MockReply::Hang);
    let base = start_mock(mock.clone()).await;
    let tmp = TempDir::new().unwrap();
    let client = AnalysisClient::new(&test_config(&tmp, &base).analysis).unwrap();

    assert!(client.fetch("array", "default").await.is_none());
    assert!(client.fetch("broken", "default").await.is_none());
    assert!(client.fetch("missing", "default").await.is_none());
    assert!(client.fetch("slow", "default").await.is_none());
}

#[tokio::test]
async fn test_end_to_end_force_update() {
    let mock = MockAnalysis::default();
    mock.reply("104-10003-10041", MockReply::Json(memo_payload()));
    let (_tmp, _cfg, store, ingestor) = setup(&mock).await;

    let report = ingestor
        .force_update("/104-10003-10041", None, None)
        .await
        .unwrap();
    assert_eq!(report.processing_stage, ProcessingStage::Ready);
    assert_eq!(report.page_count, 1);
    assert!(report.has_pages);
    assert!(report.has_summary);

    let doc = store.find_by_any_id("104-10003-10041").await.unwrap().unwrap();
    assert_eq!(doc.normalized_dates.len(), 1);
    assert_eq!(
        doc.earliest_date,
        Some(NaiveDate::from_ymd_opt(1982, 5, 21).unwrap())
    );
    assert_eq!(store.count_pages(&doc.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_reconcile_twice_keeps_single_page_set() {
    let mock = MockAnalysis::default();
    mock.reply(
        "doc-2",
        MockReply::Json(json!({
            "pages": [{ "fullText": "a" }, { "fullText": "b" }],
            "stamps": [{ "type": "SECRET", "text": "SECRET" }],
            "allDates": ["1959-61"]
        })),
    );
    let (_tmp, _cfg, store, ingestor) = setup(&mock).await;

    ingestor.update_once("doc-2", None, false).await.unwrap();
    ingestor.update_once("doc-2", None, false).await.unwrap();

    let children = store.get_children("doc-2").await.unwrap();
    assert_eq!(children.pages.len(), 2);
    assert_eq!(children.stamps.len(), 1);
    assert_eq!(children.stamps[0].stamp_type.as_deref(), Some("SECRET"));

    let doc = store.find_by_any_id("doc-2").await.unwrap().unwrap();
    let keys: Vec<&str> = doc
        .normalized_dates
        .iter()
        .map(|e| e.original_text.as_str())
        .collect();
    assert_eq!(keys, vec!["1959", "1961"]);
    assert_eq!(
        doc.latest_date,
        Some(NaiveDate::from_ymd_opt(1961, 12, 31).unwrap())
    );
}

#[tokio::test]
async fn test_empty_payload_persists_defaults() {
    let mock = MockAnalysis::default();
    mock.reply("empty", MockReply::Json(json!({})));
    let (_tmp, _cfg, store, ingestor) = setup(&mock).await;

    let err = ingestor.force_update("empty", Some(1), None).await.unwrap_err();
    assert!(matches!(err, IngestError::Exhausted(_)));

    let doc = store.find_by_any_id("empty").await.unwrap().unwrap();
    assert_eq!(doc.page_count, 0);
    assert!(doc.all_names.is_empty());
    assert!(doc.normalized_dates.is_empty());
    assert_eq!(doc.processing_stage, ProcessingStage::WaitingForAnalysis);
    assert!(doc.processing_error.is_some());
}

#[tokio::test]
async fn test_exhausted_retries_report_last_error() {
    let mock = MockAnalysis::default();
    mock.reply("down", MockReply::Status(503));
    let (_tmp, _cfg, _store, ingestor) = setup(&mock).await;

    let err = ingestor.force_update("down", Some(3), None).await.unwrap_err();
    let IngestError::Exhausted(e) = err else {
        panic!("expected exhaustion");
    };
    assert_eq!(e.attempts, 3);
    assert_eq!(e.last_message(), "analysis unavailable for down");
    assert_eq!(mock.fetch_count("down"), 3);
}

#[tokio::test]
async fn test_kickoff_then_webhook_completion() {
    let mock = MockAnalysis::default();
    let (_tmp, _cfg, store, ingestor) = setup(&mock).await;

    let report = ingestor
        .kickoff(&KickoffRequest {
            document_id: "doc-3".into(),
            archive_id: Some("ARCH-3".into()),
            collection: Some("jfk".into()),
            steps: Some(vec!["ocr".into(), "entities".into()]),
        })
        .await
        .unwrap();
    assert_eq!(report.processing_stage, ProcessingStage::WaitingForAnalysis);
    let submits = mock.submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0].1, json!({ "steps": ["ocr", "entities"] }));

    ingestor
        .handle_webhook(&WebhookEvent {
            document_id: "ARCH-3".into(),
            status: Some("processing".into()),
            completed_steps: vec!["ocr".into()],
            error: None,
        })
        .await
        .unwrap();
    let doc = store.find_by_any_id("doc-3").await.unwrap().unwrap();
    assert_eq!(doc.completed_steps, vec!["ocr".to_string()]);

    mock.reply("doc-3", MockReply::Json(memo_payload()));
    let report = ingestor
        .handle_webhook(&WebhookEvent {
            document_id: "doc-3".into(),
            status: None,
            completed_steps: vec!["ocr".into(), "analysisComplete".into()],
            error: None,
        })
        .await
        .unwrap();
    assert!(report.processing_stage.is_ready());
    assert_eq!(mock.fetched_collections(), vec!["jfk".to_string()]);
}

#[tokio::test]
async fn test_resolve_by_old_id_in_sqlite() {
    let mock = MockAnalysis::default();
    let (_tmp, _cfg, store, _ingestor) = setup(&mock).await;

    let mut doc = Document::placeholder("primary-1", Utc::now());
    doc.old_id = Some("ABC123".into());
    store
        .save_document(&doc, &DocumentChildren::default(), WriteMode::Insert)
        .await
        .unwrap();

    let found = store.find_by_any_id("ABC123").await.unwrap().unwrap();
    assert_eq!(found.id, "primary-1");
    assert!(store
        .save_document(&doc, &DocumentChildren::default(), WriteMode::Insert)
        .await
        .is_err());
}

#[tokio::test]
async fn test_scan_and_repair_all() {
    let mock = MockAnalysis::default();
    let (_tmp, cfg, store, ingestor) = setup(&mock).await;

    // Claims five pages but has no page rows.
    let mut ghost = Document::placeholder("ghost", Utc::now());
    ghost.page_count = 5;
    ghost.content_json = Some("{}".into());
    store
        .save_document(&ghost, &DocumentChildren::default(), WriteMode::Insert)
        .await
        .unwrap();

    // Double-encoded content from an old migration.
    let mut legacy = Document::placeholder("legacy", Utc::now());
    legacy.content_json = Some("\"{\\\"title\\\":\\\"x\\\"}\"".into());
    store
        .save_document(&legacy, &DocumentChildren::default(), WriteMode::Insert)
        .await
        .unwrap();

    mock.reply("ghost", MockReply::Json(memo_payload()));

    let broken = repair::scan_for_broken(
        store.as_ref(),
        &cfg.repair.legacy_markers,
        cfg.store_timeout(),
    )
    .await
    .unwrap();
    assert_eq!(broken.len(), 2);
    assert_eq!(broken[0].document_id, "ghost");
    assert_eq!(broken[0].reason, BrokenReason::NoPageRows);
    assert_eq!(broken[1].reason, BrokenReason::LegacyContent);
    assert_eq!(mock.fetch_count("ghost"), 0);

    let report = repair::repair_all(&ingestor, Some(1)).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.broken, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    let ghost = report
        .results
        .iter()
        .find(|r| r.document_id == "ghost")
        .unwrap();
    assert_eq!(ghost.outcome, RepairOutcome::Repaired);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.documents, 2);
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.pages, 1);
}

#[tokio::test]
async fn test_status_self_heals_in_sqlite() {
    let mock = MockAnalysis::default();
    mock.reply("claims-done", MockReply::Json(memo_payload()));
    let (_tmp, _cfg, store, ingestor) = setup(&mock).await;

    let mut doc = Document::placeholder("claims-done", Utc::now());
    doc.analysis_complete = true;
    doc.processing_stage = ProcessingStage::Ready;
    doc.page_count = 4;
    store
        .save_document(&doc, &DocumentChildren::default(), WriteMode::Insert)
        .await
        .unwrap();

    let report = ingestor.status("claims-done").await.unwrap().unwrap();
    assert!(report.has_pages);
    assert_eq!(report.page_count, 1);
    assert_eq!(mock.fetch_count("claims-done"), 1);

    // Consistent now: a second read does not fetch.
    ingestor.status("claims-done").await.unwrap().unwrap();
    assert_eq!(mock.fetch_count("claims-done"), 1);
}
