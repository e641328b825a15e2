//! Merge a fetched analysis payload into persisted state.
//!
//! A reconciliation is a full overwrite of content: scalars are re-derived
//! from the payload and every child row (pages, handwritten notes, stamps)
//! is replaced. Running it twice with the same payload leaves the same
//! observable record, so callers may retry freely.
//!
//! Steps, in order:
//!
//! 1. Clean the id and resolve the existing record (any id scheme).
//! 2. Normalize `allDates` into the timeline.
//! 3. Populate scalars and derive the step flags and processing stage.
//! 4. Build the replacement children.
//! 5. Write document and children in one transaction, under a timeout.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::AnalysisPayload;
use crate::dates;
use crate::identity::{self, clean_id};
use crate::models::{
    Document, DocumentChildren, DocumentStamp, HandwrittenNote, Page, ProcessingStage,
};
use crate::store::{bounded, Store, WriteMode};

/// Recorded when completion is requested for a payload without pages.
pub const NO_PAGES_ERROR: &str = "analysis marked complete but returned no pages";

/// Writes analysis payloads into a [`Store`].
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    store_timeout: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Reconcile `payload` into the document identified by `document_id`.
    ///
    /// Returns `true` only when the write committed. Failures are logged.
    pub async fn reconcile(
        &self,
        document_id: &str,
        payload: &AnalysisPayload,
        mark_complete: bool,
    ) -> bool {
        match self.try_reconcile(document_id, payload, mark_complete).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(document_id, error = %e, "reconcile failed");
                false
            }
        }
    }

    /// Like [`reconcile`](Self::reconcile) but returns the written record
    /// or the error that prevented the write.
    pub async fn try_reconcile(
        &self,
        document_id: &str,
        payload: &AnalysisPayload,
        mark_complete: bool,
    ) -> Result<Document> {
        let id = clean_id(document_id);
        if id.is_empty() {
            return Err(anyhow!("document id is empty"));
        }

        let existing = bounded(
            self.store_timeout,
            "resolve",
            identity::resolve(self.store.as_ref(), &id),
        )
        .await?;

        let now = Utc::now();
        let (mut doc, mode) = match existing {
            Some(doc) => (doc, WriteMode::Update),
            None => (Document::placeholder(&id, now), WriteMode::Insert),
        };

        let children = build_children(&doc.id, payload);
        apply_payload(&mut doc, payload, children.pages.len(), mark_complete);
        doc.last_processed = Some(now);
        doc.updated_at = now;
        doc.content_json = Some(serde_json::to_string(payload)?);

        bounded(
            self.store_timeout,
            "save",
            self.store.save_document(&doc, &children, mode),
        )
        .await?;

        tracing::info!(
            document_id = %doc.id,
            stage = %doc.processing_stage,
            pages = children.pages.len(),
            notes = children.handwritten_notes.len(),
            stamps = children.stamps.len(),
            "reconciled"
        );
        Ok(doc)
    }
}

/// Overwrite content fields of `doc` from `payload` and re-derive flags.
fn apply_payload(
    doc: &mut Document,
    payload: &AnalysisPayload,
    page_rows: usize,
    mark_complete: bool,
) {
    let timeline = dates::normalize(&payload.all_dates);
    if timeline.dropped > 0 {
        tracing::debug!(
            document_id = %doc.id,
            dropped = timeline.dropped,
            "unparseable dates dropped"
        );
    }

    doc.title = payload.title.clone();
    doc.summary = payload.summary.clone();
    doc.full_text = payload.full_text.clone();
    doc.page_count = derive_page_count(payload.page_count, page_rows, mark_complete);
    doc.all_names = payload.all_names.clone();
    doc.all_places = payload.all_places.clone();
    doc.all_dates = payload.all_dates.clone();
    doc.all_objects = payload.all_objects.clone();
    doc.earliest_date = timeline.earliest;
    doc.latest_date = timeline.latest;
    doc.normalized_dates = timeline.entries;

    doc.has_handwritten_notes = !payload.handwritten_notes.is_empty();
    doc.has_stamps = !payload.stamps.is_empty();
    doc.has_full_text = non_blank(payload.full_text.as_deref());

    doc.processing_stage = ProcessingStage::derive(mark_complete, page_rows);
    doc.analysis_complete = doc.processing_stage.is_ready();
    if doc.analysis_complete {
        doc.processing_error = None;
    } else if mark_complete {
        doc.processing_error = Some(NO_PAGES_ERROR.to_string());
    }
}

/// Page count to persist.
///
/// A completed record always reports its page rows. Otherwise an explicit
/// non-negative count from the payload wins.
fn derive_page_count(explicit: Option<i64>, page_rows: usize, mark_complete: bool) -> i64 {
    let rows = page_rows as i64;
    if mark_complete && rows > 0 {
        if let Some(n) = explicit.filter(|n| *n != rows) {
            tracing::debug!(explicit = n, rows, "payload page count disagrees with pages");
        }
        return rows;
    }
    explicit.filter(|n| *n >= 0).unwrap_or(rows)
}

/// Page numbers for `pages`, one per page.
///
/// The first page claiming a positive number keeps it. Every other page
/// takes the smallest free number at or after its 1-based position.
fn assign_page_numbers(pages: &[Option<i64>]) -> Vec<i64> {
    let mut used = HashSet::new();
    let mut numbers: Vec<Option<i64>> = pages
        .iter()
        .map(|n| n.filter(|n| *n > 0 && used.insert(*n)))
        .collect();

    for (index, slot) in numbers.iter_mut().enumerate() {
        if slot.is_none() {
            let mut candidate = index as i64 + 1;
            while !used.insert(candidate) {
                candidate += 1;
            }
            *slot = Some(candidate);
        }
    }
    numbers.into_iter().flatten().collect()
}

/// Replacement child rows for `doc_id`, one page per payload page.
fn build_children(doc_id: &str, payload: &AnalysisPayload) -> DocumentChildren {
    let requested: Vec<Option<i64>> = payload.pages.iter().map(|p| p.page_number).collect();
    let numbers = assign_page_numbers(&requested);

    let mut pages: Vec<Page> = Vec::with_capacity(payload.pages.len());
    for (p, number) in payload.pages.iter().zip(numbers) {
        pages.push(Page {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: doc_id.to_string(),
            page_number: number,
            image_url: p.image_url.clone(),
            summary: p.summary.clone(),
            full_text: p.full_text.clone(),
            names: p.names.clone(),
            places: p.places.clone(),
            dates: p.dates.clone(),
            objects: p.objects.clone(),
            has_image: non_blank(p.image_url.as_deref()),
            has_text: non_blank(p.full_text.as_deref()),
        });
    }
    pages.sort_by_key(|p| p.page_number);

    let handwritten_notes = payload
        .handwritten_notes
        .iter()
        .map(|n| HandwrittenNote {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: doc_id.to_string(),
            page_number: n.page_number.unwrap_or(1),
            content: n.content.clone().unwrap_or_default(),
            location: n.location.clone(),
        })
        .collect();

    let stamps = payload
        .stamps
        .iter()
        .map(|s| DocumentStamp {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: doc_id.to_string(),
            page_number: s.page_number.unwrap_or(1),
            stamp_type: s.stamp_type.clone(),
            text: s.text.clone().unwrap_or_default(),
            date: s.date.clone(),
        })
        .collect();

    DocumentChildren {
        pages,
        handwritten_notes,
        stamps,
    }
}

fn non_blank(value: Option<&str>) -> bool {
    value.map(|s| !s.trim().is_empty()).unwrap_or(false)
}
