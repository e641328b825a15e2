//! Core data models used throughout the engine.
//!
//! A [`Document`] exclusively owns its [`Page`], [`HandwrittenNote`] and
//! [`DocumentStamp`] rows; those are always written together as a
//! [`DocumentChildren`] set.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing stage of a document.
///
/// `Ready` is terminal and only reachable through a reconciliation that
/// marks the document complete. Failures never leave this enum; they are
/// reported through `processing_error` so the document stays retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessingStage {
    #[default]
    #[serde(rename = "waitingForAnalysis")]
    WaitingForAnalysis,
    #[serde(rename = "ready")]
    Ready,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::WaitingForAnalysis => "waitingForAnalysis",
            ProcessingStage::Ready => "ready",
        }
    }

    /// Parse a persisted value; anything unknown is `WaitingForAnalysis`.
    pub fn parse(value: &str) -> Self {
        match value {
            "ready" => ProcessingStage::Ready,
            _ => ProcessingStage::WaitingForAnalysis,
        }
    }

    /// Stage produced by a reconciliation.
    ///
    /// Completion has to be requested and backed by at least one page.
    pub fn derive(mark_complete: bool, page_count: usize) -> Self {
        if mark_complete && page_count > 0 {
            ProcessingStage::Ready
        } else {
            ProcessingStage::WaitingForAnalysis
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ProcessingStage::Ready)
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One original date string and the calendar date it normalized to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub original_text: String,
    pub normalized_date: NaiveDate,
}

/// Canonical record for one archive file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub archive_id: Option<String>,
    pub old_id: Option<String>,
    pub collection: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub full_text: Option<String>,
    pub page_count: i64,
    pub all_names: Vec<String>,
    pub all_places: Vec<String>,
    pub all_dates: Vec<String>,
    pub all_objects: Vec<String>,
    pub earliest_date: Option<NaiveDate>,
    pub latest_date: Option<NaiveDate>,
    pub normalized_dates: Vec<TimelineEntry>,
    pub processing_stage: ProcessingStage,
    pub last_processed: Option<DateTime<Utc>>,
    pub analysis_complete: bool,
    pub has_handwritten_notes: bool,
    pub has_stamps: bool,
    pub has_full_text: bool,
    pub completed_steps: Vec<String>,
    pub processing_error: Option<String>,
    /// Serialized analysis payload last reconciled into this record.
    #[serde(skip)]
    pub content_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A fresh record waiting for analysis, as created on first sighting.
    pub fn placeholder(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            archive_id: None,
            old_id: None,
            collection: None,
            title: None,
            summary: None,
            full_text: None,
            page_count: 0,
            all_names: Vec::new(),
            all_places: Vec::new(),
            all_dates: Vec::new(),
            all_objects: Vec::new(),
            earliest_date: None,
            latest_date: None,
            normalized_dates: Vec::new(),
            processing_stage: ProcessingStage::WaitingForAnalysis,
            last_processed: None,
            analysis_complete: false,
            has_handwritten_notes: false,
            has_stamps: false,
            has_full_text: false,
            completed_steps: Vec::new(),
            processing_error: None,
            content_json: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_summary(&self) -> bool {
        self.summary
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub document_id: String,
    pub page_number: i64,
    pub image_url: Option<String>,
    pub summary: Option<String>,
    pub full_text: Option<String>,
    pub names: Vec<String>,
    pub places: Vec<String>,
    pub dates: Vec<String>,
    pub objects: Vec<String>,
    pub has_image: bool,
    pub has_text: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandwrittenNote {
    pub id: String,
    pub document_id: String,
    pub page_number: i64,
    pub content: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStamp {
    pub id: String,
    pub document_id: String,
    pub page_number: i64,
    pub stamp_type: Option<String>,
    pub text: String,
    pub date: Option<String>,
}

/// The full set of rows owned by one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChildren {
    pub pages: Vec<Page>,
    pub handwritten_notes: Vec<HandwrittenNote>,
    pub stamps: Vec<DocumentStamp>,
}

/// Structural facts about one document, as read by the repair scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentHealth {
    pub id: String,
    pub page_count: i64,
    pub page_rows: i64,
    pub analysis_complete: bool,
    /// Leading characters of the stored content blob.
    pub content_prefix: Option<String>,
}
