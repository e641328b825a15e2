//! Ingestion operations shared by the HTTP server and the CLI.
//!
//! [`Ingestor`] composes identity resolution, the analysis source, the
//! reconciler and the status cache into the operations callers trigger:
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`kickoff`](Ingestor::kickoff) | Create the record if missing and submit steps to the service |
//! | [`update_once`](Ingestor::update_once) | One fetch + reconcile marking complete (force / finalize) |
//! | [`force_update`](Ingestor::force_update) | Bounded retry of fetch + reconcile |
//! | [`standard_repair`](Ingestor::standard_repair) | One fetch, reconcile only if complete |
//! | [`handle_webhook`](Ingestor::handle_webhook) | Force update or status-only update |
//! | [`status`](Ingestor::status) | Self-healing, cache-backed status read |

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::analysis::{AnalysisClient, AnalysisSource};
use crate::config::Config;
use crate::identity::{self, clean_id};
use crate::models::Document;
use crate::reconcile::Reconciler;
use crate::repair;
use crate::retry::{retry, RetryExhausted};
use crate::status::{StatusCache, StatusReport};
use crate::store::{bounded, StatusUpdate, Store};

/// Step reported by the service once analysis has finished.
pub const ANALYSIS_COMPLETE_STEP: &str = "analysisComplete";

/// Steps submitted on kickoff when the caller names none.
pub const DEFAULT_STEPS: [&str; 1] = ["analysis"];

/// Why one fetch + reconcile attempt did not produce a ready document.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpdateError {
    #[error("analysis unavailable for {0}")]
    Unavailable(String),
    #[error("analysis for {0} returned no pages")]
    Incomplete(String),
    #[error("analysis for {0} has no summary")]
    MissingSummary(String),
    #[error("persisting {id} failed: {reason}")]
    Persist { id: String, reason: String },
    #[error("{id} is still broken after repair: {reason}")]
    StillBroken { id: String, reason: String },
}

/// Failure of an ingestion operation, as surfaced to HTTP and CLI callers.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document id is empty")]
    EmptyId,
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("analysis service did not accept steps for {0}")]
    SubmitRejected(String),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Exhausted(#[from] RetryExhausted<UpdateError>),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Normal kickoff of the analysis pipeline for one document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickoffRequest {
    pub document_id: String,
    pub archive_id: Option<String>,
    pub collection: Option<String>,
    pub steps: Option<Vec<String>>,
}

/// Inbound notification from the analysis service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub document_id: String,
    pub status: Option<String>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    pub error: Option<String>,
}

impl WebhookEvent {
    pub fn is_analysis_complete(&self) -> bool {
        self.completed_steps
            .iter()
            .any(|s| s == ANALYSIS_COMPLETE_STEP)
    }
}

/// Entry point for every ingestion operation.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    source: Arc<dyn AnalysisSource>,
    reconciler: Reconciler,
    cache: StatusCache,
    config: Arc<Config>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn AnalysisSource>, config: Config) -> Self {
        let reconciler = Reconciler::new(store.clone(), config.store_timeout());
        let cache = StatusCache::from_config(&config.cache);
        Self {
            store,
            source,
            reconciler,
            cache,
            config: Arc::new(config),
        }
    }

    /// Ingestor talking to the configured HTTP analysis service.
    pub fn with_http_source(store: Arc<dyn Store>, config: Config) -> Result<Self> {
        let source = Arc::new(AnalysisClient::new(&config.analysis)?);
        Ok(Self::new(store, source, config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn store_timeout(&self) -> Duration {
        self.config.store_timeout()
    }

    fn checked_id(raw: &str) -> Result<String, IngestError> {
        let id = clean_id(raw);
        if id.is_empty() {
            return Err(IngestError::EmptyId);
        }
        Ok(id)
    }

    pub(crate) async fn find(&self, id: &str) -> Result<Option<Document>> {
        bounded(
            self.store_timeout(),
            "resolve",
            identity::resolve(self.store.as_ref(), id),
        )
        .await
    }

    /// A record with the number of page rows stored for it.
    pub(crate) async fn find_with_rows(&self, id: &str) -> Result<Option<(Document, i64)>> {
        let Some(doc) = self.find(id).await? else {
            return Ok(None);
        };
        let rows = bounded(
            self.store_timeout(),
            "count pages",
            self.store.count_pages(&doc.id),
        )
        .await?;
        Ok(Some((doc, rows)))
    }

    /// Collection to query: explicit override, else the record's, else the
    /// configured default.
    async fn collection_for(&self, id: &str, requested: Option<&str>) -> Result<String> {
        if let Some(c) = requested.filter(|c| !c.trim().is_empty()) {
            return Ok(c.to_string());
        }
        let recorded = self.find(id).await?.and_then(|d| d.collection);
        Ok(recorded.unwrap_or_else(|| self.config.analysis.collection.clone()))
    }

    /// Status report for a stored record, read fresh from the store.
    pub async fn report_for(&self, doc: &Document) -> Result<StatusReport> {
        let rows = bounded(
            self.store_timeout(),
            "count pages",
            self.store.count_pages(&doc.id),
        )
        .await?;
        let report = StatusReport::from_document(doc, rows);
        self.cache.insert(&report).await;
        Ok(report)
    }

    async fn report_by_id(&self, id: &str) -> Result<StatusReport, IngestError> {
        let doc = self
            .find(id)
            .await?
            .ok_or_else(|| IngestError::NotFound(id.to_string()))?;
        Ok(self.report_for(&doc).await?)
    }

    // ============ Kickoff ============

    /// Create the record if it is new, then submit `steps` to the service.
    pub async fn kickoff(&self, request: &KickoffRequest) -> Result<StatusReport, IngestError> {
        let id = Self::checked_id(&request.document_id)?;
        let collection = request
            .collection
            .clone()
            .filter(|c| !c.trim().is_empty());

        let doc = match self.find(&id).await? {
            Some(doc) => doc,
            None => {
                let mut doc = Document::placeholder(&id, Utc::now());
                doc.archive_id = request
                    .archive_id
                    .as_deref()
                    .map(clean_id)
                    .filter(|a| !a.is_empty());
                doc.collection = Some(
                    collection
                        .clone()
                        .unwrap_or_else(|| self.config.analysis.collection.clone()),
                );
                let created = bounded(
                    self.store_timeout(),
                    "insert",
                    self.store.insert_placeholder(&doc),
                )
                .await?;
                if created {
                    tracing::info!(document_id = %id, "document created");
                }
                doc
            }
        };

        let steps: Vec<String> = match &request.steps {
            Some(steps) if !steps.is_empty() => steps.clone(),
            _ => DEFAULT_STEPS.iter().map(|s| s.to_string()).collect(),
        };
        let collection = collection
            .or_else(|| doc.collection.clone())
            .unwrap_or_else(|| self.config.analysis.collection.clone());

        if !self.source.submit(&doc.id, &collection, &steps).await {
            return Err(IngestError::SubmitRejected(doc.id));
        }
        Ok(self.report_for(&doc).await?)
    }

    // ============ Forced updates ============

    /// One fetch and one reconcile marking the document complete.
    ///
    /// With `finalize`, the payload must also carry a summary.
    pub async fn update_once(
        &self,
        document_id: &str,
        collection: Option<&str>,
        finalize: bool,
    ) -> Result<StatusReport, IngestError> {
        let id = Self::checked_id(document_id)?;
        let collection = self.collection_for(&id, collection).await?;
        let doc = self.attempt_update(&id, &collection, finalize).await?;
        Ok(self.report_for(&doc).await?)
    }

    /// Fetch + reconcile up to `attempts` times (configured default when
    /// `None`). On exhaustion the last attempt's error is returned.
    pub async fn force_update(
        &self,
        document_id: &str,
        attempts: Option<u32>,
        collection: Option<&str>,
    ) -> Result<StatusReport, IngestError> {
        let id = Self::checked_id(document_id)?;
        let collection = self.collection_for(&id, collection).await?;
        let policy = self.config.analysis.retry_policy(attempts);

        let doc = retry(&policy, |attempt| {
            tracing::debug!(document_id = %id, attempt, "force update attempt");
            self.attempt_update(&id, &collection, false)
        })
        .await
        .map_err(|e| {
            tracing::warn!(document_id = %id, attempts = e.attempts, error = %e.last, "force update exhausted");
            e
        })?;

        Ok(self.report_for(&doc).await?)
    }

    async fn attempt_update(
        &self,
        id: &str,
        collection: &str,
        require_summary: bool,
    ) -> Result<Document, UpdateError> {
        let payload = self
            .source
            .fetch(id, collection)
            .await
            .ok_or_else(|| UpdateError::Unavailable(id.to_string()))?;

        if require_summary && !payload.is_finalizable() {
            return Err(if payload.is_complete() {
                UpdateError::MissingSummary(id.to_string())
            } else {
                UpdateError::Incomplete(id.to_string())
            });
        }

        // Partial data is still persisted so the record reflects the latest
        // analysis; the attempt only counts as a success once ready.
        let doc = self
            .reconciler
            .try_reconcile(id, &payload, true)
            .await
            .map_err(|e| UpdateError::Persist {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        if !doc.processing_stage.is_ready() {
            return Err(UpdateError::Incomplete(id.to_string()));
        }
        Ok(doc)
    }

    // ============ Repair ============

    /// One fetch; reconcile marking complete only if the payload is
    /// complete. Returns whether the record was repaired.
    pub async fn standard_repair(&self, document_id: &str) -> Result<bool, IngestError> {
        let id = Self::checked_id(document_id)?;
        let collection = self.collection_for(&id, None).await?;

        let Some(payload) = self.source.fetch(&id, &collection).await else {
            return Ok(false);
        };
        if !payload.is_complete() {
            tracing::debug!(document_id = %id, "standard repair: payload incomplete");
            return Ok(false);
        }
        Ok(self.reconciler.reconcile(&id, &payload, true).await)
    }

    // ============ Webhook ============

    /// Apply a notification from the analysis service.
    ///
    /// Completion triggers a forced update with the configured retry count.
    /// Anything else only records the reported steps and error, creating
    /// the record when it is unknown.
    pub async fn handle_webhook(&self, event: &WebhookEvent) -> Result<StatusReport, IngestError> {
        let id = Self::checked_id(&event.document_id)?;

        if event.is_analysis_complete() {
            tracing::info!(document_id = %id, "webhook: analysis complete");
            return self.force_update(&id, None, None).await;
        }

        let now = Utc::now();
        let processing_error = event.error.clone().or_else(|| match event.status.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("failed") || s.eq_ignore_ascii_case("error") => {
                Some(format!("analysis reported status '{}'", s))
            }
            _ => None,
        });
        let update = StatusUpdate {
            completed_steps: event.completed_steps.clone(),
            processing_error,
            updated_at: now,
        };

        let doc = match self.find(&id).await? {
            Some(doc) => doc,
            None => {
                let mut doc = Document::placeholder(&id, now);
                doc.collection = Some(self.config.analysis.collection.clone());
                bounded(
                    self.store_timeout(),
                    "insert",
                    self.store.insert_placeholder(&doc),
                )
                .await?;
                tracing::info!(document_id = %id, "document created from webhook");
                doc
            }
        };

        bounded(
            self.store_timeout(),
            "status update",
            self.store.update_status(&doc.id, &update),
        )
        .await?;
        tracing::info!(
            document_id = %doc.id,
            status = event.status.as_deref().unwrap_or(""),
            steps = ?event.completed_steps,
            "webhook: status recorded"
        );

        self.report_by_id(&doc.id).await
    }

    // ============ Status ============

    /// Current status of a document, or `None` if it is unknown.
    ///
    /// A record claiming completion that [`repair::classify`] flags is
    /// reconciled before answering. When the store cannot be read, the last
    /// cached report is served with `cached: true`.
    pub async fn status(&self, document_id: &str) -> Result<Option<StatusReport>, IngestError> {
        let id = Self::checked_id(document_id)?;
        let report = self
            .cache
            .read_through(&id, || self.load_status(&id))
            .await?;
        Ok(report)
    }

    async fn load_status(&self, id: &str) -> Result<Option<StatusReport>> {
        let Some((doc, rows)) = self.find_with_rows(id).await? else {
            return Ok(None);
        };

        if doc.analysis_complete {
            let health = repair::health_of(&doc, rows);
            if let Some(reason) = repair::classify(&health, &self.config.repair.legacy_markers) {
                tracing::info!(document_id = %doc.id, %reason, "status: healing inconsistent record");
                match self.standard_repair(&doc.id).await {
                    Ok(true) => {
                        if let Some((healed, rows)) = self.find_with_rows(&doc.id).await? {
                            return Ok(Some(StatusReport::from_document(&healed, rows)));
                        }
                    }
                    Ok(false) => {
                        tracing::warn!(document_id = %doc.id, "status: self-heal found no complete analysis")
                    }
                    Err(e) => tracing::warn!(document_id = %doc.id, error = %e, "status: self-heal failed"),
                }
            }
        }

        Ok(Some(StatusReport::from_document(&doc, rows)))
    }
}
