//! Client for the external analysis (OCR / entity extraction) service.
//!
//! The service returns loosely shaped JSON. It is typed exactly once here,
//! into [`AnalysisPayload`]: every field has a default, arrays that are
//! missing or of the wrong type become empty, and array elements of the
//! wrong shape are dropped. Downstream code never re-checks shapes.
//!
//! # Failure model
//!
//! [`AnalysisSource::fetch`] never errors. Timeouts, transport failures,
//! non-2xx statuses and unparseable bodies are logged and turned into
//! `None`; retrying is the caller's decision.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | fetch | `GET {base}/collections/{collection}/documents/{id}?fields=...&detail=full` |
//! | submit | `POST {base}/collections/{collection}/documents/{id}/process` |

use async_trait::async_trait;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::config::AnalysisConfig;
use crate::identity::clean_id;

/// Fields requested from the service; everything it can return.
pub const REQUESTED_FIELDS: &str = "title,summary,fullText,pageCount,allNames,allPlaces,allDates,\
allObjects,pages,handwrittenNotes,stamps";

// ============ Payload ============

/// Analysis result for one document, with defaults for every field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisPayload {
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub full_text: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub page_count: Option<i64>,
    #[serde(deserialize_with = "lenient_strings")]
    pub all_names: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub all_places: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub all_dates: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub all_objects: Vec<String>,
    #[serde(deserialize_with = "lenient_vec")]
    pub pages: Vec<PagePayload>,
    #[serde(deserialize_with = "lenient_vec")]
    pub handwritten_notes: Vec<NotePayload>,
    #[serde(deserialize_with = "lenient_vec")]
    pub stamps: Vec<StampPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PagePayload {
    #[serde(deserialize_with = "lenient_i64")]
    pub page_number: Option<i64>,
    #[serde(alias = "image", deserialize_with = "lenient_string")]
    pub image_url: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub full_text: Option<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub names: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub places: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub dates: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotePayload {
    #[serde(deserialize_with = "lenient_i64")]
    pub page_number: Option<i64>,
    #[serde(alias = "text", deserialize_with = "lenient_string")]
    pub content: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StampPayload {
    #[serde(deserialize_with = "lenient_i64")]
    pub page_number: Option<i64>,
    #[serde(alias = "type", deserialize_with = "lenient_string")]
    pub stamp_type: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub text: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub date: Option<String>,
}

impl AnalysisPayload {
    /// Type an arbitrary JSON value. Non-objects yield `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// Enough data to mark a document ready: at least one page.
    pub fn is_complete(&self) -> bool {
        !self.pages.is_empty()
    }

    /// Complete and carrying a non-blank summary, as finalization requires.
    pub fn is_finalizable(&self) -> bool {
        self.is_complete()
            && self
                .summary
                .as_deref()
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false)
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_strings<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .filter(Value::is_object)
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        _ => Vec::new(),
    })
}

// ============ Source trait ============

/// Access to the analysis service.
#[async_trait]
pub trait AnalysisSource: Send + Sync {
    /// Latest analysis for `document_id`, or `None` if it could not be obtained.
    async fn fetch(&self, document_id: &str, collection: &str) -> Option<AnalysisPayload>;

    /// Ask the service to run `steps` for a document. Returns whether the
    /// request was accepted.
    async fn submit(&self, document_id: &str, collection: &str, steps: &[String]) -> bool;
}

/// Why a fetch produced nothing. Logged, never returned to callers.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("analysis service returned {0}: {1}")]
    Status(u16, String),
    #[error("response is not a JSON object: {0}")]
    Parse(String),
}

// ============ HTTP client ============

/// [`AnalysisSource`] backed by the real HTTP service.
pub struct AnalysisClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    api_key: Option<String>,
}

impl AnalysisClient {
    pub fn new(config: &AnalysisConfig) -> anyhow::Result<Self> {
        let timeout = config.timeout();
        let http = reqwest::Client::builder()
            .user_agent(concat!("archive-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            api_key,
        })
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/collections/{}/documents/{}",
            self.base_url, collection, id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn try_fetch(&self, id: &str, collection: &str) -> Result<AnalysisPayload, FetchError> {
        let request = self
            .http
            .get(self.document_url(collection, id))
            .query(&[("fields", REQUESTED_FIELDS), ("detail", "full")]);

        // reqwest's own timeout covers the body too; the outer one also
        // bounds connection setup on exotic resolvers.
        let response = tokio::time::timeout(self.timeout, self.authorize(request).send())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status(status.as_u16(), body));
        }

        let value: Value = tokio::time::timeout(self.timeout, response.json::<Value>())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        AnalysisPayload::from_value(value)
            .ok_or_else(|| FetchError::Parse("expected an object".to_string()))
    }
}

fn classify_reqwest_error(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::Network(e.to_string())
    }
}

#[async_trait]
impl AnalysisSource for AnalysisClient {
    async fn fetch(&self, document_id: &str, collection: &str) -> Option<AnalysisPayload> {
        let id = clean_id(document_id);
        match self.try_fetch(&id, collection).await {
            Ok(payload) => {
                tracing::debug!(
                    document_id = %id,
                    collection,
                    pages = payload.pages.len(),
                    "fetched analysis"
                );
                Some(payload)
            }
            Err(e) => {
                tracing::warn!(document_id = %id, collection, error = %e, "analysis fetch failed");
                None
            }
        }
    }

    async fn submit(&self, document_id: &str, collection: &str, steps: &[String]) -> bool {
        let id = clean_id(document_id);
        let request = self
            .http
            .post(format!("{}/process", self.document_url(collection, &id)))
            .json(&serde_json::json!({ "steps": steps }));

        match tokio::time::timeout(self.timeout, self.authorize(request).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                tracing::info!(document_id = %id, collection, ?steps, "analysis submitted");
                true
            }
            Ok(Ok(resp)) => {
                tracing::warn!(document_id = %id, status = %resp.status(), "analysis submit rejected");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(document_id = %id, error = %e, "analysis submit failed");
                false
            }
            Err(_) => {
                tracing::warn!(document_id = %id, timeout = ?self.timeout, "analysis submit timed out");
                false
            }
        }
    }
}
