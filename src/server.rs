//! HTTP API over the ingestion operations.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/process` | Kickoff, forced update, finalize, or broken-document listing |
//! | `PATCH` | `/repair` | Repair one document or every broken one |
//! | `PUT` | `/webhook` | Notification from the analysis service |
//! | `GET` | `/status?id=` | Status report (self-healing) |
//! | `HEAD` | `/status?id=` | Same check; report in the `x-document-status` header |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "upstream_failed", "message": "analysis unavailable for 104-10003-10041" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `upstream_failed` (502),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front-ends
//! can poll status directly.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::ingest::{IngestError, Ingestor, KickoffRequest, WebhookEvent};
use crate::migrate;
use crate::repair::{self, BrokenDocument, RepairOutcome};
use crate::sqlite_store::SqliteStore;
use crate::status::StatusReport;

/// Header carrying the JSON status report on `HEAD /status`.
pub const STATUS_HEADER: &str = "x-document-status";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    ingestor: Ingestor,
}

/// Start the HTTP server on `[server].bind` against the configured SQLite
/// database and analysis service. Runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let ingestor = Ingestor::with_http_source(store, config.clone())?;

    let bind_addr = config.server.bind.clone();
    let app = build_router(ingestor);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

/// Router with every endpoint, bound to `ingestor`.
pub fn build_router(ingestor: Ingestor) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/process", post(handle_process))
        .route("/repair", patch(handle_repair))
        .route("/webhook", put(handle_webhook))
        .route("/status", get(handle_status).head(handle_status_head))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { ingestor })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn upstream_failed(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream_failed".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::EmptyId => bad_request(err.to_string()),
            IngestError::NotFound(_) => not_found(err.to_string()),
            IngestError::SubmitRejected(_) | IngestError::Update(_) => {
                upstream_failed(err.to_string())
            }
            IngestError::Exhausted(e) => upstream_failed(e.last_message()),
            IngestError::Store(e) => internal(format!("{:#}", e)),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal(format!("{:#}", err))
    }
}

fn required_id(id: Option<String>) -> Result<String, AppError> {
    id.filter(|s| !s.trim().is_empty())
        .ok_or_else(|| bad_request("documentId must not be empty"))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /process ============

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProcessRequest {
    document_id: Option<String>,
    archive_id: Option<String>,
    steps: Option<Vec<String>>,
    find_broken_only: bool,
    force_data_update: bool,
    process_type: Option<String>,
    collection: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BrokenListResponse {
    broken_documents: Vec<BrokenDocument>,
    count: usize,
}

/// `findBrokenOnly` lists broken documents without touching them.
/// `forceDataUpdate` or `processType = "finalize"` runs one fetch and
/// reconcile. Anything else is a normal kickoff answered with 202.
async fn handle_process(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> Result<Response, AppError> {
    let ingestor = &state.ingestor;

    if req.find_broken_only {
        let broken = repair::scan_for_broken(
            ingestor.store().as_ref(),
            &ingestor.config().repair.legacy_markers,
            ingestor.config().store_timeout(),
        )
        .await?;
        let count = broken.len();
        return Ok(Json(BrokenListResponse {
            broken_documents: broken,
            count,
        })
        .into_response());
    }

    let document_id = required_id(req.document_id)?;
    let finalize = req
        .process_type
        .as_deref()
        .map(|t| t.eq_ignore_ascii_case("finalize"))
        .unwrap_or(false);

    if req.force_data_update || finalize {
        let report = ingestor
            .update_once(&document_id, req.collection.as_deref(), finalize)
            .await?;
        return Ok(Json(report).into_response());
    }

    let report = ingestor
        .kickoff(&KickoffRequest {
            document_id,
            archive_id: req.archive_id,
            collection: req.collection,
            steps: req.steps,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(report)).into_response())
}

// ============ PATCH /repair ============

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RepairRequest {
    document_id: Option<String>,
    repair_all_broken: bool,
    force_data_update: bool,
    retry_count: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RepairDocumentResponse {
    outcome: RepairOutcome,
    status: StatusReport,
}

async fn handle_repair(
    State(state): State<AppState>,
    Json(req): Json<RepairRequest>,
) -> Result<Response, AppError> {
    let ingestor = &state.ingestor;

    match req.document_id.filter(|s| !s.trim().is_empty()) {
        Some(id) if req.force_data_update => {
            let report = ingestor.force_update(&id, req.retry_count, None).await?;
            Ok(Json(RepairDocumentResponse {
                outcome: RepairOutcome::ForceRepaired,
                status: report,
            })
            .into_response())
        }
        Some(id) => {
            let (outcome, report) =
                repair::repair_document(ingestor, &id, req.retry_count).await?;
            Ok(Json(RepairDocumentResponse {
                outcome,
                status: report,
            })
            .into_response())
        }
        None if req.repair_all_broken => {
            let report = repair::repair_all(ingestor, req.retry_count).await?;
            Ok(Json(report).into_response())
        }
        None => Err(bad_request(
            "either documentId or repairAllBroken is required",
        )),
    }
}

// ============ PUT /webhook ============

async fn handle_webhook(
    State(state): State<AppState>,
    Json(event): Json<WebhookEvent>,
) -> Result<Json<StatusReport>, AppError> {
    let report = state.ingestor.handle_webhook(&event).await?;
    Ok(Json(report))
}

// ============ GET|HEAD /status ============

#[derive(Debug, Deserialize)]
struct StatusQuery {
    id: Option<String>,
}

async fn load_status(state: &AppState, query: StatusQuery) -> Result<StatusReport, AppError> {
    let id = required_id(query.id)?;
    state
        .ingestor
        .status(&id)
        .await?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))
}

async fn handle_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(load_status(&state, query).await?))
}

async fn handle_status_head(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<(StatusCode, HeaderMap), StatusCode> {
    let report = load_status(&state, query)
        .await
        .map_err(|e| e.status)?;
    let json = serde_json::to_string(&report).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let value = HeaderValue::from_str(&ascii_json(&json))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(STATUS_HEADER), value);
    Ok((StatusCode::OK, headers))
}

/// Escape everything outside printable ASCII as `\uXXXX` so the JSON is a
/// valid header value.
fn ascii_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if (' '..='~').contains(&c) {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}
