//! Shared helpers: a mock analysis service on an ephemeral port and
//! temporary configurations pointing at it.

#![allow(dead_code)]

use archive_sync::config::Config;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// What the mock returns for one document id.
#[derive(Clone)]
pub enum MockReply {
    Json(Value),
    Status(u16),
    Hang,
}

#[derive(Clone, Default)]
pub struct MockAnalysis {
    replies: Arc<Mutex<HashMap<String, MockReply>>>,
    fetches: Arc<Mutex<Vec<(String, String)>>>,
    submits: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockAnalysis {
    pub fn reply(&self, id: &str, reply: MockReply) {
        self.replies.lock().unwrap().insert(id.to_string(), reply);
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| d == id)
            .count()
    }

    pub fn fetched_collections(&self) -> Vec<String> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn submits(&self) -> Vec<(String, Value)> {
        self.submits.lock().unwrap().clone()
    }
}

async fn handle_fetch(
    State(mock): State<MockAnalysis>,
    Path((collection, id)): Path<(String, String)>,
) -> Response {
    mock.fetches.lock().unwrap().push((collection, id.clone()));
    let reply = mock.replies.lock().unwrap().get(&id).cloned();
    match reply {
        Some(MockReply::Json(v)) => Json(v).into_response(),
        Some(MockReply::Status(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        Some(MockReply::Hang) => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            StatusCode::OK.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_submit(
    State(mock): State<MockAnalysis>,
    Path((_collection, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    mock.submits.lock().unwrap().push((id, body));
    Json(json!({ "accepted": true }))
}

/// Start the mock on a free port. Returns its base URL.
pub async fn start_mock(mock: MockAnalysis) -> String {
    let app = Router::new()
        .route(
            "/collections/{collection}/documents/{id}",
            get(handle_fetch),
        )
        .route(
            "/collections/{collection}/documents/{id}/process",
            post(handle_submit),
        )
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

pub fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Fast-failing configuration with its database in `tmp`.
pub fn test_config(tmp: &TempDir, base_url: &str) -> Config {
    let mut cfg = Config::minimal(tmp.path().join("data/archive.sqlite"), base_url);
    cfg.analysis.timeout_secs = 1;
    cfg.analysis.backoff_ms = 0;
    cfg.analysis.max_retries = 2;
    cfg
}

pub fn memo_payload() -> Value {
    json!({
        "title": "Memo",
        "summary": "S",
        "pages": [{ "fullText": "x" }],
        "allDates": ["21 May 1982"]
    })
}
