//! CLI entry points for the ingestion operations.
//!
//! Each command opens the configured database, runs one operation through
//! an [`Ingestor`] and prints the result as JSON on stdout.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::dates;
use crate::db;
use crate::ingest::{IngestError, Ingestor};
use crate::migrate;
use crate::repair;
use crate::sqlite_store::SqliteStore;

/// Connect and bring the schema up to date, so commands work on a fresh
/// database path.
async fn connect(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(pool)
}

async fn open(config: &Config) -> Result<(SqlitePool, Ingestor)> {
    let pool = connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let ingestor = Ingestor::with_http_source(store, config.clone())?;
    Ok((pool, ingestor))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Turn an ingestion failure into a CLI error carrying the message an HTTP
/// caller would see.
fn cli_error(err: IngestError) -> anyhow::Error {
    match err {
        IngestError::Exhausted(e) => anyhow::anyhow!(
            "update failed after {} attempt(s): {}",
            e.attempts,
            e.last_message()
        ),
        other => anyhow::anyhow!(other),
    }
}

/// `arx status <id>`
pub async fn run_status(config: &Config, id: &str) -> Result<()> {
    let (pool, ingestor) = open(config).await?;
    let result = ingestor.status(id).await;
    pool.close().await;

    match result.map_err(cli_error)? {
        Some(report) => print_json(&report),
        None => bail!("document not found: {}", id),
    }
}

/// `arx update <id>`: forced update, or finalize with `--finalize`.
pub async fn run_update(
    config: &Config,
    id: &str,
    retries: Option<u32>,
    collection: Option<String>,
    finalize: bool,
) -> Result<()> {
    let (pool, ingestor) = open(config).await?;
    let result = if finalize {
        ingestor.update_once(id, collection.as_deref(), true).await
    } else {
        ingestor
            .force_update(id, retries, collection.as_deref())
            .await
    };
    pool.close().await;

    print_json(&result.map_err(cli_error)?)
}

/// `arx repair`: one document, or every broken one with `--all`.
pub async fn run_repair(
    config: &Config,
    id: Option<String>,
    all: bool,
    force: bool,
    retries: Option<u32>,
) -> Result<()> {
    let (pool, ingestor) = open(config).await?;

    let result = match (id, all) {
        (Some(id), _) if force => ingestor
            .force_update(&id, retries, None)
            .await
            .map_err(cli_error)
            .and_then(|r| Ok(serde_json::to_value(r)?)),
        (Some(id), _) => repair::repair_document(&ingestor, &id, retries)
            .await
            .map_err(cli_error)
            .and_then(|(outcome, status)| {
                Ok(serde_json::json!({ "outcome": outcome, "status": status }))
            }),
        (None, true) => repair::repair_all(&ingestor, retries)
            .await
            .and_then(|r| Ok(serde_json::to_value(r)?)),
        (None, false) => Err(anyhow::anyhow!("pass a document id or --all")),
    };
    pool.close().await;

    print_json(&result?)
}

/// `arx scan`: list broken documents without changing anything.
pub async fn run_scan(config: &Config) -> Result<()> {
    let pool = connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let broken = repair::scan_for_broken(
        &store,
        &config.repair.legacy_markers,
        config.store_timeout(),
    )
    .await;
    pool.close().await;
    let broken = broken?;

    if broken.is_empty() {
        println!("no broken documents");
        return Ok(());
    }
    for b in &broken {
        println!("{:<40} {}", b.document_id, b.reason);
    }
    println!();
    println!("{} broken document(s)", broken.len());
    Ok(())
}

/// `arx dates <strings...>`: show how date strings normalize.
pub fn run_dates(raw: &[String]) -> Result<()> {
    let result = dates::normalize(raw);
    for entry in &result.entries {
        println!("{}  {}", entry.normalized_date, entry.original_text);
    }
    println!();
    println!(
        "earliest: {}",
        result
            .earliest
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "latest:   {}",
        result
            .latest
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if result.dropped > 0 {
        println!("dropped:  {}", result.dropped);
    }
    Ok(())
}
