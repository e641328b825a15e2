//! Database schema migrations (idempotent).

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an existing pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Entity arrays, normalized dates and completed steps are JSON arrays.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            archive_id TEXT,
            old_id TEXT,
            collection TEXT,
            title TEXT,
            summary TEXT,
            full_text TEXT,
            page_count INTEGER NOT NULL DEFAULT 0,
            all_names TEXT NOT NULL DEFAULT '[]',
            all_places TEXT NOT NULL DEFAULT '[]',
            all_dates TEXT NOT NULL DEFAULT '[]',
            all_objects TEXT NOT NULL DEFAULT '[]',
            earliest_date TEXT,
            latest_date TEXT,
            normalized_dates TEXT NOT NULL DEFAULT '[]',
            processing_stage TEXT NOT NULL DEFAULT 'waitingForAnalysis',
            last_processed INTEGER,
            analysis_complete INTEGER NOT NULL DEFAULT 0,
            has_handwritten_notes INTEGER NOT NULL DEFAULT 0,
            has_stamps INTEGER NOT NULL DEFAULT 0,
            has_full_text INTEGER NOT NULL DEFAULT 0,
            completed_steps TEXT NOT NULL DEFAULT '[]',
            processing_error TEXT,
            content_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            image_url TEXT,
            summary TEXT,
            full_text TEXT,
            names TEXT NOT NULL DEFAULT '[]',
            places TEXT NOT NULL DEFAULT '[]',
            dates TEXT NOT NULL DEFAULT '[]',
            objects TEXT NOT NULL DEFAULT '[]',
            has_image INTEGER NOT NULL DEFAULT 0,
            has_text INTEGER NOT NULL DEFAULT 0,
            UNIQUE(document_id, page_number),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS handwritten_notes (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            content TEXT NOT NULL,
            location TEXT,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_stamps (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            stamp_type TEXT,
            text TEXT NOT NULL,
            date TEXT,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_archive_id ON documents(archive_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_old_id ON documents(old_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_document_id ON pages(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_notes_document_id ON handwritten_notes(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stamps_document_id ON document_stamps(document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
