//! SQLite-backed [`Store`] implementation.
//!
//! JSON-array columns hold the entity lists; dates are `YYYY-MM-DD` text
//! and timestamps are Unix seconds.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::models::{
    Document, DocumentChildren, DocumentHealth, DocumentStamp, HandwrittenNote, Page,
    ProcessingStage, TimelineEntry,
};
use crate::store::{StatusUpdate, Store, StoreStats, WriteMode};

const DOCUMENT_COLUMNS: &str = "id, archive_id, old_id, collection, title, summary, full_text, \
     page_count, all_names, all_places, all_dates, all_objects, earliest_date, latest_date, \
     normalized_dates, processing_stage, last_processed, analysis_complete, \
     has_handwritten_notes, has_stamps, has_full_text, completed_steps, processing_error, \
     content_json, created_at, updated_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn parse_date(raw: Option<String>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn document_from_row(row: &SqliteRow) -> Document {
    let stage: String = row.get("processing_stage");
    let normalized: Vec<TimelineEntry> = from_json(row.get("normalized_dates"));
    let last_processed: Option<i64> = row.get("last_processed");

    Document {
        id: row.get("id"),
        archive_id: row.get("archive_id"),
        old_id: row.get("old_id"),
        collection: row.get("collection"),
        title: row.get("title"),
        summary: row.get("summary"),
        full_text: row.get("full_text"),
        page_count: row.get("page_count"),
        all_names: from_json(row.get("all_names")),
        all_places: from_json(row.get("all_places")),
        all_dates: from_json(row.get("all_dates")),
        all_objects: from_json(row.get("all_objects")),
        earliest_date: parse_date(row.get("earliest_date")),
        latest_date: parse_date(row.get("latest_date")),
        normalized_dates: normalized,
        processing_stage: ProcessingStage::parse(&stage),
        last_processed: last_processed.map(from_ts),
        analysis_complete: row.get("analysis_complete"),
        has_handwritten_notes: row.get("has_handwritten_notes"),
        has_stamps: row.get("has_stamps"),
        has_full_text: row.get("has_full_text"),
        completed_steps: from_json(row.get("completed_steps")),
        processing_error: row.get("processing_error"),
        content_json: row.get("content_json"),
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    }
}

/// Bind every document column, in [`DOCUMENT_COLUMNS`] order.
fn bind_document<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    doc: &'q Document,
    json: &'q DocumentJson,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&doc.id)
        .bind(&doc.archive_id)
        .bind(&doc.old_id)
        .bind(&doc.collection)
        .bind(&doc.title)
        .bind(&doc.summary)
        .bind(&doc.full_text)
        .bind(doc.page_count)
        .bind(&json.all_names)
        .bind(&json.all_places)
        .bind(&json.all_dates)
        .bind(&json.all_objects)
        .bind(&json.earliest_date)
        .bind(&json.latest_date)
        .bind(&json.normalized_dates)
        .bind(doc.processing_stage.as_str())
        .bind(doc.last_processed.map(|t| t.timestamp()))
        .bind(doc.analysis_complete)
        .bind(doc.has_handwritten_notes)
        .bind(doc.has_stamps)
        .bind(doc.has_full_text)
        .bind(&json.completed_steps)
        .bind(&doc.processing_error)
        .bind(&doc.content_json)
        .bind(doc.created_at.timestamp())
        .bind(doc.updated_at.timestamp())
}

/// Serialized forms of a document's structured columns.
struct DocumentJson {
    all_names: String,
    all_places: String,
    all_dates: String,
    all_objects: String,
    earliest_date: Option<String>,
    latest_date: Option<String>,
    normalized_dates: String,
    completed_steps: String,
}

impl DocumentJson {
    fn from_document(doc: &Document) -> Result<Self> {
        Ok(Self {
            all_names: to_json(&doc.all_names)?,
            all_places: to_json(&doc.all_places)?,
            all_dates: to_json(&doc.all_dates)?,
            all_objects: to_json(&doc.all_objects)?,
            earliest_date: format_date(doc.earliest_date),
            latest_date: format_date(doc.latest_date),
            normalized_dates: to_json(&doc.normalized_dates)?,
            completed_steps: to_json(&doc.completed_steps)?,
        })
    }
}

async fn replace_children(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: &str,
    children: &DocumentChildren,
) -> Result<()> {
    sqlx::query("DELETE FROM pages WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM handwritten_notes WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM document_stamps WHERE document_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;

    for page in &children.pages {
        sqlx::query(
            r#"
            INSERT INTO pages (id, document_id, page_number, image_url, summary, full_text,
                               names, places, dates, objects, has_image, has_text)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&page.id)
        .bind(doc_id)
        .bind(page.page_number)
        .bind(&page.image_url)
        .bind(&page.summary)
        .bind(&page.full_text)
        .bind(to_json(&page.names)?)
        .bind(to_json(&page.places)?)
        .bind(to_json(&page.dates)?)
        .bind(to_json(&page.objects)?)
        .bind(page.has_image)
        .bind(page.has_text)
        .execute(&mut **tx)
        .await?;
    }

    for note in &children.handwritten_notes {
        sqlx::query(
            "INSERT INTO handwritten_notes (id, document_id, page_number, content, location) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&note.id)
        .bind(doc_id)
        .bind(note.page_number)
        .bind(&note.content)
        .bind(&note.location)
        .execute(&mut **tx)
        .await?;
    }

    for stamp in &children.stamps {
        sqlx::query(
            "INSERT INTO document_stamps (id, document_id, page_number, stamp_type, text, date) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&stamp.id)
        .bind(doc_id)
        .bind(stamp.page_number)
        .bind(&stamp.stamp_type)
        .bind(&stamp.text)
        .bind(&stamp.date)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_by_any_id(&self, id: &str) -> Result<Option<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE id = ? OR archive_id = ? OR old_id = ? ORDER BY id ASC LIMIT 1",
            DOCUMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(document_from_row))
    }

    async fn save_document(
        &self,
        doc: &Document,
        children: &DocumentChildren,
        mode: WriteMode,
    ) -> Result<()> {
        let json = DocumentJson::from_document(doc)?;
        let mut tx = self.pool.begin().await?;

        match mode {
            WriteMode::Insert => {
                let sql = format!(
                    "INSERT INTO documents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    DOCUMENT_COLUMNS
                );
                bind_document(sqlx::query(&sql), doc, &json)
                    .execute(&mut *tx)
                    .await?;
            }
            WriteMode::Update => {
                // `id` is bound twice: once as a column (unchanged) and once in WHERE.
                let assignments = DOCUMENT_COLUMNS
                    .split(',')
                    .map(|c| format!("{} = ?", c.trim()))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!("UPDATE documents SET {} WHERE id = ?", assignments);
                let result = bind_document(sqlx::query(&sql), doc, &json)
                    .bind(&doc.id)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() == 0 {
                    bail!("document not found: {}", doc.id);
                }
            }
        }

        replace_children(&mut tx, &doc.id, children).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_placeholder(&self, doc: &Document) -> Result<bool> {
        let json = DocumentJson::from_document(doc)?;
        let sql = format!(
            "INSERT INTO documents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
            DOCUMENT_COLUMNS
        );
        let result = bind_document(sqlx::query(&sql), doc, &json)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_status(&self, id: &str, update: &StatusUpdate) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET completed_steps = ?, processing_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(&update.completed_steps)?)
        .bind(&update.processing_error)
        .bind(update.updated_at.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_children(&self, id: &str) -> Result<DocumentChildren> {
        let page_rows = sqlx::query(
            r#"
            SELECT id, document_id, page_number, image_url, summary, full_text,
                   names, places, dates, objects, has_image, has_text
            FROM pages WHERE document_id = ? ORDER BY page_number ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let pages = page_rows
            .iter()
            .map(|row| Page {
                id: row.get("id"),
                document_id: row.get("document_id"),
                page_number: row.get("page_number"),
                image_url: row.get("image_url"),
                summary: row.get("summary"),
                full_text: row.get("full_text"),
                names: from_json(row.get("names")),
                places: from_json(row.get("places")),
                dates: from_json(row.get("dates")),
                objects: from_json(row.get("objects")),
                has_image: row.get("has_image"),
                has_text: row.get("has_text"),
            })
            .collect();

        let note_rows = sqlx::query(
            "SELECT id, document_id, page_number, content, location FROM handwritten_notes WHERE document_id = ? ORDER BY page_number ASC, rowid ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let handwritten_notes = note_rows
            .iter()
            .map(|row| HandwrittenNote {
                id: row.get("id"),
                document_id: row.get("document_id"),
                page_number: row.get("page_number"),
                content: row.get("content"),
                location: row.get("location"),
            })
            .collect();

        let stamp_rows = sqlx::query(
            "SELECT id, document_id, page_number, stamp_type, text, date FROM document_stamps WHERE document_id = ? ORDER BY page_number ASC, rowid ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let stamps = stamp_rows
            .iter()
            .map(|row| DocumentStamp {
                id: row.get("id"),
                document_id: row.get("document_id"),
                page_number: row.get("page_number"),
                stamp_type: row.get("stamp_type"),
                text: row.get("text"),
                date: row.get("date"),
            })
            .collect();

        Ok(DocumentChildren {
            pages,
            handwritten_notes,
            stamps,
        })
    }

    async fn count_pages(&self, id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages WHERE document_id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_health(&self) -> Result<Vec<DocumentHealth>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.page_count, d.analysis_complete,
                   substr(d.content_json, 1, 32) AS content_prefix,
                   (SELECT COUNT(*) FROM pages p WHERE p.document_id = d.id) AS page_rows
            FROM documents d
            ORDER BY d.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DocumentHealth {
                id: row.get("id"),
                page_count: row.get("page_count"),
                page_rows: row.get("page_rows"),
                analysis_complete: row.get("analysis_complete"),
                content_prefix: row.get("content_prefix"),
            })
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS documents,
                COALESCE(SUM(CASE WHEN processing_stage = 'ready' THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN processing_error IS NOT NULL THEN 1 ELSE 0 END), 0) AS with_errors
            FROM documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let documents: i64 = row.get("documents");
        let ready: i64 = row.get("ready");
        let with_errors: i64 = row.get("with_errors");

        let pages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages")
            .fetch_one(&self.pool)
            .await?;
        let handwritten_notes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM handwritten_notes")
            .fetch_one(&self.pool)
            .await?;
        let stamps: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_stamps")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            documents,
            ready,
            waiting_for_analysis: documents - ready,
            with_errors,
            pages,
            handwritten_notes,
            stamps,
        })
    }
}
