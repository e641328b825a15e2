//! Database statistics.
//!
//! A quick summary of the archive: how many documents are ready, how many
//! are still waiting, how many carry errors, and how much child data is
//! stored. Used by `arx stats`.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;
use crate::store::Store;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let stats = store.stats().await?;

    let last_processed: Option<i64> =
        sqlx::query_scalar("SELECT MAX(last_processed) FROM documents")
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Archive Sync: Database Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", stats.documents);
    println!(
        "  Ready:       {} / {} ({}%)",
        stats.ready,
        stats.documents,
        if stats.documents > 0 {
            (stats.ready * 100) / stats.documents
        } else {
            0
        }
    );
    println!("  Waiting:     {}", stats.waiting_for_analysis);
    println!("  With errors: {}", stats.with_errors);
    println!();
    println!("  Pages:       {}", stats.pages);
    println!("  Notes:       {}", stats.handwritten_notes);
    println!("  Stamps:      {}", stats.stamps);
    println!(
        "  Last update: {}",
        match last_processed {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        }
    );
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => plural(delta / 60, "min"),
        3600..=86_399 => plural(delta / 3600, "hour"),
        d if d < 86_400 * 30 => plural(d / 86_400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(now - 86_400 * 3), "3 days ago");
    }
}
