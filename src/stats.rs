//! Index statistics.
//!
//! A quick summary of what the collection holds: record counts, the
//! embedding models present, a per-source breakdown and the last ingestion
//! run. Used by `tutor stats` to confirm that ingestion is doing what it
//! should.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::migrate::ensure_schema;

struct SourceStats {
    source_id: String,
    chunks: i64,
    last_sync_ts: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    let collection = config.db.collection.as_str();

    let total_records: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM index_records WHERE collection = ?")
            .bind(collection)
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Tutor Index Stats");
    println!("=================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Collection:  {}", collection);
    println!();
    println!("  Records:     {}", total_records);

    let model_rows = sqlx::query(
        r#"
        SELECT model, dims, COUNT(*) AS n
        FROM index_records
        WHERE collection = ?
        GROUP BY model, dims
        ORDER BY n DESC
        "#,
    )
    .bind(collection)
    .fetch_all(&pool)
    .await?;
    for row in &model_rows {
        println!(
            "  Model:       {} ({} dims, {} records)",
            row.get::<String, _>("model"),
            row.get::<i64, _>("dims"),
            row.get::<i64, _>("n")
        );
    }

    let source_rows = sqlx::query(
        r#"
        SELECT source_id, COUNT(*) AS chunks, MAX(last_synced_at) AS last_sync
        FROM index_records
        WHERE collection = ?
        GROUP BY source_id
        ORDER BY source_id
        "#,
    )
    .bind(collection)
    .fetch_all(&pool)
    .await?;

    let sources: Vec<SourceStats> = source_rows
        .iter()
        .map(|row| SourceStats {
            source_id: row.get("source_id"),
            chunks: row.get("chunks"),
            last_sync_ts: row.get("last_sync"),
        })
        .collect();

    if !sources.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<40} {:>8}   {}", "SOURCE", "CHUNKS", "LAST SYNC");
        println!("  {}", "-".repeat(66));
        for s in &sources {
            println!(
                "  {:<40} {:>8}   {}",
                s.source_id,
                s.chunks,
                format_ts_relative(s.last_sync_ts)
            );
        }
    }

    let last_run = sqlx::query(
        r#"
        SELECT finished_at, documents, added, skipped, deleted, failed, full_cleanup
        FROM ingest_runs
        WHERE collection = ?
        ORDER BY finished_at DESC
        LIMIT 1
        "#,
    )
    .bind(collection)
    .fetch_optional(&pool)
    .await?;

    println!();
    match last_run {
        Some(row) => {
            let full: bool = row.get("full_cleanup");
            println!(
                "  Last ingest: {}{}",
                format_ts_relative(row.get("finished_at")),
                if full { " (full)" } else { "" }
            );
            println!(
                "               {} documents, {} added, {} skipped, {} deleted, {} failed",
                row.get::<i64, _>("documents"),
                row.get::<i64, _>("added"),
                row.get::<i64, _>("skipped"),
                row.get::<i64, _>("deleted"),
                row.get::<i64, _>("failed")
            );
        }
        None => println!("  Last ingest: never"),
    }
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

/// Format a Unix timestamp relative to now, e.g. "3 hours ago".
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{} min{} ago", delta / 60, plural(delta / 60)),
        3600..=86399 => format!("{} hour{} ago", delta / 3600, plural(delta / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
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
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(now - 3 * 86400), "3 days ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
