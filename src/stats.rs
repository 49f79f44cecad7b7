//! Database statistics.
//!
//! Row counts for every table plus how much reference content has been
//! enriched so far. Used by `ecfr stats` and `GET /api/v1/stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub titles: i64,
    pub reserved_titles: i64,
    pub agencies: i64,
    pub top_level_agencies: i64,
    pub references: i64,
    /// References with non-empty content.
    pub enriched_references: i64,
    pub agency_references: i64,
    /// Size of the database file, when it is a file.
    pub db_size_bytes: Option<u64>,
}

pub async fn collect_stats(pool: &SqlitePool, database_url: &str) -> Result<Stats> {
    Ok(Stats {
        titles: count(pool, "SELECT COUNT(*) FROM titles").await?,
        reserved_titles: count(pool, "SELECT COUNT(*) FROM titles WHERE reserved = 1").await?,
        agencies: count(pool, "SELECT COUNT(*) FROM agencies").await?,
        top_level_agencies: count(pool, "SELECT COUNT(*) FROM agencies WHERE parent_id IS NULL")
            .await?,
        references: count(pool, "SELECT COUNT(*) FROM cfr_references").await?,
        enriched_references: count(
            pool,
            "SELECT COUNT(*) FROM cfr_references WHERE content IS NOT NULL AND content != ''",
        )
        .await?,
        agency_references: count(pool, "SELECT COUNT(*) FROM agency_cfr_references").await?,
        db_size_bytes: db::database_file(database_url)
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len()),
    })
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool, &config.db.url).await;
    pool.close().await;
    let stats = stats?;

    println!("eCFR Analyzer — Database Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.url);
    if let Some(size) = stats.db_size_bytes {
        println!("  Size:        {}", format_bytes(size));
    }
    println!();
    println!(
        "  Titles:      {} ({} reserved)",
        stats.titles, stats.reserved_titles
    );
    println!(
        "  Agencies:    {} ({} top-level)",
        stats.agencies, stats.top_level_agencies
    );
    println!("  References:  {}", stats.references);
    println!(
        "  Enriched:    {} / {} ({}%)",
        stats.enriched_references,
        stats.references,
        if stats.references > 0 {
            (stats.enriched_references * 100) / stats.references
        } else {
            0
        }
    );
    println!("  Links:       {}", stats.agency_references);
    println!();

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn empty_database_counts_zero() {
        let tmp = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", tmp.path().join("stats.db").display());
        let pool = db::connect_url(&url).await.unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();

        let stats = collect_stats(&pool, &url).await.unwrap();
        assert_eq!(stats.titles, 0);
        assert_eq!(stats.references, 0);
        assert!(stats.db_size_bytes.is_some());
    }
}
