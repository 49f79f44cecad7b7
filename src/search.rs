//! Keyword search over enriched reference content.
//!
//! Queries the `cfr_references_fts` FTS5 table, ranks hits by bm25, and
//! attaches the agencies each matching reference belongs to. User input is
//! treated as plain text: every term is quoted before it reaches `MATCH`,
//! so FTS operators (`AND`, `NEAR`, `*`, column filters) are matched
//! literally and every term must appear.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::catalog::AgencyResponse;
use crate::config::Config;
use crate::db;

pub const DEFAULT_SEARCH_LIMIT: i64 = 20;
pub const MAX_SEARCH_LIMIT: i64 = 100;
const AGENCIES_PER_HIT: i64 = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub reference_id: i64,
    pub title: String,
    pub chapter: Option<String>,
    pub part: Option<String>,
    pub subchapter: Option<String>,
    /// Higher is better.
    pub score: f64,
    /// Matched terms wrapped in `<mark>` tags.
    pub snippet: String,
    pub agencies: Vec<AgencyResponse>,
}

/// Turns free text into an FTS5 expression that matches documents
/// containing every term. Returns `None` when nothing searchable remains.
pub fn to_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

pub async fn search_references(
    pool: &SqlitePool,
    query: &str,
    limit: Option<i64>,
) -> Result<Vec<SearchHit>> {
    let expr = match to_match_expression(query) {
        Some(e) => e,
        None => return Ok(Vec::new()),
    };
    let limit = limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    let rows = sqlx::query(
        r#"
        SELECT r.id, r.title, r.chapter, r.part, r.subchapter,
               bm25(cfr_references_fts) AS rank,
               snippet(cfr_references_fts, 1, '<mark>', '</mark>', '…', 32) AS snippet
        FROM cfr_references_fts
        JOIN cfr_references r ON r.id = cfr_references_fts.reference_id
        WHERE cfr_references_fts MATCH ?
        ORDER BY rank, r.id
        LIMIT ?
        "#,
    )
    .bind(&expr)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut hits = Vec::with_capacity(rows.len());
    for row in &rows {
        let reference_id: i64 = row.get("id");
        let rank: f64 = row.get("rank");
        hits.push(SearchHit {
            reference_id,
            title: row.get("title"),
            chapter: row.get("chapter"),
            part: row.get("part"),
            subchapter: row.get("subchapter"),
            score: -rank, // bm25 is lower-is-better
            snippet: row.get("snippet"),
            agencies: agencies_for(pool, reference_id).await?,
        });
    }

    Ok(hits)
}

async fn agencies_for(pool: &SqlitePool, reference_id: i64) -> Result<Vec<AgencyResponse>> {
    let rows = sqlx::query(
        r#"
        SELECT a.id, a.name, a.short_name, a.display_name, a.sortable_name,
               a.slug, a.parent_id, a.created_at
        FROM agencies a
        JOIN agency_cfr_references l ON l.agency_id = a.id
        WHERE l.cfr_reference_id = ?
        ORDER BY a.sortable_name, a.id
        LIMIT ?
        "#,
    )
    .bind(reference_id)
    .bind(AGENCIES_PER_HIT)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| AgencyResponse {
            id: row.get("id"),
            name: row.get("name"),
            short_name: row.get("short_name"),
            display_name: row.get("display_name"),
            sortable_name: row.get("sortable_name"),
            slug: row.get("slug"),
            parent_id: row.get("parent_id"),
            created_at: crate::catalog::format_ts_iso(row.get("created_at")),
        })
        .collect())
}

/// CLI entry point for `ecfr search`.
pub async fn run_search(config: &Config, query: &str, limit: Option<i64>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let hits = search_references(&pool, query, limit).await;
    pool.close().await;
    let hits = hits?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] title {}{}{}{}",
            i + 1,
            hit.score,
            hit.title,
            component(" chapter ", &hit.chapter),
            component(" subchapter ", &hit.subchapter),
            component(" part ", &hit.part),
        );
        if !hit.agencies.is_empty() {
            let names: Vec<&str> = hit.agencies.iter().map(|a| a.display_name.as_str()).collect();
            println!("    agencies: {}", names.join("; "));
        }
        println!(
            "    excerpt: \"{}\"",
            hit.snippet.replace('\n', " ").trim()
        );
        println!("    id: {}", hit.reference_id);
        println!();
    }

    Ok(())
}

fn component(label: &str, value: &Option<String>) -> String {
    value
        .as_deref()
        .map(|v| format!("{}{}", label, v))
        .unwrap_or_default()
}
