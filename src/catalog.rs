//! Read access to titles, agencies, and references.
//!
//! These are the queries behind the `/api/v1` routes. Each lookup returns
//! `Ok(None)` when the row does not exist; the caller decides whether that
//! is a 404 or something else. Timestamps are rendered as ISO 8601 and
//! content sizes as whitespace-separated word counts.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{parse_stored_date, word_count};

pub const DEFAULT_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TitleResponse {
    pub number: i64,
    pub name: String,
    pub latest_amended_on: Option<NaiveDate>,
    pub latest_issue_date: Option<NaiveDate>,
    pub up_to_date_as_of: Option<NaiveDate>,
    pub reserved: bool,
    pub created_at: String, // ISO8601
    pub updated_at: String, // ISO8601
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgencyResponse {
    pub id: i64,
    pub name: String,
    pub short_name: Option<String>,
    pub display_name: String,
    pub sortable_name: String,
    pub slug: String,
    pub parent_id: Option<i64>,
    pub created_at: String, // ISO8601
}

/// An agency with its direct children and linked references.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgencyDetail {
    #[serde(flatten)]
    pub agency: AgencyResponse,
    pub children: Vec<AgencyResponse>,
    pub references: Vec<ReferenceSummary>,
    /// Words across the content of every linked reference.
    pub word_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReferenceSummary {
    pub id: i64,
    pub title: String,
    pub chapter: Option<String>,
    pub part: Option<String>,
    pub subchapter: Option<String>,
    pub word_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReferenceDetail {
    #[serde(flatten)]
    pub reference: ReferenceSummary,
    pub content: Option<String>,
    pub agencies: Vec<AgencyResponse>,
}

/// Filters for [`list_agencies`].
#[derive(Debug, Clone, Default)]
pub struct AgencyQuery {
    pub skip: i64,
    pub limit: Option<i64>,
    /// `None` lists top-level agencies.
    pub parent_id: Option<i64>,
    /// Case-insensitive substring of name, display name, or slug.
    pub filter: Option<String>,
}

// ============ Titles ============

pub async fn get_title(pool: &SqlitePool, number: i64) -> Result<Option<TitleResponse>> {
    let row = sqlx::query(
        "SELECT number, name, latest_amended_on, latest_issue_date, up_to_date_as_of, reserved, created_at, updated_at FROM titles WHERE number = ?",
    )
    .bind(number)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(title_from_row))
}

/// Titles ordered by number; reserved titles only when asked for.
pub async fn list_titles(
    pool: &SqlitePool,
    skip: i64,
    limit: Option<i64>,
    include_reserved: bool,
) -> Result<Vec<TitleResponse>> {
    let rows = sqlx::query(
        r#"
        SELECT number, name, latest_amended_on, latest_issue_date, up_to_date_as_of,
               reserved, created_at, updated_at
        FROM titles
        WHERE ? OR reserved = 0
        ORDER BY number
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(include_reserved)
    .bind(limit.unwrap_or(DEFAULT_PAGE_LIMIT))
    .bind(skip)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(title_from_row).collect())
}

fn title_from_row(row: &SqliteRow) -> TitleResponse {
    TitleResponse {
        number: row.get("number"),
        name: row.get("name"),
        latest_amended_on: parse_stored_date(row.get("latest_amended_on")),
        latest_issue_date: parse_stored_date(row.get("latest_issue_date")),
        up_to_date_as_of: parse_stored_date(row.get("up_to_date_as_of")),
        reserved: row.get("reserved"),
        created_at: format_ts_iso(row.get("created_at")),
        updated_at: format_ts_iso(row.get("updated_at")),
    }
}

// ============ Agencies ============

const AGENCY_COLUMNS: &str =
    "a.id, a.name, a.short_name, a.display_name, a.sortable_name, a.slug, a.parent_id, a.created_at";

pub async fn list_agencies(pool: &SqlitePool, query: &AgencyQuery) -> Result<Vec<AgencyResponse>> {
    let pattern = query
        .filter
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| format!("%{}%", f.to_lowercase()));

    let sql = format!(
        r#"
        SELECT {AGENCY_COLUMNS}
        FROM agencies a
        WHERE ((? IS NULL AND a.parent_id IS NULL) OR a.parent_id = ?)
          AND (? IS NULL
               OR lower(a.name) LIKE ?
               OR lower(a.display_name) LIKE ?
               OR lower(a.slug) LIKE ?)
        ORDER BY a.sortable_name, a.id
        LIMIT ? OFFSET ?
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(query.parent_id)
        .bind(query.parent_id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(query.limit.unwrap_or(DEFAULT_PAGE_LIMIT))
        .bind(query.skip)
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(agency_from_row).collect())
}

pub async fn get_agency(pool: &SqlitePool, id: i64) -> Result<Option<AgencyDetail>> {
    let sql = format!("SELECT {AGENCY_COLUMNS} FROM agencies a WHERE a.id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(agency_detail(pool, agency_from_row(&row)).await?)),
        None => Ok(None),
    }
}

pub async fn get_agency_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<AgencyDetail>> {
    let sql = format!("SELECT {AGENCY_COLUMNS} FROM agencies a WHERE a.slug = ?");
    let row = sqlx::query(&sql).bind(slug).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(agency_detail(pool, agency_from_row(&row)).await?)),
        None => Ok(None),
    }
}

async fn agency_detail(pool: &SqlitePool, agency: AgencyResponse) -> Result<AgencyDetail> {
    let sql = format!(
        "SELECT {AGENCY_COLUMNS} FROM agencies a WHERE a.parent_id = ? ORDER BY a.sortable_name, a.id"
    );
    let children: Vec<AgencyResponse> = sqlx::query(&sql)
        .bind(agency.id)
        .fetch_all(pool)
        .await?
        .iter()
        .map(agency_from_row)
        .collect();

    let reference_rows = sqlx::query(
        r#"
        SELECT r.id, r.title, r.chapter, r.part, r.subchapter, r.content
        FROM cfr_references r
        JOIN agency_cfr_references l ON l.cfr_reference_id = r.id
        WHERE l.agency_id = ?
        ORDER BY r.id
        "#,
    )
    .bind(agency.id)
    .fetch_all(pool)
    .await?;

    let references: Vec<ReferenceSummary> = reference_rows
        .iter()
        .map(|row| reference_summary(row, row.get::<Option<String>, _>("content").as_deref()))
        .collect();
    let word_count = references.iter().map(|r| r.word_count).sum();

    Ok(AgencyDetail {
        agency,
        children,
        references,
        word_count,
    })
}

fn agency_from_row(row: &SqliteRow) -> AgencyResponse {
    AgencyResponse {
        id: row.get("id"),
        name: row.get("name"),
        short_name: row.get("short_name"),
        display_name: row.get("display_name"),
        sortable_name: row.get("sortable_name"),
        slug: row.get("slug"),
        parent_id: row.get("parent_id"),
        created_at: format_ts_iso(row.get("created_at")),
    }
}

// ============ References ============

pub async fn get_reference(pool: &SqlitePool, id: i64) -> Result<Option<ReferenceDetail>> {
    let row = sqlx::query(
        "SELECT id, title, chapter, part, subchapter, content FROM cfr_references WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };
    let content: Option<String> = row.get("content");

    let sql = format!(
        r#"
        SELECT {AGENCY_COLUMNS}
        FROM agencies a
        JOIN agency_cfr_references l ON l.agency_id = a.id
        WHERE l.cfr_reference_id = ?
        ORDER BY a.sortable_name, a.id
        "#
    );
    let agencies = sqlx::query(&sql)
        .bind(id)
        .fetch_all(pool)
        .await?
        .iter()
        .map(agency_from_row)
        .collect();

    Ok(Some(ReferenceDetail {
        reference: reference_summary(&row, content.as_deref()),
        content,
        agencies,
    }))
}

fn reference_summary(row: &SqliteRow, content: Option<&str>) -> ReferenceSummary {
    ReferenceSummary {
        id: row.get("id"),
        title: row.get("title"),
        chapter: row.get("chapter"),
        part: row.get("part"),
        subchapter: row.get("subchapter"),
        word_count: word_count(content),
    }
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
