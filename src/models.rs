//! Core data models.
//!
//! Two families live here: the upstream feed shapes deserialized from the
//! eCFR API ([`TitleRecord`], [`AgencyNode`], [`RefTuple`]) and the rows the
//! ingestion pipeline persists ([`Title`], [`Agency`], [`Reference`]).

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

// ============ Upstream feed ============

/// Body of `GET /api/versioner/v1/titles.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TitlesFeed {
    #[serde(default)]
    pub titles: Vec<TitleRecord>,
}

/// One entry of the titles feed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TitleRecord {
    pub number: i64,
    pub name: String,
    #[serde(default)]
    pub latest_amended_on: Option<NaiveDate>,
    #[serde(default)]
    pub latest_issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub up_to_date_as_of: Option<NaiveDate>,
    #[serde(default)]
    pub reserved: bool,
}

/// Body of `GET /api/admin/v1/agencies.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgenciesFeed {
    #[serde(default)]
    pub agencies: Vec<AgencyNode>,
}

/// An agency as supplied upstream, with its nested sub-agencies.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AgencyNode {
    pub name: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub short_name: Option<String>,
    pub display_name: String,
    pub sortable_name: String,
    pub slug: String,
    #[serde(default, rename = "cfr_references")]
    pub references: Vec<RefTuple>,
    #[serde(default)]
    pub children: Vec<AgencyNode>,
}

/// Natural key of a regulatory scope: `(title, chapter, part, subchapter)`.
///
/// Empty strings are folded to `None` so that "absent" has exactly one
/// representation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Hash)]
pub struct RefTuple {
    #[serde(deserialize_with = "required_text")]
    pub title: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub chapter: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub part: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub subchapter: Option<String>,
}

impl RefTuple {
    pub fn new(
        title: impl Into<String>,
        chapter: Option<&str>,
        part: Option<&str>,
        subchapter: Option<&str>,
    ) -> Self {
        Self {
            title: title.into().trim().to_string(),
            chapter: normalize(chapter),
            part: normalize(part),
            subchapter: normalize(subchapter),
        }
    }
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The feed mixes JSON numbers and strings for titles and parts.
#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Int(i64),
}

impl TextOrNumber {
    fn into_string(self) -> String {
        match self {
            TextOrNumber::Text(s) => s,
            TextOrNumber::Int(n) => n.to_string(),
        }
    }
}

fn required_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(TextOrNumber::deserialize(deserializer)?
        .into_string()
        .trim()
        .to_string())
}

fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<TextOrNumber>::deserialize(deserializer)?;
    Ok(normalize(value.map(TextOrNumber::into_string).as_deref()))
}

// ============ Persisted rows ============

/// A CFR title, keyed by its number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Title {
    pub number: i64,
    pub name: String,
    pub latest_amended_on: Option<NaiveDate>,
    pub latest_issue_date: Option<NaiveDate>,
    pub up_to_date_as_of: Option<NaiveDate>,
    pub reserved: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A federal agency; `parent_id` links it into the agency tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agency {
    pub id: i64,
    pub name: String,
    pub short_name: Option<String>,
    pub display_name: String,
    pub sortable_name: String,
    pub slug: String,
    pub parent_id: Option<i64>,
    pub created_at: i64,
}

/// A deduplicated pointer to one regulatory scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reference {
    pub id: i64,
    pub title: String,
    pub chapter: Option<String>,
    pub part: Option<String>,
    pub subchapter: Option<String>,
    pub content: Option<String>,
}

impl Reference {
    pub fn key(&self) -> RefTuple {
        RefTuple::new(
            self.title.clone(),
            self.chapter.as_deref(),
            self.part.as_deref(),
            self.subchapter.as_deref(),
        )
    }
}

/// Whitespace-separated word count of optional text.
pub fn word_count(content: Option<&str>) -> usize {
    content.map(|c| c.split_whitespace().count()).unwrap_or(0)
}

/// Parses a stored `YYYY-MM-DD` column.
pub fn parse_stored_date(value: Option<String>) -> Option<NaiveDate> {
    value.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}
