//! Ingestion pipeline orchestration.
//!
//! Runs up to three phases, always in this order:
//!
//! 1. **titles**: fetch the titles feed and upsert each title by number.
//! 2. **agencies**: fetch the agency tree and merge it by slug, resolving
//!    and linking each agency's references.
//! 3. **content**: for each reference, fetch its full-text XML, extract
//!    (and optionally summarize) the text, and store it. Progress is
//!    committed every `commit_every` references.
//!
//! Every write is an upsert, so any phase can be re-run safely. Upstream
//! fetch failures and malformed XML in the content phase are counted and
//! skipped; every other error is logged and propagates.

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::Config;
use crate::db;
use crate::extract::extract_text;
use crate::models::{parse_stored_date, Reference};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::summarize::{create_summarizer, summarize_or_fallback, DisabledSummarizer, Summarizer};
use crate::upsert::{self, AgencyTally};
use crate::upstream::{ContentQuery, EcfrClient, FetchOutcome, RegulationSource};

/// Which phases to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases {
    pub titles: bool,
    pub agencies: bool,
    pub content: bool,
}

impl Phases {
    pub fn all() -> Self {
        Self {
            titles: true,
            agencies: true,
            content: true,
        }
    }

    /// Selected phases; selecting none means all of them.
    pub fn from_flags(titles: bool, agencies: bool, content: bool) -> Self {
        if !(titles || agencies || content) {
            return Self::all();
        }
        Self {
            titles,
            agencies,
            content,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub phases: Phases,
    /// Reprocess references that already have content.
    pub refresh_all: bool,
    pub commit_every: usize,
}

impl IngestOptions {
    pub fn from_config(config: &Config, phases: Phases, refresh: bool) -> Self {
        Self {
            phases,
            refresh_all: refresh || config.ingest.refresh_all,
            commit_every: config.ingest.commit_every.max(1),
        }
    }
}

/// Counters for the content phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrichStats {
    pub processed: u64,
    pub updated: u64,
    /// Fetch failed or no text could be extracted.
    pub failed: u64,
    /// No `up_to_date_as_of` date known for the reference's title.
    pub skipped: u64,
}

/// Outcome of one run; `None` marks a phase that did not run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub titles: Option<u64>,
    pub agencies: Option<AgencySummary>,
    pub content: Option<EnrichStats>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgencySummary {
    pub top_level: u64,
    pub tally: AgencyTally,
}

/// CLI entry point: wires the HTTP client and summarizer from `config`,
/// runs the pipeline, and prints the report.
pub async fn run_ingest(
    config: &Config,
    phases: Phases,
    refresh: bool,
    progress: &dyn ProgressReporter,
) -> Result<IngestReport> {
    let pool = db::connect(config).await?;
    let client = EcfrClient::from_config(&config.upstream)?;
    let summarizer: Box<dyn Summarizer> = if phases.content {
        create_summarizer(&config.summary)?
    } else {
        Box::new(DisabledSummarizer)
    };
    let options = IngestOptions::from_config(config, phases, refresh);

    let result = ingest_with(&pool, &client, summarizer.as_ref(), &options, progress).await;
    pool.close().await;
    let report = result?;

    print_report(&report);
    Ok(report)
}

/// Runs the selected phases against `source`, writing to `pool`.
pub async fn ingest_with(
    pool: &SqlitePool,
    source: &dyn RegulationSource,
    summarizer: &dyn Summarizer,
    options: &IngestOptions,
    progress: &dyn ProgressReporter,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    if options.phases.titles {
        progress.report(ProgressEvent::Phase { name: "titles" });
        let stored = store_titles(pool, source)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "titles phase failed"))?;
        report.titles = Some(stored);
    } else {
        tracing::info!("skipping titles (not requested)");
    }

    if options.phases.agencies {
        progress.report(ProgressEvent::Phase { name: "agencies" });
        let summary = store_agencies(pool, source)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "agencies phase failed"))?;
        report.agencies = Some(summary);
    } else {
        tracing::info!("skipping agencies (not requested)");
    }

    if options.phases.content {
        progress.report(ProgressEvent::Phase { name: "content" });
        let stats = enrich_references(pool, source, summarizer, options, progress)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "content phase failed"))?;
        report.content = Some(stats);
    } else {
        tracing::info!("skipping content (not requested)");
    }

    Ok(report)
}

pub async fn store_titles(pool: &SqlitePool, source: &dyn RegulationSource) -> Result<u64> {
    let titles = source.titles().await?;
    tracing::info!(count = titles.len(), "upserting titles");

    let mut tx = pool.begin().await?;
    for record in &titles {
        upsert::upsert_title(&mut *tx, record).await?;
    }
    tx.commit().await?;

    Ok(titles.len() as u64)
}

pub async fn store_agencies(
    pool: &SqlitePool,
    source: &dyn RegulationSource,
) -> Result<AgencySummary> {
    let roots = source.agencies().await?;
    tracing::info!(count = roots.len(), "upserting top-level agencies");

    let mut summary = AgencySummary::default();
    let mut tx = pool.begin().await?;
    for node in &roots {
        upsert::upsert_agency_counted(&mut *tx, node, None, &mut summary.tally).await?;
        summary.top_level += 1;
    }
    tx.commit().await?;

    Ok(summary)
}

/// Content phase. Commits every `options.commit_every` references and once
/// more at the end.
pub async fn enrich_references(
    pool: &SqlitePool,
    source: &dyn RegulationSource,
    summarizer: &dyn Summarizer,
    options: &IngestOptions,
    progress: &dyn ProgressReporter,
) -> Result<EnrichStats> {
    let references = load_references(pool, options.refresh_all).await?;
    let as_of = load_as_of_dates(pool).await?;
    let total = references.len() as u64;
    tracing::info!(
        total,
        refresh_all = options.refresh_all,
        "processing references"
    );

    let mut stats = EnrichStats::default();
    let mut tx = pool.begin().await?;

    for (idx, reference) in references.iter().enumerate() {
        let n = idx as u64 + 1;
        progress.report(ProgressEvent::Enriching { n, total });
        stats.processed += 1;

        let date = reference
            .title
            .parse::<i64>()
            .ok()
            .and_then(|number| as_of.get(&number).copied().flatten());

        match date {
            None => {
                tracing::warn!(
                    title = %reference.title,
                    "no up_to_date_as_of date for title, skipping"
                );
                stats.skipped += 1;
            }
            Some(date) => {
                let query = ContentQuery::new(date, reference.key());
                match source.full_text(&query).await {
                    FetchOutcome::Fetched(xml) => {
                        let text = extract_text(&xml);
                        let content = summarize_or_fallback(summarizer, &text).await;
                        if content.is_empty() {
                            tracing::warn!(reference = reference.id, "no text extracted");
                            stats.failed += 1;
                        } else {
                            upsert::set_reference_content(&mut *tx, reference.id, &content)
                                .await?;
                            tracing::debug!(
                                reference = reference.id,
                                chars = content.chars().count(),
                                %date,
                                "stored content"
                            );
                            stats.updated += 1;
                        }
                    }
                    FetchOutcome::Absent(reason) => {
                        tracing::debug!(reference = reference.id, %reason, "content unavailable");
                        stats.failed += 1;
                    }
                }
            }
        }

        if n % options.commit_every as u64 == 0 {
            tx.commit().await?;
            tx = pool.begin().await?;
            tracing::info!(n, total, "progress saved");
            progress.report(ProgressEvent::Checkpoint { n, total });
        }
    }

    tx.commit().await?;

    Ok(stats)
}

async fn load_references(pool: &SqlitePool, refresh_all: bool) -> Result<Vec<Reference>> {
    let sql = if refresh_all {
        "SELECT id, title, chapter, part, subchapter, content FROM cfr_references ORDER BY id"
    } else {
        "SELECT id, title, chapter, part, subchapter, content FROM cfr_references \
         WHERE content IS NULL OR content = '' ORDER BY id"
    };

    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| Reference {
            id: row.get("id"),
            title: row.get("title"),
            chapter: row.get("chapter"),
            part: row.get("part"),
            subchapter: row.get("subchapter"),
            content: row.get("content"),
        })
        .collect())
}

async fn load_as_of_dates(pool: &SqlitePool) -> Result<HashMap<i64, Option<NaiveDate>>> {
    let rows = sqlx::query("SELECT number, up_to_date_as_of FROM titles")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get::<i64, _>("number"),
                parse_stored_date(row.get("up_to_date_as_of")),
            )
        })
        .collect())
}

fn print_report(report: &IngestReport) {
    println!("ingest");
    if let Some(n) = report.titles {
        println!("  titles upserted: {}", n);
    }
    if let Some(a) = &report.agencies {
        println!("  top-level agencies: {}", a.top_level);
        println!("  agencies upserted: {}", a.tally.agencies);
        println!("  references created: {}", a.tally.references_created);
        println!("  links created: {}", a.tally.links_created);
    }
    if let Some(c) = &report.content {
        println!("  references processed: {}", c.processed);
        println!("  content updated: {}", c.updated);
        println!("  content failed: {}", c.failed);
        println!("  content skipped: {}", c.skipped);
    }
    println!("ok");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_selects_every_phase() {
        assert_eq!(Phases::from_flags(false, false, false), Phases::all());
    }

    #[test]
    fn flags_select_subset() {
        let p = Phases::from_flags(true, false, true);
        assert!(p.titles && !p.agencies && p.content);
    }

    #[test]
    fn refresh_flag_or_config_enables_refresh() {
        let mut cfg = Config::with_database("sqlite::memory:");
        assert!(!IngestOptions::from_config(&cfg, Phases::all(), false).refresh_all);
        assert!(IngestOptions::from_config(&cfg, Phases::all(), true).refresh_all);
        cfg.ingest.refresh_all = true;
        assert!(IngestOptions::from_config(&cfg, Phases::all(), false).refresh_all);
    }
}
