//! Ingestion pipeline tests against an in-memory regulation source.
//!
//! These tests drive [`ingest_with`] end to end (titles, agencies, content)
//! without touching the network, and check what lands in SQLite.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Mutex;
use tempfile::TempDir;

use ecfr_analyzer::catalog;
use ecfr_analyzer::db;
use ecfr_analyzer::ingest::{ingest_with, IngestOptions, Phases};
use ecfr_analyzer::migrate;
use ecfr_analyzer::models::{AgencyNode, RefTuple, TitleRecord};
use ecfr_analyzer::progress::{NoProgress, ProgressEvent, ProgressReporter};
use ecfr_analyzer::stats::collect_stats;
use ecfr_analyzer::summarize::{DisabledSummarizer, Summarizer};
use ecfr_analyzer::upstream::{ContentQuery, FetchError, FetchOutcome, RegulationSource};

// ─── Fakes ──────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeSource {
    titles: Vec<TitleRecord>,
    agencies: Vec<AgencyNode>,
    /// XML per reference; missing keys fail like a transport error.
    documents: HashMap<RefTuple, String>,
    requests: Mutex<Vec<ContentQuery>>,
}

impl FakeSource {
    fn requested(&self) -> Vec<ContentQuery> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegulationSource for FakeSource {
    async fn titles(&self) -> Result<Vec<TitleRecord>> {
        Ok(self.titles.clone())
    }

    async fn agencies(&self) -> Result<Vec<AgencyNode>> {
        Ok(self.agencies.clone())
    }

    async fn full_text(&self, query: &ContentQuery) -> FetchOutcome<String> {
        self.requests.lock().unwrap().push(query.clone());
        match self.documents.get(&query.reference) {
            Some(xml) => FetchOutcome::Fetched(xml.clone()),
            None => FetchOutcome::Absent(FetchError::Transport("connection refused".into())),
        }
    }
}

struct FailingTitles;

#[async_trait]
impl RegulationSource for FailingTitles {
    async fn titles(&self) -> Result<Vec<TitleRecord>> {
        bail!("GET /api/versioner/v1/titles.json failed")
    }

    async fn agencies(&self) -> Result<Vec<AgencyNode>> {
        Ok(vec![])
    }

    async fn full_text(&self, _query: &ContentQuery) -> FetchOutcome<String> {
        FetchOutcome::Absent(FetchError::Status { status: 500 })
    }
}

struct Shouting;

#[async_trait]
impl Summarizer for Shouting {
    fn model_name(&self) -> &str {
        "shouting"
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        Ok(format!("<p>{}</p>", text.to_uppercase()))
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressReporter for Recorder {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

async fn test_pool(tmp: &TempDir) -> SqlitePool {
    let url = format!("sqlite://{}", tmp.path().join("ecfr.sqlite").display());
    let pool = db::connect_url(&url).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    pool
}

fn options(phases: Phases) -> IngestOptions {
    IngestOptions {
        phases,
        refresh_all: false,
        commit_every: 10,
    }
}

fn title(number: i64, name: &str) -> TitleRecord {
    TitleRecord {
        number,
        name: name.to_string(),
        latest_amended_on: NaiveDate::from_ymd_opt(2024, 1, 10),
        latest_issue_date: NaiveDate::from_ymd_opt(2024, 1, 12),
        up_to_date_as_of: NaiveDate::from_ymd_opt(2024, 1, 15),
        reserved: false,
    }
}

fn agency(slug: &str, references: Vec<RefTuple>, children: Vec<AgencyNode>) -> AgencyNode {
    AgencyNode {
        name: slug.to_uppercase(),
        short_name: None,
        display_name: slug.to_uppercase(),
        sortable_name: slug.to_uppercase(),
        slug: slug.to_string(),
        references,
        children,
    }
}

fn part(title: &str, chapter: &str, part: &str) -> RefTuple {
    RefTuple::new(title, Some(chapter), Some(part), None)
}

fn xml(body: &str) -> String {
    format!("<DOC><HEAD>Part</HEAD><P>{}</P></DOC>", body)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_ingestion_stores_one_of_each() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let titles: ecfr_analyzer::models::TitlesFeed = serde_json::from_str(
        r#"{"titles": [{"number": 7, "name": "Agriculture", "reserved": false,
            "latest_amended_on": "2024-01-10", "latest_issue_date": "2024-01-12",
            "up_to_date_as_of": "2024-01-15"}], "meta": {}}"#,
    )
    .unwrap();
    let agencies: ecfr_analyzer::models::AgenciesFeed = serde_json::from_str(
        r#"{"agencies": [{"slug": "usda", "name": "USDA", "display_name": "USDA",
            "sortable_name": "USDA",
            "cfr_references": [{"title": 7, "chapter": "I", "part": 100}],
            "children": []}]}"#,
    )
    .unwrap();

    let source = FakeSource {
        titles: titles.titles,
        agencies: agencies.agencies,
        documents: HashMap::from([(part("7", "I", "100"), xml("Grading standards"))]),
        ..Default::default()
    };

    let report = ingest_with(&pool, &source, &DisabledSummarizer, &options(Phases::all()), &NoProgress)
        .await
        .unwrap();

    assert_eq!(report.titles, Some(1));
    let agencies = report.agencies.unwrap();
    assert_eq!(agencies.top_level, 1);
    assert_eq!(agencies.tally.references_created, 1);
    assert_eq!(agencies.tally.links_created, 1);
    let content = report.content.unwrap();
    assert_eq!((content.updated, content.failed, content.skipped), (1, 0, 0));

    let stats = collect_stats(&pool, "sqlite::memory:").await.unwrap();
    assert_eq!(stats.titles, 1);
    assert_eq!(stats.agencies, 1);
    assert_eq!(stats.references, 1);
    assert_eq!(stats.agency_references, 1);
    assert_eq!(stats.enriched_references, 1);

    let requested = source.requested();
    assert_eq!(requested.len(), 1);
    assert_eq!(
        requested[0].path(),
        "/api/versioner/v1/full/2024-01-15/title-7.xml"
    );

    let usda = catalog::get_agency_by_slug(&pool, "usda").await.unwrap().unwrap();
    let stored = catalog::get_reference(&pool, usda.references[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.content.as_deref(), Some("Part Grading standards"));
}

#[tokio::test]
async fn reingesting_a_title_updates_in_place() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let titles_only = options(Phases::from_flags(true, false, false));

    let first = FakeSource {
        titles: vec![title(7, "Agriculture")],
        ..Default::default()
    };
    ingest_with(&pool, &first, &DisabledSummarizer, &titles_only, &NoProgress)
        .await
        .unwrap();

    let second = FakeSource {
        titles: vec![title(7, "Agriculture (Updated)")],
        ..Default::default()
    };
    ingest_with(&pool, &second, &DisabledSummarizer, &titles_only, &NoProgress)
        .await
        .unwrap();

    let all = catalog::list_titles(&pool, 0, None, true).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "Agriculture (Updated)");
}

#[tokio::test]
async fn agency_reingestion_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let source = FakeSource {
        agencies: vec![agency(
            "usda",
            vec![part("7", "I", "100"), RefTuple::new("7", Some("I"), Some("100"), None)],
            vec![agency(
                "forest-service",
                vec![part("36", "II", "200")],
                vec![agency("fs-research", vec![part("7", "I", "100")], vec![])],
            )],
        )],
        ..Default::default()
    };
    let agencies_only = options(Phases::from_flags(false, true, false));

    let first = ingest_with(&pool, &source, &DisabledSummarizer, &agencies_only, &NoProgress)
        .await
        .unwrap();
    let second = ingest_with(&pool, &source, &DisabledSummarizer, &agencies_only, &NoProgress)
        .await
        .unwrap();

    assert_eq!(first.agencies.unwrap().tally.references_created, 2);
    assert_eq!(second.agencies.unwrap().tally.references_created, 0);
    assert_eq!(second.agencies.unwrap().tally.links_created, 0);

    let stats = collect_stats(&pool, "sqlite::memory:").await.unwrap();
    assert_eq!(stats.agencies, 3);
    assert_eq!(stats.top_level_agencies, 1);
    assert_eq!(stats.references, 2);
    assert_eq!(stats.agency_references, 3);

    let root = catalog::get_agency_by_slug(&pool, "usda").await.unwrap().unwrap();
    let child = catalog::get_agency_by_slug(&pool, "forest-service")
        .await
        .unwrap()
        .unwrap();
    let grandchild = catalog::get_agency_by_slug(&pool, "fs-research")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root.agency.parent_id, None);
    assert_eq!(child.agency.parent_id, Some(root.agency.id));
    assert_eq!(grandchild.agency.parent_id, Some(child.agency.id));
}

#[tokio::test]
async fn fetch_failure_is_counted_and_run_continues() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let refs = vec![part("7", "I", "1"), part("7", "I", "2"), part("7", "I", "3")];
    let source = FakeSource {
        titles: vec![title(7, "Agriculture")],
        agencies: vec![agency("usda", refs.clone(), vec![])],
        // part 2 is missing: simulated transport error
        documents: HashMap::from([
            (refs[0].clone(), xml("first")),
            (refs[2].clone(), xml("third")),
        ]),
        ..Default::default()
    };

    let report = ingest_with(&pool, &source, &DisabledSummarizer, &options(Phases::all()), &NoProgress)
        .await
        .unwrap();

    let content = report.content.unwrap();
    assert_eq!(content.processed, 3);
    assert_eq!(content.updated, 2);
    assert_eq!(content.failed, 1);
    assert_eq!(source.requested().len(), 3);

    let stats = collect_stats(&pool, "sqlite::memory:").await.unwrap();
    assert_eq!(stats.enriched_references, 2);
}

#[tokio::test]
async fn malformed_xml_counts_as_failed() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let key = part("7", "I", "1");
    let source = FakeSource {
        titles: vec![title(7, "Agriculture")],
        agencies: vec![agency("usda", vec![key.clone()], vec![])],
        documents: HashMap::from([(key, "this is not xml".to_string())]),
        ..Default::default()
    };

    let report = ingest_with(&pool, &source, &DisabledSummarizer, &options(Phases::all()), &NoProgress)
        .await
        .unwrap();
    let content = report.content.unwrap();
    assert_eq!((content.updated, content.failed), (0, 1));
}

#[tokio::test]
async fn reference_without_known_date_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let mut undated = title(8, "Aliens and Nationality");
    undated.up_to_date_as_of = None;
    let source = FakeSource {
        titles: vec![title(7, "Agriculture"), undated],
        agencies: vec![agency(
            "usda",
            vec![part("7", "I", "1"), part("8", "I", "1"), part("99", "I", "1")],
            vec![],
        )],
        documents: HashMap::from([(part("7", "I", "1"), xml("dated"))]),
        ..Default::default()
    };

    let report = ingest_with(&pool, &source, &DisabledSummarizer, &options(Phases::all()), &NoProgress)
        .await
        .unwrap();
    let content = report.content.unwrap();
    assert_eq!(content.updated, 1);
    assert_eq!(content.skipped, 2);
    assert_eq!(content.failed, 0);
    // skipped references never reach the network
    assert_eq!(source.requested().len(), 1);
}

#[tokio::test]
async fn only_pending_references_are_enriched_unless_refreshing() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let key = part("7", "I", "1");
    let source = FakeSource {
        titles: vec![title(7, "Agriculture")],
        agencies: vec![agency("usda", vec![key.clone()], vec![])],
        documents: HashMap::from([(key, xml("rules"))]),
        ..Default::default()
    };

    ingest_with(&pool, &source, &DisabledSummarizer, &options(Phases::all()), &NoProgress)
        .await
        .unwrap();

    let content_only = Phases::from_flags(false, false, true);
    let again = ingest_with(&pool, &source, &DisabledSummarizer, &options(content_only), &NoProgress)
        .await
        .unwrap();
    assert_eq!(again.content.unwrap().processed, 0);

    let refresh = IngestOptions {
        refresh_all: true,
        ..options(content_only)
    };
    let refreshed = ingest_with(&pool, &source, &Shouting, &refresh, &NoProgress)
        .await
        .unwrap();
    assert_eq!(refreshed.content.unwrap().updated, 1);
    assert_eq!(source.requested().len(), 2);

    let usda = catalog::get_agency_by_slug(&pool, "usda").await.unwrap().unwrap();
    let stored = catalog::get_reference(&pool, usda.references[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.content.as_deref(), Some("<p>PART RULES</p>"));
}

#[tokio::test]
async fn content_phase_checkpoints_every_n_references() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let refs: Vec<RefTuple> = (1..=5).map(|p| part("7", "I", &p.to_string())).collect();
    let source = FakeSource {
        titles: vec![title(7, "Agriculture")],
        agencies: vec![agency("usda", refs.clone(), vec![])],
        documents: refs.iter().map(|r| (r.clone(), xml("text"))).collect(),
        ..Default::default()
    };
    let recorder = Recorder::default();
    let opts = IngestOptions {
        commit_every: 2,
        ..options(Phases::all())
    };

    ingest_with(&pool, &source, &DisabledSummarizer, &opts, &recorder)
        .await
        .unwrap();

    let events = recorder.events.lock().unwrap().clone();
    let checkpoints: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Checkpoint { n, .. } => Some(*n),
            _ => None,
        })
        .collect();
    assert_eq!(checkpoints, vec![2, 4]);

    let phases: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Phase { name } => Some(*name),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec!["titles", "agencies", "content"]);

    let stats = collect_stats(&pool, "sqlite::memory:").await.unwrap();
    assert_eq!(stats.enriched_references, 5);
}

#[tokio::test]
async fn lookup_failure_propagates() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let err = ingest_with(&pool, &FailingTitles, &DisabledSummarizer, &options(Phases::all()), &NoProgress)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("titles.json"));
}
