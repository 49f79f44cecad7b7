//! eCFR upstream API client.
//!
//! [`RegulationSource`] is the seam between the ingestion pipeline and the
//! network. [`EcfrClient`] implements it over HTTP; tests substitute
//! in-memory sources.
//!
//! | Call | Endpoint |
//! |------|----------|
//! | [`titles`](RegulationSource::titles) | `GET /api/versioner/v1/titles.json` |
//! | [`agencies`](RegulationSource::agencies) | `GET /api/admin/v1/agencies.json` |
//! | [`full_text`](RegulationSource::full_text) | `GET /api/versioner/v1/full/{date}/title-{n}.xml` |
//!
//! Every call first takes a slot from the client's shared [`RateLimiter`].
//! Lookup failures are errors; a failed full-text fetch is reported as
//! [`FetchOutcome::Absent`] so the caller can count it and move on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;

use crate::config::UpstreamConfig;
use crate::models::{AgenciesFeed, AgencyNode, RefTuple, TitleRecord, TitlesFeed};
use crate::ratelimit::RateLimiter;

/// Why a full-text fetch produced no document.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("upstream returned HTTP {status}")]
    Status { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Status {
                status: status.as_u16(),
            }
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

/// Result of a fetch that is allowed to come back empty-handed.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    Fetched(T),
    Absent(FetchError),
}

impl<T> FetchOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            FetchOutcome::Fetched(v) => Some(v),
            FetchOutcome::Absent(_) => None,
        }
    }
}

/// Parameters of one full-text request.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentQuery {
    pub date: NaiveDate,
    pub reference: RefTuple,
}

impl ContentQuery {
    pub fn new(date: NaiveDate, reference: RefTuple) -> Self {
        Self { date, reference }
    }

    /// Path below the base URL.
    pub fn path(&self) -> String {
        format!(
            "/api/versioner/v1/full/{}/title-{}.xml",
            self.date.format("%Y-%m-%d"),
            self.reference.title
        )
    }

    /// Query string pairs; absent components are omitted.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let r = &self.reference;
        [
            ("chapter", r.chapter.as_ref()),
            ("part", r.part.as_ref()),
            ("subchapter", r.subchapter.as_ref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v.clone())))
        .collect()
    }
}

#[async_trait]
pub trait RegulationSource: Send + Sync {
    async fn titles(&self) -> Result<Vec<TitleRecord>>;

    async fn agencies(&self) -> Result<Vec<AgencyNode>>;

    /// Fetches the XML body for one reference. Never raises.
    async fn full_text(&self, query: &ContentQuery) -> FetchOutcome<String>;
}

pub struct EcfrClient {
    base_url: String,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    lookup_timeout: Duration,
}

impl EcfrClient {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            config.max_calls,
            Duration::from_secs(config.period_secs),
        ));
        Self::with_limiter(config, limiter)
    }

    pub fn with_limiter(config: &UpstreamConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("ecfr-analyzer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            limiter,
            timeout: Duration::from_secs(config.timeout_secs),
            lookup_timeout: Duration::from_secs(config.lookup_timeout_secs),
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    async fn lookup<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        self.limiter.acquire().await;

        tracing::info!(%url, "fetching");
        let response = self
            .http
            .get(&url)
            .timeout(self.lookup_timeout)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} failed", url))?;

        response
            .json::<T>()
            .await
            .with_context(|| format!("Invalid JSON from {}", url))
    }

    async fn try_full_text(&self, query: &ContentQuery) -> Result<String, FetchError> {
        let url = format!("{}{}", self.base_url, query.path());
        let response = self
            .http
            .get(&url)
            .query(&query.params())
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl RegulationSource for EcfrClient {
    async fn titles(&self) -> Result<Vec<TitleRecord>> {
        let feed: TitlesFeed = self.lookup("/api/versioner/v1/titles.json").await?;
        Ok(feed.titles)
    }

    async fn agencies(&self) -> Result<Vec<AgencyNode>> {
        let feed: AgenciesFeed = self.lookup("/api/admin/v1/agencies.json").await?;
        Ok(feed.agencies)
    }

    async fn full_text(&self, query: &ContentQuery) -> FetchOutcome<String> {
        self.limiter.acquire().await;

        match self.try_full_text(query).await {
            Ok(body) => FetchOutcome::Fetched(body),
            Err(e) => {
                let r = &query.reference;
                tracing::warn!(
                    title = %r.title,
                    chapter = r.chapter.as_deref().unwrap_or("-"),
                    part = r.part.as_deref().unwrap_or("-"),
                    error = %e,
                    "failed to fetch XML"
                );
                FetchOutcome::Absent(e)
            }
        }
    }
}
