//! TOML configuration.
//!
//! A [`Config`] is built once at process start by [`load_config`] and passed
//! down by reference to every command. Nothing in the crate reads settings
//! from global state.
//!
//! ```toml
//! [db]
//! url = "sqlite://data/ecfr.sqlite"
//!
//! [upstream]
//! base_url = "https://www.ecfr.gov"
//! max_calls = 100
//! period_secs = 60
//!
//! [summary]
//! provider = "anthropic"
//! model = "claude-haiku-4-5-20251001"
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Environment variable that overrides `[db].url`.
pub const DATABASE_URL_ENV: &str = "ECFR_DATABASE_URL";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// May be omitted when `ECFR_DATABASE_URL` supplies the URL.
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DbConfig {
    /// Connection string for the relational store.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Calls allowed per window, shared by every fetch in a run.
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    /// Timeout for full-text XML fetches.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Timeout for the titles and agencies lookups.
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            max_calls: default_max_calls(),
            period_secs: default_period_secs(),
            timeout_secs: default_timeout_secs(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://www.ecfr.gov".to_string()
}
fn default_max_calls() -> usize {
    100
}
fn default_period_secs() -> u64 {
    60
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_lookup_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummaryConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_summary_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_summary_base_url")]
    pub base_url: String,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_summary_timeout_secs(),
            base_url: default_summary_base_url(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_summary_timeout_secs() -> u64 {
    120
}
fn default_summary_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

impl SummaryConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Processed references between commits in the content phase.
    #[serde(default = "default_commit_every")]
    pub commit_every: usize,
    /// Reprocess references that already carry content.
    #[serde(default)]
    pub refresh_all: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            commit_every: default_commit_every(),
            refresh_all: false,
        }
    }
}

fn default_commit_every() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Config {
    /// Configuration with every default and the given database URL.
    pub fn with_database(url: impl Into<String>) -> Self {
        Self {
            db: DbConfig { url: url.into() },
            upstream: UpstreamConfig::default(),
            summary: SummaryConfig::default(),
            ingest: IngestConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_database_override(&mut config, std::env::var(DATABASE_URL_ENV).ok());

    validate(&config)?;
    Ok(config)
}

/// Replaces `[db].url` with `value` unless it is unset or blank.
fn apply_database_override(config: &mut Config, value: Option<String>) {
    if let Some(url) = value.filter(|u| !u.trim().is_empty()) {
        config.db.url = url;
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.url.trim().is_empty() {
        bail!("db.url must not be empty");
    }

    if config.upstream.max_calls == 0 {
        bail!("upstream.max_calls must be >= 1");
    }
    if config.upstream.period_secs == 0 {
        bail!("upstream.period_secs must be >= 1");
    }

    if config.ingest.commit_every == 0 {
        bail!("ingest.commit_every must be >= 1");
    }

    match config.summary.provider.as_str() {
        "disabled" | "anthropic" => {}
        other => bail!(
            "Unknown summary provider: '{}'. Must be disabled or anthropic.",
            other
        ),
    }

    if config.summary.is_enabled() && config.summary.model.is_none() {
        bail!(
            "summary.model must be specified when provider is '{}'",
            config.summary.provider
        );
    }

    Ok(())
}
