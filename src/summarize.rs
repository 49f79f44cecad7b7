//! Optional summarization of extracted regulation text.
//!
//! Defines the [`Summarizer`] trait and its implementations:
//! - **[`DisabledSummarizer`]**: declines every request; extracted text is stored as-is.
//! - **[`AnthropicSummarizer`]**: calls the Anthropic messages API with a fixed prompt.
//!
//! [`summarize_or_fallback`] is the only entry point the pipeline uses. It
//! never fails: any error from the provider (including a timeout) falls back
//! to the extracted text, truncated to [`MAX_CONTENT_CHARS`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::SummaryConfig;
use crate::extract::{truncate_chars, MAX_CONTENT_CHARS};

/// Characters of extracted text sent to the provider.
pub const PROMPT_INPUT_CHARS: usize = 100_000;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Returns the model identifier, or `"disabled"`.
    fn model_name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Builds the fixed summarization prompt around the first
/// [`PROMPT_INPUT_CHARS`] characters of `text`.
pub fn build_prompt(text: &str) -> String {
    format!(
        "Please provide a concise summary of the following federal regulation text.\n\
         The summary should be less than 500 words and capture the key points, requirements, and scope of the regulation.\n\
         Highlight any content that would indicate that the regulation hurts business. Use HTML to format the summary, not Markdown.\n\
         \n\
         \n\
         Text:\n{}",
        prompt_input(text)
    )
}

/// The part of `text` that is sent to the model.
fn prompt_input(text: &str) -> &str {
    truncate_chars(text, PROMPT_INPUT_CHARS)
}

/// Summarizes `text`, or returns it truncated when summarization is
/// disabled or fails. Empty input is returned without calling the provider.
pub async fn summarize_or_fallback(summarizer: &dyn Summarizer, text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let fallback = || truncate_chars(text, MAX_CONTENT_CHARS).to_string();

    if !summarizer.is_enabled() {
        return fallback();
    }

    match summarizer.summarize(text).await {
        Ok(summary) if !summary.trim().is_empty() => {
            truncate_chars(&summary, MAX_CONTENT_CHARS).to_string()
        }
        Ok(_) => {
            tracing::warn!(model = summarizer.model_name(), "empty summary, storing extracted text");
            fallback()
        }
        Err(e) => {
            tracing::warn!(
                model = summarizer.model_name(),
                error = %e,
                "summarization failed, storing extracted text"
            );
            fallback()
        }
    }
}

pub fn create_summarizer(config: &SummaryConfig) -> Result<Box<dyn Summarizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledSummarizer)),
        "anthropic" => Ok(Box::new(AnthropicSummarizer::new(config)?)),
        other => bail!("Unknown summary provider: {}", other),
    }
}

// ============ Disabled ============

pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn summarize(&self, _text: &str) -> Result<String> {
        bail!("Summary provider is disabled")
    }
}

// ============ Anthropic ============

/// Summarizer backed by `POST {base_url}/messages`.
///
/// Requires `ANTHROPIC_API_KEY` in the environment unless constructed with
/// [`AnthropicSummarizer::with_api_key`].
pub struct AnthropicSummarizer {
    model: String,
    max_tokens: u32,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl AnthropicSummarizer {
    pub fn new(config: &SummaryConfig) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &SummaryConfig, api_key: impl Into<String>) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("summary.model required for Anthropic provider"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            max_tokens: config.max_tokens,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "user", "content": build_prompt(text) }
            ],
        });

        tracing::debug!(
            model = %self.model,
            chars = prompt_input(text).chars().count(),
            "summary request"
        );

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Anthropic API error {}: {}", status, body_text);
        }

        let parsed: MessagesResponse = response.json().await?;
        let summary: Vec<String> = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();

        if summary.is_empty() {
            bail!("Anthropic response contained no text");
        }
        Ok(summary.join("\n"))
    }
}
