//! Web search used by the external-info step.
//!
//! `TavilySearch` calls the Tavily search API. `StubSearch` answers with a
//! simulated summary so the pipeline runs without network access.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::SearchError;

const DEFAULT_ENDPOINT: &str = "https://api.tavily.com/search";
const DEFAULT_MAX_RESULTS: u32 = 3;

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
}

/// Result of a search: an optional provider-written answer plus hits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub answer: Option<String>,
    pub hits: Vec<SearchHit>,
}

impl SearchResults {
    /// Short plain-text digest for the drafter.
    pub fn summarize(&self, query: &str) -> String {
        if self.answer.is_none() && self.hits.is_empty() {
            return format!("[External] No relevant results found for '{query}'.");
        }

        let mut lines = vec![format!("[External] Summary for '{query}':")];
        if let Some(answer) = &self.answer {
            lines.push(answer.trim().to_string());
        }
        for hit in &self.hits {
            lines.push(format!("- {} ({})", hit.title, hit.url));
        }
        lines.join("\n")
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn search(&self, query: &str, max_results: u32) -> Result<SearchResults, SearchError>;
}

/// Search configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: Option<SecretString>,
    pub endpoint: String,
    pub max_results: u32,
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_results: DEFAULT_MAX_RESULTS,
            timeout: Duration::from_secs(10),
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("TAVILY_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            endpoint: std::env::var("MAIL_CREW_SEARCH_ENDPOINT").unwrap_or(defaults.endpoint),
            max_results: std::env::var("MAIL_CREW_SEARCH_MAX_RESULTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_results),
            timeout: defaults.timeout,
        }
    }
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    max_results: u32,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

/// Tavily search client.
#[derive(Debug, Clone)]
pub struct TavilySearch {
    client: Client,
    api_key: SecretString,
    endpoint: String,
}

impl TavilySearch {
    pub fn new(api_key: SecretString, endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl WebSearch for TavilySearch {
    fn provider_name(&self) -> &str {
        "tavily"
    }

    #[instrument(skip(self), fields(provider = "tavily"))]
    async fn search(&self, query: &str, max_results: u32) -> Result<SearchResults, SearchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&TavilyRequest {
                query,
                max_results,
                include_answer: true,
            })
            .send()
            .await
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::InvalidResponse(e.to_string()))?;

        debug!(hits = parsed.results.len(), "Search complete");
        Ok(SearchResults {
            answer: parsed.answer.filter(|a| !a.trim().is_empty()),
            hits: parsed.results.into_iter().take(max_results as usize).collect(),
        })
    }
}

/// Offline search: always answers with a simulated summary.
#[derive(Debug, Clone, Default)]
pub struct StubSearch;

#[async_trait]
impl WebSearch for StubSearch {
    fn provider_name(&self) -> &str {
        "stub"
    }

    async fn search(&self, query: &str, _max_results: u32) -> Result<SearchResults, SearchError> {
        Ok(SearchResults {
            answer: Some(format!("[External stub] Simulated market summary for: '{query}'.")),
            hits: Vec::new(),
        })
    }
}
