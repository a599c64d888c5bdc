//! External information step.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StepError;
use crate::pipeline::types::{EmailTask, IntentResult, labels};
use crate::search::WebSearch;

/// Prefix of the summary stored when the external source could not be reached.
pub const EXTERNAL_ERROR_PREFIX: &str = "[External error]";

/// Error-tagged text used in place of a summary.
pub fn external_error(reason: impl std::fmt::Display) -> String {
    format!("{EXTERNAL_ERROR_PREFIX} Could not reach the external source: {reason}")
}

#[async_trait]
pub trait ExternalInfoFetcher: Send + Sync {
    async fn fetch(&self, task: &EmailTask, intent: &IntentResult) -> Result<String, StepError>;
}

/// Fetches a short digest through a [`WebSearch`] provider.
pub struct SearchFetcher {
    search: Arc<dyn WebSearch>,
    max_results: u32,
}

impl SearchFetcher {
    pub fn new(search: Arc<dyn WebSearch>, max_results: u32) -> Self {
        Self { search, max_results }
    }
}

fn build_query(task: &EmailTask, intent: &IntentResult) -> String {
    if intent.label == labels::PRICING_REQUEST {
        format!("{} market pricing", task.description.trim())
    } else {
        task.description.trim().to_string()
    }
}

#[async_trait]
impl ExternalInfoFetcher for SearchFetcher {
    async fn fetch(&self, task: &EmailTask, intent: &IntentResult) -> Result<String, StepError> {
        let query = build_query(task, intent);
        let results = self.search.search(&query, self.max_results).await?;
        debug!(
            session_id = %task.session_id,
            provider = self.search.provider_name(),
            hits = results.hits.len(),
            "Fetched external info"
        );
        Ok(results.summarize(&query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchError;
    use crate::pipeline::types::Urgency;
    use crate::search::{SearchResults, StubSearch};

    struct FailingSearch;

    #[async_trait]
    impl WebSearch for FailingSearch {
        fn provider_name(&self) -> &str {
            "failing"
        }

        async fn search(&self, _query: &str, _max: u32) -> Result<SearchResults, SearchError> {
            Err(SearchError::Http {
                status: 503,
                body: "unavailable".into(),
            })
        }
    }

    #[tokio::test]
    async fn stub_search_produces_summary() {
        let fetcher = SearchFetcher::new(Arc::new(StubSearch), 3);
        let task = EmailTask::new("a@example.com", "Energy market outlook");
        let intent = IntentResult::new(labels::GENERAL, Urgency::Normal, true);
        let info = fetcher.fetch(&task, &intent).await.unwrap();
        assert!(info.contains("Energy market outlook"));
    }

    #[tokio::test]
    async fn pricing_queries_mention_market_pricing() {
        let task = EmailTask::new("a@example.com", "Quote for 10 seats");
        let intent = IntentResult::new(labels::PRICING_REQUEST, Urgency::Normal, true);
        assert_eq!(build_query(&task, &intent), "Quote for 10 seats market pricing");
    }

    #[tokio::test]
    async fn provider_failure_is_a_step_error() {
        let fetcher = SearchFetcher::new(Arc::new(FailingSearch), 3);
        let task = EmailTask::new("a@example.com", "news");
        let intent = IntentResult::new(labels::GENERAL, Urgency::Normal, true);
        let err = fetcher.fetch(&task, &intent).await.unwrap_err();
        assert!(matches!(err, StepError::Provider(_)));
        assert!(external_error(err).starts_with("[External error]"));
    }
}
