//! Context retrieval from the knowledge base.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StepError;
use crate::knowledge::KnowledgeBase;
use crate::pipeline::types::{EmailTask, IntentResult, RetrievedContext, Urgency};

/// Snippets fetched per query.
pub const DEFAULT_TOP_K: usize = 4;

/// Confidence reported when the knowledge base has nothing relevant.
pub const EMPTY_CONFIDENCE: f32 = 0.2;

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// `feedback` is the reviewer's note after a rejection, if any.
    async fn retrieve(
        &self,
        task: &EmailTask,
        intent: &IntentResult,
        feedback: Option<&str>,
    ) -> Result<RetrievedContext, StepError>;
}

pub struct KnowledgeRetriever {
    kb: Arc<dyn KnowledgeBase>,
    top_k: usize,
}

impl KnowledgeRetriever {
    pub fn new(kb: Arc<dyn KnowledgeBase>) -> Self {
        Self {
            kb,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

fn build_query(task: &EmailTask, feedback: Option<&str>) -> String {
    let mut query = task.description.clone();
    if let Some(subject) = &task.subject_hint {
        query.push(' ');
        query.push_str(subject);
    }
    if let Some(feedback) = feedback {
        query.push(' ');
        query.push_str(feedback);
    }
    query
}

#[async_trait]
impl ContextRetriever for KnowledgeRetriever {
    async fn retrieve(
        &self,
        task: &EmailTask,
        intent: &IntentResult,
        feedback: Option<&str>,
    ) -> Result<RetrievedContext, StepError> {
        let hits = self.kb.search(&build_query(task, feedback), self.top_k).await?;

        let confidence = hits
            .iter()
            .map(|h| h.score)
            .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s))))
            .unwrap_or(EMPTY_CONFIDENCE);
        let escalation_required = hits.is_empty() && intent.urgency == Urgency::High;

        debug!(
            session_id = %task.session_id,
            hits = hits.len(),
            confidence,
            escalation_required,
            "Retrieved context"
        );

        Ok(RetrievedContext::new(
            hits.into_iter().map(|h| h.text).collect(),
            confidence,
            escalation_required,
        ))
    }
}
