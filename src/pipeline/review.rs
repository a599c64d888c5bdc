//! Safety review of drafts.
//!
//! Both reviewers fail closed: an error draft, a malformed reviewer reply or an
//! unreachable provider never yields an approved verdict. The redacted body is
//! always computed locally so it is available even when the provider is down.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{LlmError, StepError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::pipeline::types::{Draft, EmailTask, SafetyVerdict};
use crate::safety::SafetyLayer;

#[async_trait]
pub trait SafetyReviewer: Send + Sync {
    async fn review(&self, task: &EmailTask, draft: &Draft) -> Result<SafetyVerdict, StepError>;
}

/// Rejected verdict carrying `reason`, with the body scrubbed locally.
pub fn fail_closed(layer: &SafetyLayer, draft: &Draft, reason: impl Into<String>) -> SafetyVerdict {
    let scan = layer.scan(&draft.body);
    let mut issues = vec![reason.into()];
    issues.extend(scan.issues);
    SafetyVerdict::rejected(issues, scan.redacted)
}

fn error_draft_issue() -> String {
    "Draft is an error placeholder and cannot be sent".to_string()
}

// ── Blocklist reviewer ──────────────────────────────────────────────

/// Approves a draft when the local scan finds nothing.
pub struct BlocklistReviewer {
    layer: SafetyLayer,
}

impl BlocklistReviewer {
    pub fn new(layer: SafetyLayer) -> Self {
        Self { layer }
    }
}

impl Default for BlocklistReviewer {
    fn default() -> Self {
        Self::new(SafetyLayer::new())
    }
}

#[async_trait]
impl SafetyReviewer for BlocklistReviewer {
    async fn review(&self, _task: &EmailTask, draft: &Draft) -> Result<SafetyVerdict, StepError> {
        if draft.is_error() {
            return Ok(fail_closed(&self.layer, draft, error_draft_issue()));
        }

        let scan = self.layer.scan(&draft.body);
        if scan.is_clean() {
            Ok(SafetyVerdict::approved(scan.redacted))
        } else {
            Ok(SafetyVerdict::rejected(scan.issues, scan.redacted))
        }
    }
}

// ── LLM reviewer ────────────────────────────────────────────────────

const REVIEW_MAX_TOKENS: u32 = 512;
const REVIEW_TEMPERATURE: f32 = 0.0;

/// Asks the model for a compliance verdict on top of the local scan.
pub struct LlmSafetyReviewer {
    llm: Arc<dyn LlmProvider>,
    layer: SafetyLayer,
    min_confidence: f32,
}

impl LlmSafetyReviewer {
    pub fn new(llm: Arc<dyn LlmProvider>, min_confidence: f32) -> Self {
        Self {
            llm,
            layer: SafetyLayer::new(),
            min_confidence,
        }
    }

    pub fn with_layer(mut self, layer: SafetyLayer) -> Self {
        self.layer = layer;
        self
    }
}

#[async_trait]
impl SafetyReviewer for LlmSafetyReviewer {
    async fn review(&self, task: &EmailTask, draft: &Draft) -> Result<SafetyVerdict, StepError> {
        if draft.is_error() {
            return Ok(fail_closed(&self.layer, draft, error_draft_issue()));
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_review_system_prompt()),
            ChatMessage::user(build_review_user_prompt(task, draft)),
        ])
        .with_temperature(REVIEW_TEMPERATURE)
        .with_max_tokens(REVIEW_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let llm_verdict = parse_review_response(&response.content).map_err(|reason| {
            StepError::from(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            })
        })?;

        let scan = self.layer.scan(&draft.body);
        let mut issues = scan.issues;
        issues.extend(llm_verdict.issues);
        if llm_verdict.confidence < self.min_confidence {
            issues.push(format!(
                "Reviewer confidence {:.2} is below the required {:.2}",
                llm_verdict.confidence, self.min_confidence
            ));
        }

        let approved = llm_verdict.approved && issues.is_empty();
        debug!(
            session_id = %task.session_id,
            approved,
            issues = issues.len(),
            confidence = llm_verdict.confidence,
            "LLM safety review"
        );

        Ok(SafetyVerdict {
            approved,
            issues,
            redacted_body: scan.redacted,
        })
    }
}

fn build_review_system_prompt() -> String {
    "You review outgoing customer-service emails for safety and compliance.\n\
     Reject drafts that leak personal data, credentials or internal information, make \
     promises the company cannot keep, or are rude.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"approved\": true, \"issues\": [\"...\"], \"confidence\": 0.0}"
        .to_string()
}

fn build_review_user_prompt(task: &EmailTask, draft: &Draft) -> String {
    format!(
        "Recipient: {}\nOriginal request: {}\n\nSubject: {}\n\n{}",
        task.recipient,
        task.description.trim(),
        draft.subject,
        draft.body
    )
}

#[derive(Debug, serde::Deserialize)]
struct ReviewResponse {
    approved: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

fn parse_review_response(raw: &str) -> Result<ReviewResponse, String> {
    let json_str = extract_json_object(raw);
    let mut response: ReviewResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;
    response.confidence = response.confidence.clamp(0.0, 1.0);
    response.issues.retain(|i| !i.trim().is_empty());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, FinishReason};

    fn task() -> EmailTask {
        EmailTask::new("client@example.com", "Delivery question")
    }

    // ── Blocklist reviewer ──────────────────────────────────────────

    #[tokio::test]
    async fn clean_draft_is_approved() {
        let verdict = BlocklistReviewer::default()
            .review(&task(), &Draft::new("Hi", "Your parcel ships today."))
            .await
            .unwrap();
        assert!(verdict.approved);
        assert!(verdict.issues.is_empty());
        assert_eq!(verdict.redacted_body, "Your parcel ships today.");
    }

    #[tokio::test]
    async fn blocklisted_draft_is_rejected_and_redacted() {
        let verdict = BlocklistReviewer::default()
            .review(&task(), &Draft::new("Hi", "See mot_interdit1 for details."))
            .await
            .unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.issues.len(), 1);
        assert_eq!(verdict.redacted_body, "See [REDACTED] for details.");
    }

    #[tokio::test]
    async fn error_draft_fails_closed() {
        let verdict = BlocklistReviewer::default()
            .review(&task(), &Draft::error("timeout"))
            .await
            .unwrap();
        assert!(!verdict.approved);
        assert!(!verdict.redacted_body.is_empty());
    }

    // ── LLM reviewer ────────────────────────────────────────────────

    struct MockLlm(String);

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.0.clone(),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn reviewer(reply: &str) -> LlmSafetyReviewer {
        LlmSafetyReviewer::new(Arc::new(MockLlm(reply.into())), 0.7)
    }

    #[tokio::test]
    async fn llm_approval_passes_through() {
        let verdict = reviewer(r#"{"approved": true, "issues": [], "confidence": 0.95}"#)
            .review(&task(), &Draft::new("Hi", "All good."))
            .await
            .unwrap();
        assert!(verdict.approved);
    }

    #[tokio::test]
    async fn low_confidence_is_reported_as_issue() {
        let verdict = reviewer(r#"{"approved": true, "issues": [], "confidence": 0.4}"#)
            .review(&task(), &Draft::new("Hi", "All good."))
            .await
            .unwrap();
        assert!(!verdict.approved);
        assert!(verdict.issues[0].contains("below the required 0.70"));
    }

    #[tokio::test]
    async fn local_findings_override_llm_approval() {
        let verdict = reviewer(r#"```json
{"approved": true, "confidence": 0.9}
```"#)
            .review(&task(), &Draft::new("Hi", "password: hunter2"))
            .await
            .unwrap();
        assert!(!verdict.approved);
        assert!(!verdict.redacted_body.contains("hunter2"));
    }

    #[tokio::test]
    async fn custom_layer_is_used_for_local_scan() {
        let verdict = reviewer(r#"{"approved": true, "issues": [], "confidence": 0.95}"#)
            .with_layer(SafetyLayer::with_blocklist(vec!["embargo".into()]))
            .review(&task(), &Draft::new("Hi", "The Embargo lifts on Monday."))
            .await
            .unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.redacted_body, "The [REDACTED] lifts on Monday.");
    }

    #[tokio::test]
    async fn malformed_reply_is_parse_error() {
        let err = reviewer("looks fine to me")
            .review(&task(), &Draft::new("Hi", "All good."))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Parse(_)));
    }

    #[test]
    fn fail_closed_keeps_reason_first() {
        let layer = SafetyLayer::new();
        let verdict = fail_closed(&layer, &Draft::new("s", "mot_interdit1"), "reviewer unavailable");
        assert!(!verdict.approved);
        assert_eq!(verdict.issues[0], "reviewer unavailable");
        assert_eq!(verdict.redacted_body, "[REDACTED]");
    }
}
