//! Intent classification.
//!
//! `KeywordIntentClassifier` is a fast regex pass that needs no provider.
//! `LlmIntentClassifier` asks the model for a JSON verdict.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::{LlmError, StepError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::pipeline::types::{EmailTask, IntentResult, Urgency, labels};

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, task: &EmailTask) -> Result<IntentResult, StepError>;
}

// ── Keyword classifier ──────────────────────────────────────────────

/// Maps a keyword pattern to an intent label. First match wins.
#[derive(Debug, Clone)]
pub struct LabelRule {
    pub label: String,
    pub regex: Regex,
}

pub struct KeywordIntentClassifier {
    label_rules: Vec<LabelRule>,
    urgency: Regex,
    external: Regex,
}

impl KeywordIntentClassifier {
    /// English and French keywords for the common customer-service intents.
    pub fn default_rules() -> Self {
        let label_rules = vec![
            LabelRule {
                label: labels::RESEARCH_REQUEST.into(),
                regex: Regex::new(r"(?i)\b(research|recherche|investigate|look up)\b").unwrap(),
            },
            LabelRule {
                label: labels::FOLLOW_UP.into(),
                regex: Regex::new(r"(?i)(follow[- ]?up|relance)").unwrap(),
            },
            LabelRule {
                label: labels::THANK_YOU.into(),
                regex: Regex::new(r"(?i)(merci|thank you|thanks)").unwrap(),
            },
            LabelRule {
                label: labels::PRICING_REQUEST.into(),
                regex: Regex::new(r"(?i)(prix|tarif|pricing|quote|devis)").unwrap(),
            },
        ];

        Self {
            label_rules,
            urgency: Regex::new(r"(?i)(urgent|asap|dès que possible|des que possible)").unwrap(),
            external: Regex::new(r"(?i)(marché|market|news|actualité)").unwrap(),
        }
    }

    /// Add a label rule evaluated before the defaults.
    pub fn add_rule(&mut self, label: &str, pattern: &str) -> Result<(), regex::Error> {
        self.label_rules.insert(
            0,
            LabelRule {
                label: label.to_string(),
                regex: Regex::new(pattern)?,
            },
        );
        Ok(())
    }

    pub fn evaluate(&self, task: &EmailTask) -> IntentResult {
        let text = &task.description;

        let label = self
            .label_rules
            .iter()
            .find(|r| r.regex.is_match(text))
            .map(|r| r.label.clone())
            .unwrap_or_else(|| labels::GENERAL.to_string());

        let urgency = if self.urgency.is_match(text) {
            Urgency::High
        } else {
            Urgency::Normal
        };
        let needs_external = label == labels::RESEARCH_REQUEST || self.external.is_match(text);

        debug!(session_id = %task.session_id, label = %label, "Keyword classification");
        IntentResult::new(label, urgency, needs_external)
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, task: &EmailTask) -> Result<IntentResult, StepError> {
        Ok(self.evaluate(task))
    }
}

// ── LLM classifier ──────────────────────────────────────────────────

const CLASSIFY_MAX_TOKENS: u32 = 256;
const CLASSIFY_TEMPERATURE: f32 = 0.0;

pub struct LlmIntentClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, task: &EmailTask) -> Result<IntentResult, StepError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt()),
            ChatMessage::user(build_classify_user_prompt(task)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        parse_intent_response(&response.content).map_err(|reason| {
            StepError::from(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            })
        })
    }
}

fn build_classify_system_prompt() -> String {
    "You classify customer-service email requests.\n\n\
     Labels: \"general\", \"follow_up\", \"thank_you\", \"pricing_request\", \"research_request\".\n\
     Urgency: \"low\", \"normal\" or \"high\".\n\
     needs_external: true only if answering requires current public information (markets, news).\n\n\
     Respond with ONLY a JSON object:\n\
     {\"label\": \"...\", \"urgency\": \"...\", \"needs_external\": false}"
        .to_string()
}

fn build_classify_user_prompt(task: &EmailTask) -> String {
    let mut prompt = String::with_capacity(256);
    if let Some(subject) = &task.subject_hint {
        prompt.push_str(&format!("Subject hint: {subject}\n"));
    }
    let description: String = task.description.chars().take(2000).collect();
    prompt.push_str(&format!("Request:\n{description}"));
    prompt
}

#[derive(Debug, serde::Deserialize)]
struct IntentResponse {
    label: String,
    #[serde(default)]
    urgency: String,
    #[serde(default)]
    needs_external: bool,
}

fn parse_intent_response(raw: &str) -> Result<IntentResult, String> {
    let json_str = extract_json_object(raw);
    let response: IntentResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let label = response.label.trim().to_ascii_lowercase();
    if label.is_empty() {
        return Err("empty intent label".into());
    }
    let urgency = response.urgency.parse().unwrap_or_default();

    Ok(IntentResult::new(label, urgency, response.needs_external))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, FinishReason};

    fn task(description: &str) -> EmailTask {
        EmailTask::new("client@example.com", description)
    }

    // ── Keyword rules ───────────────────────────────────────────────

    #[test]
    fn keyword_labels() {
        let c = KeywordIntentClassifier::default_rules();
        assert_eq!(c.evaluate(&task("Petite relance sur le devis")).label, "follow_up");
        assert_eq!(c.evaluate(&task("Thank you for the quick help")).label, "thank_you");
        assert_eq!(c.evaluate(&task("Quel est le tarif annuel ?")).label, "pricing_request");
        assert_eq!(c.evaluate(&task("Where is my parcel?")).label, "general");
    }

    #[test]
    fn keyword_urgency_and_external() {
        let c = KeywordIntentClassifier::default_rules();
        let intent = c.evaluate(&task("URGENT: need the market outlook asap"));
        assert_eq!(intent.urgency, Urgency::High);
        assert!(intent.needs_external);

        let calm = c.evaluate(&task("Can you resend the invoice?"));
        assert_eq!(calm.urgency, Urgency::Normal);
        assert!(!calm.needs_external);
    }

    #[test]
    fn research_keyword_needs_external() {
        let c = KeywordIntentClassifier::default_rules();
        let intent = c.evaluate(&task("Please research competitor offers"));
        assert_eq!(intent.label, "research_request");
        assert!(intent.needs_external);
    }

    #[test]
    fn custom_rule_takes_precedence() {
        let mut c = KeywordIntentClassifier::default_rules();
        c.add_rule("refund_request", r"(?i)refund").unwrap();
        assert_eq!(c.evaluate(&task("Refund please, thank you")).label, "refund_request");
        assert!(c.add_rule("bad", "(unclosed").is_err());
    }

    // ── LLM response parsing ────────────────────────────────────────

    #[test]
    fn parse_fenced_intent() {
        let raw = "```json\n{\"label\": \"Pricing_Request\", \"urgency\": \"high\", \"needs_external\": true}\n```";
        let intent = parse_intent_response(raw).unwrap();
        assert_eq!(intent.label, "pricing_request");
        assert_eq!(intent.urgency, Urgency::High);
        assert!(intent.needs_external);
    }

    #[test]
    fn parse_defaults_missing_fields() {
        let intent = parse_intent_response(r#"{"label": "general"}"#).unwrap();
        assert_eq!(intent.urgency, Urgency::Normal);
        assert!(!intent.needs_external);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_intent_response("I think it's a pricing question").is_err());
        assert!(parse_intent_response(r#"{"label": "  "}"#).is_err());
    }

    // ── LLM classifier ──────────────────────────────────────────────

    struct MockLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.reply.clone(),
                input_tokens: 10,
                output_tokens: 10,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    #[tokio::test]
    async fn llm_classifier_parses_reply() {
        let llm = Arc::new(MockLlm {
            reply: r#"{"label": "follow_up", "urgency": "low", "needs_external": false}"#.into(),
        });
        let intent = LlmIntentClassifier::new(llm).classify(&task("any")).await.unwrap();
        assert_eq!(intent.label, "follow_up");
        assert_eq!(intent.urgency, Urgency::Low);
    }

    #[tokio::test]
    async fn llm_classifier_malformed_reply_is_parse_error() {
        let llm = Arc::new(MockLlm {
            reply: "no idea".into(),
        });
        let err = LlmIntentClassifier::new(llm).classify(&task("any")).await.unwrap_err();
        assert!(matches!(err, StepError::Parse(_)));
    }
}
