//! Reply drafting.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{LlmError, StepError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::pipeline::types::{Draft, EmailTask, IntentResult, RetrievedContext, Source};
use crate::safety::SafetyLayer;

/// Everything a drafter may use.
#[derive(Debug, Clone, Copy)]
pub struct DraftRequest<'a> {
    pub task: &'a EmailTask,
    pub intent: Option<&'a IntentResult>,
    pub context: Option<&'a RetrievedContext>,
    pub external_info: Option<&'a str>,
    pub human_feedback: Option<&'a str>,
    /// Notes from failed reviews, oldest first.
    pub revision_notes: &'a [String],
}

impl<'a> DraftRequest<'a> {
    pub fn new(task: &'a EmailTask) -> Self {
        Self {
            task,
            intent: None,
            context: None,
            external_info: None,
            human_feedback: None,
            revision_notes: &[],
        }
    }

    fn snippets(&self) -> &'a [String] {
        self.context.map(|c| c.snippets.as_slice()).unwrap_or(&[])
    }

    /// Provenance implied by the inputs, in a stable order.
    pub fn sources(&self) -> Vec<Source> {
        let mut sources = Vec::new();
        if !self.snippets().is_empty() {
            sources.push(Source::VectorDb);
        }
        if self.external_info.is_some() {
            sources.push(Source::ExternalTool);
        }
        if self.human_feedback.is_some() {
            sources.push(Source::HumanFeedback);
        }
        sources
    }
}

#[async_trait]
pub trait Drafter: Send + Sync {
    async fn draft(&self, request: &DraftRequest<'_>) -> Result<Draft, StepError>;
}

fn finish(mut draft: Draft, request: &DraftRequest<'_>) -> Draft {
    for source in request.sources() {
        draft.add_source(source);
    }
    draft.revision_notes = request.revision_notes.to_vec();
    draft
}

// ── Template drafter ────────────────────────────────────────────────

pub const DEFAULT_SUBJECT: &str = "Following up on our exchange";
const MAX_SNIPPETS: usize = 3;
const SNIPPET_CHARS: usize = 220;

/// Deterministic drafter: fixed greeting, the request, context, closing.
///
/// When revising, the body is scrubbed with the local safety layer so content
/// the reviewer flagged does not come back.
pub struct TemplateDrafter {
    safety: SafetyLayer,
    signature: String,
}

impl TemplateDrafter {
    pub fn new() -> Self {
        Self {
            safety: SafetyLayer::new(),
            signature: "Your customer service team".to_string(),
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn render(&self, request: &DraftRequest<'_>) -> Draft {
        let task = request.task;
        let subject = task
            .subject_hint
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());

        let mut lines: Vec<String> = vec![
            "Hello,".into(),
            String::new(),
            "I am getting back to you regarding:".into(),
            format!("- {}", task.description.trim()),
            String::new(),
        ];

        let snippets = request.snippets();
        if !snippets.is_empty() {
            lines.push("Relevant information from our records:".into());
            for snippet in snippets.iter().take(MAX_SNIPPETS) {
                let one_line = snippet.replace('\n', " ");
                let short: String = one_line.chars().take(SNIPPET_CHARS).collect();
                if short.len() < one_line.len() {
                    lines.push(format!("- {short}..."));
                } else {
                    lines.push(format!("- {short}"));
                }
            }
            lines.push(String::new());
        }

        if let Some(external) = request.external_info {
            lines.push("Additional external information:".into());
            lines.push(external.to_string());
            lines.push(String::new());
        }

        if let Some(feedback) = request.human_feedback {
            lines.push("Taking your remarks into account:".into());
            lines.push(feedback.to_string());
            lines.push(String::new());
        }

        if let Some(hint) = &task.body_hint {
            lines.push(hint.clone());
            lines.push(String::new());
        }

        lines.push("Do not hesitate to get back to us with any questions.".into());
        lines.push(String::new());
        lines.push("Kind regards,".into());
        lines.push(self.signature.clone());

        let mut body = lines.join("\n");
        if !request.revision_notes.is_empty() {
            body = self.safety.redact(&body);
        }

        finish(Draft::new(subject, body), request)
    }
}

impl Default for TemplateDrafter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Drafter for TemplateDrafter {
    async fn draft(&self, request: &DraftRequest<'_>) -> Result<Draft, StepError> {
        Ok(self.render(request))
    }
}

// ── LLM drafter ─────────────────────────────────────────────────────

const DRAFT_MAX_TOKENS: u32 = 1024;
const DRAFT_TEMPERATURE: f32 = 0.4;

pub struct LlmDrafter {
    llm: Arc<dyn LlmProvider>,
}

impl LlmDrafter {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Drafter for LlmDrafter {
    async fn draft(&self, request: &DraftRequest<'_>) -> Result<Draft, StepError> {
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(build_draft_system_prompt()),
            ChatMessage::user(build_draft_user_prompt(request)),
        ])
        .with_temperature(DRAFT_TEMPERATURE)
        .with_max_tokens(DRAFT_MAX_TOKENS);

        let response = self.llm.complete(completion).await?;
        let draft = parse_draft_response(&response.content).map_err(|reason| {
            StepError::from(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            })
        })?;
        Ok(finish(draft, request))
    }
}

fn build_draft_system_prompt() -> String {
    "You write professional customer-service replies by email.\n\
     Use only the facts provided. Never include passwords, card numbers or internal secrets.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"subject\": \"...\", \"body\": \"...\"}"
        .to_string()
}

fn build_draft_user_prompt(request: &DraftRequest<'_>) -> String {
    let task = request.task;
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(&format!("Recipient: {}\n", task.recipient));
    if let Some(subject) = &task.subject_hint {
        prompt.push_str(&format!("Subject hint: {subject}\n"));
    }
    if let Some(intent) = request.intent {
        prompt.push_str(&format!("Intent: {} (urgency {:?})\n", intent.label, intent.urgency));
    }
    prompt.push_str(&format!("\nRequest:\n{}\n", task.description.trim()));

    let snippets = request.snippets();
    if !snippets.is_empty() {
        prompt.push_str("\nKnowledge base:\n");
        for (i, snippet) in snippets.iter().enumerate() {
            let preview: String = snippet.chars().take(600).collect();
            prompt.push_str(&format!("  [{}] {}\n", i + 1, preview));
        }
    }
    if let Some(external) = request.external_info {
        prompt.push_str(&format!("\nExternal information:\n{external}\n"));
    }
    if let Some(hint) = &task.body_hint {
        prompt.push_str(&format!("\nWriting instructions: {hint}\n"));
    }
    if let Some(feedback) = request.human_feedback {
        prompt.push_str(&format!("\nReviewer feedback on the previous draft: {feedback}\n"));
    }
    if !request.revision_notes.is_empty() {
        prompt.push_str("\nThe previous drafts were rejected by the safety review:\n");
        for note in request.revision_notes {
            prompt.push_str(&format!("- {note}\n"));
        }
    }

    prompt
}

#[derive(Debug, serde::Deserialize)]
struct DraftResponse {
    #[serde(default)]
    subject: String,
    body: String,
}

fn parse_draft_response(raw: &str) -> Result<Draft, String> {
    let json_str = extract_json_object(raw);
    let response: DraftResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    if response.body.trim().is_empty() {
        return Err("draft body is empty".into());
    }
    let subject = if response.subject.trim().is_empty() {
        DEFAULT_SUBJECT.to_string()
    } else {
        response.subject.trim().to_string()
    };
    Ok(Draft::new(subject, response.body))
}
