//! Value types that flow between pipeline steps.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s<>]+@[^@\s<>]+\.[^@\s<>]+$").unwrap());

// ── Task ────────────────────────────────────────────────────────────

/// A request to produce one reply email.
///
/// Built once, validated, then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTask {
    pub session_id: String,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_hint: Option<String>,
    pub description: String,
}

impl EmailTask {
    /// New task with a fresh session id.
    pub fn new(recipient: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            recipient: recipient.into(),
            subject_hint: None,
            body_hint: None,
            description: description.into(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_subject_hint(mut self, hint: impl Into<String>) -> Self {
        self.subject_hint = Some(hint.into());
        self
    }

    pub fn with_body_hint(mut self, hint: impl Into<String>) -> Self {
        self.body_hint = Some(hint.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.session_id.trim().is_empty() {
            return Err(ValidationError::EmptySessionId);
        }
        if !EMAIL_RE.is_match(self.recipient.trim()) {
            return Err(ValidationError::InvalidRecipient(self.recipient.clone()));
        }
        if self.description.trim().is_empty() {
            return Err(ValidationError::EmptyDescription);
        }
        Ok(())
    }
}

// ── Intent ──────────────────────────────────────────────────────────

/// Well-known intent labels. Classifiers may return others.
pub mod labels {
    pub const GENERAL: &str = "general";
    pub const FOLLOW_UP: &str = "follow_up";
    pub const THANK_YOU: &str = "thank_you";
    pub const PRICING_REQUEST: &str = "pricing_request";
    pub const RESEARCH_REQUEST: &str = "research_request";
    pub const ERROR_FALLBACK: &str = "Error_Fallback";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

impl std::str::FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" | "urgent" => Ok(Self::High),
            other => Err(format!("unknown urgency: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentResult {
    pub label: String,
    pub urgency: Urgency,
    pub needs_external: bool,
}

impl IntentResult {
    pub fn new(label: impl Into<String>, urgency: Urgency, needs_external: bool) -> Self {
        Self {
            label: label.into(),
            urgency,
            needs_external,
        }
    }

    /// Used when classification failed. Treated as a general inquiry downstream.
    pub fn fallback() -> Self {
        Self::new(labels::ERROR_FALLBACK, Urgency::High, false)
    }

    /// Only a courtesy reply skips the knowledge base.
    pub fn needs_internal_knowledge(&self) -> bool {
        self.label != labels::THANK_YOU
    }

    /// Research requests go straight to the external fetcher.
    pub fn is_research(&self) -> bool {
        self.label == labels::RESEARCH_REQUEST
    }
}

// ── Retrieval ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub snippets: Vec<String>,
    /// In [0, 1].
    pub confidence: f32,
    pub escalation_required: bool,
}

impl RetrievedContext {
    pub fn new(snippets: Vec<String>, confidence: f32, escalation_required: bool) -> Self {
        Self {
            snippets,
            confidence: confidence.clamp(0.0, 1.0),
            escalation_required,
        }
    }

    /// Result of a failed retrieval: nothing known, ask a human.
    pub fn degraded() -> Self {
        Self::new(Vec::new(), 0.0, true)
    }
}

// ── Draft ───────────────────────────────────────────────────────────

/// Where a piece of draft content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    VectorDb,
    ExternalTool,
    HumanFeedback,
    SystemError,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::VectorDb => "vector_db",
            Self::ExternalTool => "external_tool",
            Self::HumanFeedback => "human_feedback",
            Self::SystemError => "system_error",
        };
        write!(f, "{s}")
    }
}

pub const ERROR_SUBJECT_PREFIX: &str = "[ERROR]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub subject: String,
    pub body: String,
    /// Insertion-ordered, no duplicates.
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// One note per failed review, oldest first.
    #[serde(default)]
    pub revision_notes: Vec<String>,
}

impl Draft {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            sources: Vec::new(),
            trace_id: None,
            revision_notes: Vec::new(),
        }
    }

    /// Placeholder produced when drafting failed. Never approvable.
    pub fn error(reason: impl std::fmt::Display) -> Self {
        let mut draft = Self::new(
            format!("{ERROR_SUBJECT_PREFIX} Draft generation failed"),
            format!("Draft generation failed: {reason}"),
        );
        draft.add_source(Source::SystemError);
        draft
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.add_source(source);
        self
    }

    pub fn add_source(&mut self, source: Source) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }

    pub fn is_error(&self) -> bool {
        self.subject.starts_with(ERROR_SUBJECT_PREFIX) || self.sources.contains(&Source::SystemError)
    }
}

// ── Review ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub approved: bool,
    pub issues: Vec<String>,
    /// Always populated, even when nothing was redacted.
    pub redacted_body: String,
}

impl SafetyVerdict {
    pub fn approved(redacted_body: impl Into<String>) -> Self {
        Self {
            approved: true,
            issues: Vec::new(),
            redacted_body: redacted_body.into(),
        }
    }

    pub fn rejected(issues: Vec<String>, redacted_body: impl Into<String>) -> Self {
        Self {
            approved: false,
            issues,
            redacted_body: redacted_body.into(),
        }
    }
}

// ── Output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalEmail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// What the human reviewer decided at the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HumanDecision {
    Approve,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
}

impl HumanDecision {
    pub fn reject() -> Self {
        Self::Reject { feedback: None }
    }

    /// Blank feedback counts as no feedback.
    pub fn reject_with(feedback: impl Into<String>) -> Self {
        let feedback = feedback.into();
        Self::Reject {
            feedback: (!feedback.trim().is_empty()).then_some(feedback),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// Write-once snapshot of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub session_id: String,
    pub task: EmailTask,
    pub intent: Option<IntentResult>,
    pub context: Option<RetrievedContext>,
    pub external_info: Option<String>,
    pub draft: Option<Draft>,
    pub verdict: Option<SafetyVerdict>,
    pub final_email: Option<FinalEmail>,
    /// Routing decision, revision count, delivery status.
    pub extra: serde_json::Value,
    pub logged_at: DateTime<Utc>,
}
