//! Error types for Mail Crew.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Web search errors.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search request failed: {0}")]
    RequestFailed(String),

    #[error("Search API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid search response: {0}")]
    InvalidResponse(String),
}

/// Failure of a single pipeline step call (classify, retrieve, external, draft, review).
///
/// Never crosses a state boundary: the orchestrator turns every `StepError`
/// into degraded-but-valid data.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed provider response: {0}")]
    Parse(String),
}

impl From<LlmError> for StepError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::InvalidResponse { reason, .. } => Self::Parse(reason),
            LlmError::Json(e) => Self::Parse(e.to_string()),
            other => Self::Provider(other.to_string()),
        }
    }
}

impl From<SearchError> for StepError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::InvalidResponse(reason) => Self::Parse(reason),
            other => Self::Provider(other.to_string()),
        }
    }
}

/// Task validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid recipient address: '{0}'")]
    InvalidRecipient(String),

    #[error("Task description must not be empty")]
    EmptyDescription,

    #[error("Session id must not be empty")]
    EmptySessionId,
}

/// Journal (JSONL sink) errors.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Kind of a caller-facing run failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunErrorKind {
    /// The draft/review loop exceeded the configured redraft budget.
    RevisionLimitExceeded { attempts: u32 },
    /// The send collaborator refused the final email.
    SendFailure,
    /// The task failed validation before the run started.
    InvalidTask,
    /// No persisted run exists for the session id.
    NotFound,
    /// The run is not in a state that accepts the requested action.
    InvalidState { state: String },
    /// The run waited at the human gate longer than the configured timeout.
    ApprovalExpired,
    /// Persisting or loading run state failed.
    Storage,
}

impl std::fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RevisionLimitExceeded { .. } => "revision_limit_exceeded",
            Self::SendFailure => "send_failure",
            Self::InvalidTask => "invalid_task",
            Self::NotFound => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::ApprovalExpired => "approval_expired",
            Self::Storage => "storage",
        };
        write!(f, "{s}")
    }
}

/// Structured error returned to callers of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[error("{kind} (session {session_id}): {message}")]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
    pub session_id: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session_id: session_id.into(),
        }
    }

    pub fn storage(session_id: impl Into<String>, e: DatabaseError) -> Self {
        Self::new(RunErrorKind::Storage, session_id, e.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
