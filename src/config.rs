//! Configuration types.
//!
//! Everything is resolved once at startup and passed down explicitly; nothing
//! here is read again while a run is in flight.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryConfig;

/// Upper bound accepted for `max_redraft_attempts`.
pub const MAX_REDRAFT_LIMIT: u32 = 100;

/// Workflow configuration shared read-only by every run.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Retrieval confidence below which external info is fetched (if the intent asks for it).
    pub confidence_threshold: f32,
    /// Redrafts allowed after the first draft before the run fails.
    pub max_redraft_attempts: u32,
    /// How long a run may wait at the human gate. `None` waits forever.
    pub human_gate_timeout: Option<Duration>,
    /// Upper bound for a single provider call.
    pub step_timeout: Duration,
    /// Backoff policy for provider calls.
    pub retry: RetryConfig,
    /// Minimum self-reported confidence of the LLM safety reviewer.
    pub min_safety_confidence: f32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            max_redraft_attempts: 3,
            human_gate_timeout: None,
            step_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            min_safety_confidence: 0.7,
        }
    }
}

impl WorkflowConfig {
    /// Build from `MAIL_CREW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let confidence_threshold =
            parse_env("MAIL_CREW_CONFIDENCE_THRESHOLD")?.unwrap_or(defaults.confidence_threshold);
        let max_redraft_attempts =
            parse_env("MAIL_CREW_MAX_REDRAFTS")?.unwrap_or(defaults.max_redraft_attempts);
        let human_gate_timeout = parse_env::<u64>("MAIL_CREW_HUMAN_GATE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .or(defaults.human_gate_timeout);
        let step_timeout = parse_env::<u64>("MAIL_CREW_STEP_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.step_timeout);
        let min_safety_confidence =
            parse_env("MAIL_CREW_MIN_SAFETY_CONFIDENCE")?.unwrap_or(defaults.min_safety_confidence);

        let mut retry = defaults.retry;
        if let Some(attempts) = parse_env("MAIL_CREW_RETRY_ATTEMPTS")? {
            retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_env("MAIL_CREW_RETRY_INITIAL_DELAY_MS")? {
            retry.initial_delay_ms = ms;
        }

        let config = Self {
            confidence_threshold,
            max_redraft_attempts,
            human_gate_timeout,
            step_timeout,
            retry,
            min_safety_confidence,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the router cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "confidence_threshold".to_string(),
                message: format!("{} is outside [0, 1]", self.confidence_threshold),
            });
        }
        if !(0.0..=1.0).contains(&self.min_safety_confidence) {
            return Err(ConfigError::InvalidValue {
                key: "min_safety_confidence".to_string(),
                message: format!("{} is outside [0, 1]", self.min_safety_confidence),
            });
        }
        if self.max_redraft_attempts > MAX_REDRAFT_LIMIT {
            return Err(ConfigError::InvalidValue {
                key: "max_redraft_attempts".to_string(),
                message: format!("{} exceeds the limit of {MAX_REDRAFT_LIMIT}", self.max_redraft_attempts),
            });
        }
        if self.step_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "step_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                message: "at least one attempt is required".to_string(),
            });
        }
        Ok(())
    }

    /// Step bound for one leg of a run (between two human decisions).
    pub fn max_steps(&self) -> u32 {
        self.max_redraft_attempts.saturating_mul(3).saturating_add(5)
    }
}

/// Filesystem locations used by the binary.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub db_path: PathBuf,
    pub journal_dir: PathBuf,
    pub knowledge_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mail-crew.db"),
            journal_dir: PathBuf::from("./logs"),
            knowledge_dir: None,
            log_dir: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("MAIL_CREW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            journal_dir: std::env::var("MAIL_CREW_JOURNAL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.journal_dir),
            knowledge_dir: std::env::var("MAIL_CREW_KNOWLEDGE_DIR").ok().map(PathBuf::from),
            log_dir: std::env::var("MAIL_CREW_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
