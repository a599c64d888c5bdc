//! Append-only JSON-lines journal.
//!
//! Two streams: per-transition run events (`events.jsonl`) and one
//! [`TaskLogEntry`] per finished run (`tasks.jsonl`). The orchestrator treats
//! failures here as warnings; they never change the course of a run.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::JournalError;
use crate::pipeline::types::TaskLogEntry;

const EVENTS_FILE: &str = "events.jsonl";
const TASKS_FILE: &str = "tasks.jsonl";

/// One line of the event log: `{session_id, step, timestamp, ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub session_id: String,
    pub step: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RunEvent {
    pub fn new(session_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            step: step.into(),
            timestamp: Utc::now(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record_event(&self, event: &RunEvent) -> Result<(), JournalError>;
}

#[async_trait]
pub trait TaskLogSink: Send + Sync {
    async fn record_task(&self, entry: &TaskLogEntry) -> Result<(), JournalError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournal;

#[async_trait]
impl EventSink for NoopJournal {
    async fn record_event(&self, _event: &RunEvent) -> Result<(), JournalError> {
        Ok(())
    }
}

#[async_trait]
impl TaskLogSink for NoopJournal {
    async fn record_task(&self, _entry: &TaskLogEntry) -> Result<(), JournalError> {
        Ok(())
    }
}

/// Writes both streams as JSON lines under one directory.
pub struct JsonlJournal {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlJournal {
    /// Create the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.dir.join(TASKS_FILE)
    }

    async fn append<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, JournalError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt journal line"),
            }
        }
        Ok(items)
    }

    /// Every event recorded for `session_id`, in write order.
    pub async fn session_history(&self, session_id: &str) -> Result<Vec<RunEvent>, JournalError> {
        let events: Vec<RunEvent> = Self::read_lines(&self.events_path()).await?;
        Ok(events.into_iter().filter(|e| e.session_id == session_id).collect())
    }

    pub async fn read_task_log(&self) -> Result<Vec<TaskLogEntry>, JournalError> {
        Self::read_lines(&self.tasks_path()).await
    }
}

#[async_trait]
impl EventSink for JsonlJournal {
    async fn record_event(&self, event: &RunEvent) -> Result<(), JournalError> {
        self.append(&self.events_path(), event).await
    }
}

#[async_trait]
impl TaskLogSink for JsonlJournal {
    async fn record_task(&self, entry: &TaskLogEntry) -> Result<(), JournalError> {
        self.append(&self.tasks_path(), entry).await
    }
}
