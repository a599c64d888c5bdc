//! Storage trait for run records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::state::RunRecord;

/// Persistence for runs, keyed by session id.
///
/// A suspended run lives here between `submit` and `resume`; nothing else
/// holds it, so another process can pick it up.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ── Records ─────────────────────────────────────────────────────

    /// Insert or replace the record for `record.session_id`.
    async fn save_run(&self, record: &RunRecord) -> Result<(), DatabaseError>;

    async fn get_run(&self, session_id: &str) -> Result<Option<RunRecord>, DatabaseError>;

    /// Returns whether a record was removed.
    async fn delete_run(&self, session_id: &str) -> Result<bool, DatabaseError>;

    // ── Human gate ──────────────────────────────────────────────────

    /// Runs suspended at the human gate, oldest first.
    async fn list_awaiting(&self) -> Result<Vec<RunRecord>, DatabaseError>;

    /// Atomically take a suspended run off the gate. Returns `false` when
    /// the run is missing or no longer awaiting approval, so at most one
    /// caller wins per suspension.
    async fn claim_awaiting(&self, session_id: &str) -> Result<bool, DatabaseError>;

    /// Runs that have been waiting since before `cutoff`.
    async fn list_awaiting_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRecord>, DatabaseError>;
}
