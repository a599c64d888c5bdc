//! libSQL backend for [`RunStore`].
//!
//! Records are stored as JSON alongside a few indexed columns (status,
//! recipient, awaiting_since) used for listing. Supports local file and
//! in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::state::{RunRecord, RunState};
use crate::store::migrations;
use crate::store::traits::RunStore;

/// libSQL run store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlRunStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlRunStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Run store opened");
        Ok(store)
    }

    /// In-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<RunRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| DatabaseError::Query(e.to_string()))? {
            let json: String = row.get(0).map_err(|e| DatabaseError::Query(e.to_string()))?;
            records.push(decode_record(&json)?);
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn decode_record(json: &str) -> Result<RunRecord, DatabaseError> {
    serde_json::from_str(json).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Fixed-width UTC timestamp, so string order is time order.
fn sortable_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn status_of(state: &RunState) -> &'static str {
    match state {
        RunState::AwaitingApproval => "awaiting_approval",
        RunState::Sent => "sent",
        RunState::Failed { .. } => "failed",
        _ => "running",
    }
}

#[async_trait]
impl RunStore for LibSqlRunStore {
    async fn save_run(&self, record: &RunRecord) -> Result<(), DatabaseError> {
        let json =
            serde_json::to_string(record).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let awaiting_since = record.awaiting_since.map(sortable_timestamp);

        self.conn
            .execute(
                "INSERT INTO runs (session_id, status, record, created_at, updated_at, awaiting_since, recipient)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(session_id) DO UPDATE SET
                    status = excluded.status,
                    record = excluded.record,
                    updated_at = excluded.updated_at,
                    awaiting_since = excluded.awaiting_since",
                params![
                    record.session_id.clone(),
                    status_of(&record.state),
                    json,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    awaiting_since,
                    record.task.recipient.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        debug!(session_id = %record.session_id, state = %record.state, "Saved run");
        Ok(())
    }

    async fn get_run(&self, session_id: &str) -> Result<Option<RunRecord>, DatabaseError> {
        let mut records = self
            .query_records("SELECT record FROM runs WHERE session_id = ?1", params![session_id])
            .await?;
        Ok(records.pop())
    }

    async fn delete_run(&self, session_id: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn
            .execute("DELETE FROM runs WHERE session_id = ?1", params![session_id])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(affected > 0)
    }

    async fn list_awaiting(&self) -> Result<Vec<RunRecord>, DatabaseError> {
        self.query_records(
            "SELECT record FROM runs WHERE status = 'awaiting_approval' ORDER BY awaiting_since ASC",
            (),
        )
        .await
    }

    async fn claim_awaiting(&self, session_id: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn
            .execute(
                "UPDATE runs SET status = 'running'
                 WHERE session_id = ?1 AND status = 'awaiting_approval'",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        debug!(session_id, claimed = affected == 1, "Claim awaiting run");
        Ok(affected == 1)
    }

    async fn list_awaiting_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRecord>, DatabaseError> {
        self.query_records(
            "SELECT record FROM runs
             WHERE status = 'awaiting_approval' AND awaiting_since < ?1
             ORDER BY awaiting_since ASC",
            params![sortable_timestamp(cutoff)],
        )
        .await
    }
}
