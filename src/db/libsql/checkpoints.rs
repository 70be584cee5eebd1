//! Checkpoint store.
//!
//! Payload blobs pass through as JSON text; the store orders, bounds, and
//! never interprets them.

use async_trait::async_trait;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::db::CheckpointStore;
use crate::db::libsql::{
    LibSqlBackend, fmt_ts, get_i64, get_json, get_opt_json, get_text, get_ts, get_uuid,
};
use crate::error::DatabaseError;

/// Explicit column list (matches positional access in `row_to_checkpoint`).
pub(crate) const CHECKPOINT_COLUMNS: &str = "\
    id, session_id, step_name, browser_state, workflow_state, \
    provider_context, success, metadata, created_at";

fn row_to_checkpoint(row: &libsql::Row) -> Result<Checkpoint, DatabaseError> {
    Ok(Checkpoint {
        id: get_uuid(row, 0)?,
        session_id: get_uuid(row, 1)?,
        step_name: get_text(row, 2),
        browser_state: get_json(row, 3),
        workflow_state: get_json(row, 4),
        provider_context: get_json(row, 5),
        success: get_i64(row, 6) != 0,
        metadata: get_opt_json(row, 7),
        created_at: get_ts(row, 8),
    })
}

fn to_json_text(value: &serde_json::Value) -> String {
    value.to_string()
}

#[async_trait]
impl CheckpointStore for LibSqlBackend {
    async fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        keep: usize,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO checkpoints (
                id, session_id, step_name, browser_state, workflow_state,
                provider_context, success, metadata, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
            "#,
            libsql::params![
                checkpoint.id.to_string(),
                checkpoint.session_id.to_string(),
                checkpoint.step_name.as_str(),
                to_json_text(&checkpoint.browser_state),
                to_json_text(&checkpoint.workflow_state),
                to_json_text(&checkpoint.provider_context),
                checkpoint.success as i64,
                match &checkpoint.metadata {
                    Some(value) => libsql::Value::Text(to_json_text(value)),
                    None => libsql::Value::Null,
                },
                fmt_ts(&checkpoint.created_at),
            ],
        )
        .await?;

        // Oldest-first eviction down to the retention bound, in the same call
        // as the write so the bound holds after every save.
        conn.execute(
            "DELETE FROM checkpoints \
             WHERE session_id = ?1 AND id NOT IN ( \
                 SELECT id FROM checkpoints \
                 WHERE session_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 \
             )",
            libsql::params![checkpoint.session_id.to_string(), keep as i64],
        )
        .await?;

        Ok(())
    }

    async fn latest_checkpoint(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Checkpoint>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM checkpoints \
                     WHERE session_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    CHECKPOINT_COLUMNS
                ),
                libsql::params![session_id.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn get_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM checkpoints WHERE id = ?1", CHECKPOINT_COLUMNS),
                libsql::params![id.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn count_checkpoints(&self, session_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM checkpoints WHERE session_id = ?1",
                libsql::params![session_id.to_string()],
            )
            .await?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }
}
