//! Durable checkpoints of in-progress automation state.
//!
//! The executor owns the payload shape; this layer only persists, orders, and
//! prunes. Browser/workflow/provider blobs are opaque JSON so the executor's
//! internal representation can evolve without store migrations.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::error::DatabaseError;

/// One named snapshot of execution state for an automation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub session_id: Uuid,
    pub step_name: String,
    pub browser_state: serde_json::Value,
    pub workflow_state: serde_json::Value,
    pub provider_context: serde_json::Value,
    pub success: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// The opaque payload handed over by the executor on save.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    pub browser_state: serde_json::Value,
    pub workflow_state: serde_json::Value,
    pub provider_context: serde_json::Value,
    pub success: bool,
    pub metadata: Option<serde_json::Value>,
}

/// Bounded-retention checkpoint service over the store.
pub struct CheckpointService {
    db: Arc<dyn Database>,
    keep: usize,
    max_recovery_age: Duration,
}

impl CheckpointService {
    pub fn new(db: Arc<dyn Database>, keep: usize, max_recovery_age: Duration) -> Self {
        Self {
            db,
            keep,
            max_recovery_age,
        }
    }

    /// Append a checkpoint; the store prunes the session to the most recent
    /// `keep` entries in the same call.
    pub async fn save(
        &self,
        session_id: Uuid,
        step_name: &str,
        state: CheckpointState,
    ) -> Result<Checkpoint, DatabaseError> {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            session_id,
            step_name: step_name.to_string(),
            browser_state: state.browser_state,
            workflow_state: state.workflow_state,
            provider_context: state.provider_context,
            success: state.success,
            metadata: state.metadata,
            created_at: Utc::now(),
        };
        self.db.append_checkpoint(&checkpoint, self.keep).await?;
        tracing::debug!(
            session_id = %session_id,
            step = step_name,
            "checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Return the most recent checkpoint (or a specific one by id), or `None`
    /// when no recoverable state exists — nothing saved, or everything older
    /// than the max recovery age.
    pub async fn restore(
        &self,
        session_id: Uuid,
        checkpoint_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Checkpoint>, DatabaseError> {
        let found = match checkpoint_id {
            Some(id) => self.db.get_checkpoint(id).await?.filter(|c| c.session_id == session_id),
            None => self.db.latest_checkpoint(session_id).await?,
        };

        match found {
            Some(checkpoint) if now - checkpoint.created_at <= self.max_recovery_age => {
                Ok(Some(checkpoint))
            }
            Some(checkpoint) => {
                tracing::info!(
                    session_id = %session_id,
                    age_secs = (now - checkpoint.created_at).num_seconds(),
                    "checkpoint too old to recover"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
