//! Seam to the external attempt executor.
//!
//! The coordinator decides *when* to attempt and *how* to survive
//! interruption; the executor drives the provider's signup flow and is
//! treated as an opaque worker. It is expected to call back into the
//! checkpoint store as it progresses, open a challenge ticket when a
//! bot-challenge interrupts it, and report its terminal outcome to the
//! settlement callback endpoint.

use async_trait::async_trait;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Launch for plan {plan_id} failed: {reason}")]
    LaunchFailed { plan_id: Uuid, reason: String },

    #[error("Resume for session {session_id} failed: {reason}")]
    ResumeFailed { session_id: Uuid, reason: String },
}

#[async_trait]
pub trait AttemptExecutor: Send + Sync {
    /// Start one registration attempt. Invoked at most once per plan.
    async fn launch(&self, plan_id: Uuid, session_id: Uuid) -> Result<(), ExecutorError>;

    /// Continue an interrupted attempt from the given checkpoint, or from
    /// scratch when no recoverable state exists.
    async fn resume(
        &self,
        session_id: Uuid,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(), ExecutorError>;
}

/// Default executor for deployments where the browser worker runs
/// out-of-process and watches for dispatches itself: logs the hand-off and
/// succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl AttemptExecutor for LoggingExecutor {
    async fn launch(&self, plan_id: Uuid, session_id: Uuid) -> Result<(), ExecutorError> {
        tracing::info!(plan_id = %plan_id, session_id = %session_id, "attempt dispatched");
        Ok(())
    }

    async fn resume(
        &self,
        session_id: Uuid,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(), ExecutorError> {
        match checkpoint {
            Some(c) => tracing::info!(
                session_id = %session_id,
                step = %c.step_name,
                "resume dispatched from checkpoint"
            ),
            None => tracing::info!(
                session_id = %session_id,
                "resume dispatched with no recoverable state"
            ),
        }
        Ok(())
    }
}
