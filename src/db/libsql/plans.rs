//! Plan and detection-log stores.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::db::libsql::{
    LibSqlBackend, fmt_opt_ts, fmt_ts, get_opt_text, get_opt_ts, get_text, get_ts, get_uuid,
    opt_text,
};
use crate::db::{DetectionLogStore, PlanStore};
use crate::error::DatabaseError;
use crate::plan::{DetectionLogEntry, DetectionSignal, PlanStatus, PlanStrategy, RegistrationPlan};

/// Explicit column list (matches positional access in `row_to_plan`).
pub(crate) const PLAN_COLUMNS: &str = "\
    id, user_id, session_ref, manual_open_at, detection_url, \
    strategy, status, created_at, updated_at";

pub(crate) const DETECTION_COLUMNS: &str = "id, plan_id, observed_at, signal, evidence";

fn row_to_plan(row: &libsql::Row) -> Result<RegistrationPlan, DatabaseError> {
    let strategy_text = get_text(row, 5);
    let strategy = PlanStrategy::parse(&strategy_text).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown plan strategy: {:?}", strategy_text))
    })?;
    let status_text = get_text(row, 6);
    let status = PlanStatus::parse(&status_text).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown plan status: {:?}", status_text))
    })?;

    Ok(RegistrationPlan {
        id: get_uuid(row, 0)?,
        user_id: get_text(row, 1),
        session_ref: get_text(row, 2),
        manual_open_at: get_opt_ts(row, 3),
        detection_url: get_opt_text(row, 4),
        strategy,
        status,
        created_at: get_ts(row, 7),
        updated_at: get_ts(row, 8),
    })
}

fn row_to_detection(row: &libsql::Row) -> Result<DetectionLogEntry, DatabaseError> {
    let signal_text = get_text(row, 3);
    let signal = DetectionSignal::parse(&signal_text).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown detection signal: {:?}", signal_text))
    })?;

    Ok(DetectionLogEntry {
        id: get_uuid(row, 0)?,
        plan_id: get_uuid(row, 1)?,
        observed_at: get_ts(row, 2),
        signal,
        evidence: get_text(row, 4),
    })
}

#[async_trait]
impl PlanStore for LibSqlBackend {
    async fn create_plan(&self, plan: &RegistrationPlan) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO registration_plans (
                id, user_id, session_ref, manual_open_at, detection_url,
                strategy, status, created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
            "#,
            libsql::params![
                plan.id.to_string(),
                plan.user_id.as_str(),
                plan.session_ref.as_str(),
                fmt_opt_ts(&plan.manual_open_at),
                opt_text(plan.detection_url.as_deref()),
                plan.strategy.as_str(),
                plan.status.as_str(),
                fmt_ts(&plan.created_at),
                fmt_ts(&plan.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> Result<Option<RegistrationPlan>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM registration_plans WHERE id = ?1",
                    PLAN_COLUMNS
                ),
                libsql::params![id.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_plan(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn list_pollable_plans(&self) -> Result<Vec<RegistrationPlan>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM registration_plans \
                     WHERE status = 'active' \
                       AND strategy IN ('published', 'auto') \
                       AND detection_url IS NOT NULL \
                     ORDER BY created_at",
                    PLAN_COLUMNS
                ),
                (),
            )
            .await?;

        let mut plans = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => plans.push(row_to_plan(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(e.to_string())),
            }
        }
        Ok(plans)
    }

    async fn update_plan_status(&self, id: Uuid, status: PlanStatus) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE registration_plans SET status = ?2, updated_at = ?3 WHERE id = ?1",
            libsql::params![id.to_string(), status.as_str(), fmt_ts(&Utc::now())],
        )
        .await?;
        Ok(())
    }

    async fn count_plans(&self, status: PlanStatus) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM registration_plans WHERE status = ?1",
                libsql::params![status.as_str()],
            )
            .await?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }
}

#[async_trait]
impl DetectionLogStore for LibSqlBackend {
    async fn append_detection(&self, entry: &DetectionLogEntry) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO detection_log (id, plan_id, observed_at, signal, evidence)
            VALUES (?1,?2,?3,?4,?5)
            "#,
            libsql::params![
                entry.id.to_string(),
                entry.plan_id.to_string(),
                fmt_ts(&entry.observed_at),
                entry.signal.as_str(),
                entry.evidence.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn latest_detection(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<DetectionLogEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM detection_log \
                     WHERE plan_id = ?1 \
                     ORDER BY observed_at DESC, rowid DESC LIMIT 1",
                    DETECTION_COLUMNS
                ),
                libsql::params![plan_id.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_detection(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn list_detections(
        &self,
        plan_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DetectionLogEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM detection_log \
                     WHERE plan_id = ?1 \
                     ORDER BY observed_at DESC, rowid DESC LIMIT ?2",
                    DETECTION_COLUMNS
                ),
                libsql::params![plan_id.to_string(), limit],
            )
            .await?;

        let mut entries = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => entries.push(row_to_detection(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(e.to_string())),
            }
        }
        Ok(entries)
    }
}
