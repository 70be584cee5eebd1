//! Reservation store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::ReservationStore;
use crate::db::libsql::{
    LibSqlBackend, fmt_opt_ts, fmt_ts, get_opt_json, get_opt_ts, get_opt_uuid, get_text, get_ts,
    get_uuid,
};
use crate::error::DatabaseError;
use crate::settlement::{Reservation, ReservationStatus};

/// Explicit column list (matches positional access in `row_to_reservation`).
pub(crate) const RESERVATION_COLUMNS: &str = "\
    id, user_id, plan_id, status, charge_ref, provider_response, settled_at, created_at";

fn row_to_reservation(row: &libsql::Row) -> Result<Reservation, DatabaseError> {
    let status_text = get_text(row, 3);
    let status = ReservationStatus::parse(&status_text).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown reservation status: {:?}", status_text))
    })?;

    Ok(Reservation {
        id: get_uuid(row, 0)?,
        user_id: get_text(row, 1),
        plan_id: get_opt_uuid(row, 2)?,
        status,
        charge_ref: get_text(row, 4),
        provider_response: get_opt_json(row, 5),
        settled_at: get_opt_ts(row, 6),
        created_at: get_ts(row, 7),
    })
}

#[async_trait]
impl ReservationStore for LibSqlBackend {
    async fn create_reservation(&self, reservation: &Reservation) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO reservations (
                id, user_id, plan_id, status, charge_ref,
                provider_response, settled_at, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
            "#,
            libsql::params![
                reservation.id.to_string(),
                reservation.user_id.as_str(),
                match reservation.plan_id {
                    Some(id) => libsql::Value::Text(id.to_string()),
                    None => libsql::Value::Null,
                },
                reservation.status.as_str(),
                reservation.charge_ref.as_str(),
                match &reservation.provider_response {
                    Some(value) => libsql::Value::Text(value.to_string()),
                    None => libsql::Value::Null,
                },
                fmt_opt_ts(&reservation.settled_at),
                fmt_ts(&reservation.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_reservation(&self, id: Uuid) -> Result<Option<Reservation>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM reservations WHERE id = ?1",
                    RESERVATION_COLUMNS
                ),
                libsql::params![id.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_reservation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn try_settle_reservation(
        &self,
        id: Uuid,
        status: ReservationStatus,
        provider_response: &serde_json::Value,
        settled_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        // Whoever observes 'pending' wins; everyone else changes nothing.
        let changed = conn
            .execute(
                "UPDATE reservations \
                 SET status = ?2, provider_response = ?3, settled_at = ?4 \
                 WHERE id = ?1 AND status = 'pending'",
                libsql::params![
                    id.to_string(),
                    status.as_str(),
                    provider_response.to_string(),
                    fmt_ts(&settled_at),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn count_pending_reservations(&self) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM reservations WHERE status = 'pending'",
                (),
            )
            .await?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn backend() -> LibSqlBackend {
        let backend = LibSqlBackend::new_memory().await.expect("memory db");
        backend.run_migrations().await.expect("migrations");
        backend
    }

    #[tokio::test]
    async fn settle_transition_is_one_way() {
        let db = backend().await;
        let reservation = Reservation::new("u1", "ch_1");
        db.create_reservation(&reservation).await.expect("create");

        let won = db
            .try_settle_reservation(
                reservation.id,
                ReservationStatus::Confirmed,
                &json!({"ok": true}),
                Utc::now(),
            )
            .await
            .expect("settle");
        assert!(won);

        // An opposite-outcome late callback changes nothing.
        let lost = db
            .try_settle_reservation(
                reservation.id,
                ReservationStatus::Failed,
                &json!({"ok": false}),
                Utc::now(),
            )
            .await
            .expect("settle");
        assert!(!lost);

        let stored = db
            .get_reservation(reservation.id)
            .await
            .expect("query")
            .expect("found");
        assert_eq!(stored.status, ReservationStatus::Confirmed);
        assert_eq!(stored.provider_response, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn pending_count_tracks_settlements() {
        let db = backend().await;
        let a = Reservation::new("u1", "ch_1");
        let b = Reservation::new("u2", "ch_2");
        db.create_reservation(&a).await.expect("create");
        db.create_reservation(&b).await.expect("create");

        assert_eq!(db.count_pending_reservations().await.expect("count"), 2);

        db.try_settle_reservation(a.id, ReservationStatus::Failed, &json!({}), Utc::now())
            .await
            .expect("settle");
        assert_eq!(db.count_pending_reservations().await.expect("count"), 1);
    }
}
