//! Challenge-ticket store.
//!
//! State transitions and the notification throttle are conditional writes:
//! the WHERE clause re-checks the guard column in the same statement that
//! updates it, so racing callers resolve to exactly one winner.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::challenge::{ChallengeTicket, TicketStatus};
use crate::db::TicketStore;
use crate::db::libsql::{
    LibSqlBackend, fmt_opt_ts, fmt_ts, get_opt_text, get_opt_ts, get_text, get_ts, get_uuid,
    opt_text,
};
use crate::error::DatabaseError;

/// Explicit column list (matches positional access in `row_to_ticket`).
pub(crate) const TICKET_COLUMNS: &str = "\
    id, user_id, session_id, provider, token_digest, magic_url, \
    status, created_at, expires_at, last_notified_at, notified_via, resolution_note";

fn row_to_ticket(row: &libsql::Row) -> Result<ChallengeTicket, DatabaseError> {
    let status_text = get_text(row, 6);
    let status = TicketStatus::parse(&status_text).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown ticket status: {:?}", status_text))
    })?;

    Ok(ChallengeTicket {
        id: get_uuid(row, 0)?,
        user_id: get_text(row, 1),
        session_id: get_uuid(row, 2)?,
        provider: get_text(row, 3),
        token_digest: get_text(row, 4),
        magic_url: get_text(row, 5),
        status,
        created_at: get_ts(row, 7),
        expires_at: get_ts(row, 8),
        last_notified_at: get_opt_ts(row, 9),
        notified_via: get_opt_text(row, 10),
        resolution_note: get_opt_text(row, 11),
    })
}

#[async_trait]
impl TicketStore for LibSqlBackend {
    async fn create_ticket(&self, ticket: &ChallengeTicket) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO challenge_tickets (
                id, user_id, session_id, provider, token_digest, magic_url,
                status, created_at, expires_at, last_notified_at, notified_via, resolution_note
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
            "#,
            libsql::params![
                ticket.id.to_string(),
                ticket.user_id.as_str(),
                ticket.session_id.to_string(),
                ticket.provider.as_str(),
                ticket.token_digest.as_str(),
                ticket.magic_url.as_str(),
                ticket.status.as_str(),
                fmt_ts(&ticket.created_at),
                fmt_ts(&ticket.expires_at),
                fmt_opt_ts(&ticket.last_notified_at),
                opt_text(ticket.notified_via.as_deref()),
                opt_text(ticket.resolution_note.as_deref()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<ChallengeTicket>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM challenge_tickets WHERE id = ?1",
                    TICKET_COLUMNS
                ),
                libsql::params![id.to_string()],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_ticket(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn find_ticket_by_digest(
        &self,
        token_digest: &str,
    ) -> Result<Option<ChallengeTicket>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM challenge_tickets WHERE token_digest = ?1",
                    TICKET_COLUMNS
                ),
                libsql::params![token_digest],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_ticket(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn latest_pending_ticket(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ChallengeTicket>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM challenge_tickets \
                     WHERE user_id = ?1 AND status = 'pending' AND expires_at > ?2 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    TICKET_COLUMNS
                ),
                libsql::params![user_id, fmt_ts(&now)],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_ticket(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn transition_ticket(
        &self,
        id: Uuid,
        to: TicketStatus,
        note: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE challenge_tickets \
                 SET status = ?2, resolution_note = COALESCE(?3, resolution_note) \
                 WHERE id = ?1 AND status = 'pending'",
                libsql::params![id.to_string(), to.as_str(), opt_text(note)],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn expire_overdue_tickets(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE challenge_tickets \
                 SET status = 'expired', resolution_note = 'expired by sweep' \
                 WHERE status = 'pending' AND expires_at < ?1",
                libsql::params![fmt_ts(&now)],
            )
            .await?;
        Ok(changed)
    }

    async fn claim_notification_slot(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        min_gap_secs: i64,
    ) -> Result<bool, DatabaseError> {
        let cutoff = now - Duration::seconds(min_gap_secs);
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE challenge_tickets \
                 SET last_notified_at = ?2 \
                 WHERE id = ?1 AND status = 'pending' \
                   AND (last_notified_at IS NULL OR last_notified_at <= ?3)",
                libsql::params![id.to_string(), fmt_ts(&now), fmt_ts(&cutoff)],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn record_notified_via(&self, id: Uuid, channel: &str) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE challenge_tickets SET notified_via = ?2 WHERE id = ?1",
            libsql::params![id.to_string(), channel],
        )
        .await?;
        Ok(())
    }

    async fn count_pending_tickets(&self) -> Result<i64, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM challenge_tickets WHERE status = 'pending'",
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
