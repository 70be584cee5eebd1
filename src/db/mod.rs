//! Database abstraction for campclerk.
//!
//! One trait per domain, composed into a `Database` supertrait so services
//! hold a single `Arc<dyn Database>`. The libSQL backend is the shipped
//! implementation; the seam keeps a second backend possible without touching
//! callers.

pub mod libsql;
pub mod migrations;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::challenge::{ChallengeTicket, TicketStatus};
use crate::checkpoint::Checkpoint;
use crate::error::DatabaseError;
use crate::notify::{ConsentEntry, Subscriber};
use crate::plan::{DetectionLogEntry, PlanStatus, RegistrationPlan};
use crate::settlement::{Reservation, ReservationStatus};

pub use self::libsql::LibSqlBackend;

/// Registration-plan persistence. Plans are never deleted.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn create_plan(&self, plan: &RegistrationPlan) -> Result<(), DatabaseError>;

    async fn get_plan(&self, id: Uuid) -> Result<Option<RegistrationPlan>, DatabaseError>;

    /// Active plans with a detection URL and a pollable strategy.
    async fn list_pollable_plans(&self) -> Result<Vec<RegistrationPlan>, DatabaseError>;

    async fn update_plan_status(&self, id: Uuid, status: PlanStatus) -> Result<(), DatabaseError>;

    async fn count_plans(&self, status: PlanStatus) -> Result<i64, DatabaseError>;
}

/// Append-only detection log. The latest entry per plan is the staleness guard.
#[async_trait]
pub trait DetectionLogStore: Send + Sync {
    async fn append_detection(&self, entry: &DetectionLogEntry) -> Result<(), DatabaseError>;

    async fn latest_detection(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<DetectionLogEntry>, DatabaseError>;

    async fn list_detections(
        &self,
        plan_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DetectionLogEntry>, DatabaseError>;
}

/// Challenge-ticket persistence and state transitions.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn create_ticket(&self, ticket: &ChallengeTicket) -> Result<(), DatabaseError>;

    async fn get_ticket(&self, id: Uuid) -> Result<Option<ChallengeTicket>, DatabaseError>;

    async fn find_ticket_by_digest(
        &self,
        token_digest: &str,
    ) -> Result<Option<ChallengeTicket>, DatabaseError>;

    /// Newest `pending`, unexpired ticket for a user.
    async fn latest_pending_ticket(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ChallengeTicket>, DatabaseError>;

    /// Conditional `pending` → terminal transition. Returns `false` when the
    /// ticket was no longer `pending` (the caller lost the race).
    async fn transition_ticket(
        &self,
        id: Uuid,
        to: TicketStatus,
        note: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Flip all `pending` tickets past their expiry to `expired`.
    /// Returns the number of tickets flipped.
    async fn expire_overdue_tickets(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Compare-and-set on `last_notified_at`: claims a notification slot iff
    /// the last send is at least `min_gap_secs` old (or never happened).
    /// The guard update and the send record are the same write.
    async fn claim_notification_slot(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        min_gap_secs: i64,
    ) -> Result<bool, DatabaseError>;

    async fn record_notified_via(&self, id: Uuid, channel: &str) -> Result<(), DatabaseError>;

    async fn count_pending_tickets(&self) -> Result<i64, DatabaseError>;
}

/// Checkpoint persistence. Payload blobs are opaque to the store.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint, then prune the session to the `keep` most recent
    /// entries (oldest-first eviction).
    async fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        keep: usize,
    ) -> Result<(), DatabaseError>;

    async fn latest_checkpoint(
        &self,
        session_id: Uuid,
    ) -> Result<Option<Checkpoint>, DatabaseError>;

    async fn get_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>, DatabaseError>;

    async fn count_checkpoints(&self, session_id: Uuid) -> Result<i64, DatabaseError>;
}

/// Reservation persistence with one-way settlement transitions.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn create_reservation(&self, reservation: &Reservation) -> Result<(), DatabaseError>;

    async fn get_reservation(&self, id: Uuid) -> Result<Option<Reservation>, DatabaseError>;

    /// Conditional `pending` → terminal transition recording the provider's
    /// raw payload. Returns `false` when the reservation was already terminal.
    async fn try_settle_reservation(
        &self,
        id: Uuid,
        status: ReservationStatus,
        provider_response: &serde_json::Value,
        settled_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn count_pending_reservations(&self) -> Result<i64, DatabaseError>;
}

/// Per-phone consent ledger, updated synchronously on STOP/START.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn set_consent(
        &self,
        phone: &str,
        opted_in: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn get_consent(&self, phone: &str) -> Result<Option<ConsentEntry>, DatabaseError>;
}

/// Minimal projection of the account system: delivery endpoints per user.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<(), DatabaseError>;

    async fn get_subscriber(&self, user_id: &str) -> Result<Option<Subscriber>, DatabaseError>;

    /// Look up the owner of a verified phone number.
    async fn find_subscriber_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<Subscriber>, DatabaseError>;
}

/// Unified database trait combining all stores.
#[async_trait]
pub trait Database:
    PlanStore
    + DetectionLogStore
    + TicketStore
    + CheckpointStore
    + ReservationStore
    + ConsentStore
    + SubscriberStore
    + Send
    + Sync
{
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
