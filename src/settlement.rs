//! Settlement: finalize the money side effect exactly once.
//!
//! Two separately idempotent operations composed: the one-way reservation
//! status transition (guarded by a conditional write on the current state)
//! and the processor capture/cancel call (guarded by an idempotency key and
//! retried on transient failures). A processor outage never undoes the
//! recorded outcome and never re-triggers the registration attempt.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{Result, SettlementError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Failed,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Transitions are one-way: `pending` → `confirmed` or `pending` → `failed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A paid reservation tied to one pre-authorized charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: String,
    pub plan_id: Option<Uuid>,
    pub status: ReservationStatus,
    /// Reference to the pre-authorized charge at the payment processor.
    pub charge_ref: String,
    /// Provider's raw outcome payload, kept verbatim for audit.
    pub provider_response: Option<serde_json::Value>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(user_id: impl Into<String>, charge_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            plan_id: None,
            status: ReservationStatus::Pending,
            charge_ref: charge_ref.into(),
            provider_response: None,
            settled_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Payment processor seam. Implementations must honor the idempotency key:
/// the key is derived from the reservation id, so even a transition race that
/// briefly double-fires is deduplicated processor-side.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn capture(&self, charge_ref: &str, idempotency_key: &str)
        -> std::result::Result<(), SettlementError>;

    async fn cancel(&self, charge_ref: &str, idempotency_key: &str)
        -> std::result::Result<(), SettlementError>;
}

/// HTTP payment processor client.
pub struct HttpPaymentProcessor {
    client: reqwest::Client,
    base_url: Url,
    secret: SecretString,
}

impl HttpPaymentProcessor {
    pub fn new(client: reqwest::Client, base_url: Url, secret: SecretString) -> Self {
        Self {
            client,
            base_url,
            secret,
        }
    }

    async fn post_action(
        &self,
        action: &str,
        charge_ref: &str,
        idempotency_key: &str,
    ) -> std::result::Result<(), SettlementError> {
        let url = format!(
            "{}/charges/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            charge_ref,
            action,
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.secret.expose_secret())
            .header("idempotency-key", idempotency_key)
            .send()
            .await
            .map_err(|e| SettlementError::ProcessorFailed {
                action: action.to_string(),
                charge_ref: charge_ref.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SettlementError::ProcessorRejected {
                action: action.to_string(),
                charge_ref: charge_ref.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProcessor for HttpPaymentProcessor {
    async fn capture(
        &self,
        charge_ref: &str,
        idempotency_key: &str,
    ) -> std::result::Result<(), SettlementError> {
        self.post_action("capture", charge_ref, idempotency_key).await
    }

    async fn cancel(
        &self,
        charge_ref: &str,
        idempotency_key: &str,
    ) -> std::result::Result<(), SettlementError> {
        self.post_action("cancel", charge_ref, idempotency_key).await
    }
}

/// Response view returned to the callback caller.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementView {
    pub reservation_id: Uuid,
    pub status: ReservationStatus,
    /// `true` when this callback was a duplicate of an earlier settlement.
    pub already_settled: bool,
}

pub struct SettlementCommitter {
    db: Arc<dyn Database>,
    processor: Arc<dyn PaymentProcessor>,
    max_processor_attempts: u32,
}

impl SettlementCommitter {
    pub fn new(
        db: Arc<dyn Database>,
        processor: Arc<dyn PaymentProcessor>,
        max_processor_attempts: u32,
    ) -> Self {
        Self {
            db,
            processor,
            max_processor_attempts: max_processor_attempts.max(1),
        }
    }

    /// Commit one attempt outcome. Safe under at-least-once delivery and
    /// concurrent duplicates: whichever caller observes `pending` wins the
    /// transition; everyone else gets the recorded terminal state back.
    pub async fn commit(
        &self,
        reservation_id: Uuid,
        success: bool,
        provider_response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<SettlementView> {
        let Some(reservation) = self.db.get_reservation(reservation_id).await? else {
            return Err(SettlementError::UnknownReservation { id: reservation_id }.into());
        };

        if reservation.status.is_terminal() {
            tracing::info!(
                reservation_id = %reservation_id,
                status = reservation.status.as_str(),
                "duplicate settlement callback, no-op"
            );
            return Ok(SettlementView {
                reservation_id,
                status: reservation.status,
                already_settled: true,
            });
        }

        let target = if success {
            ReservationStatus::Confirmed
        } else {
            ReservationStatus::Failed
        };

        let won = self
            .db
            .try_settle_reservation(reservation_id, target, &provider_response, now)
            .await?;
        if !won {
            // Lost a race with a concurrent duplicate; read the winner's state.
            let current = self
                .db
                .get_reservation(reservation_id)
                .await?
                .map(|r| r.status)
                .unwrap_or(target);
            tracing::info!(
                reservation_id = %reservation_id,
                status = current.as_str(),
                "settlement race lost, returning recorded state"
            );
            return Ok(SettlementView {
                reservation_id,
                status: current,
                already_settled: true,
            });
        }

        tracing::info!(
            reservation_id = %reservation_id,
            status = target.as_str(),
            "reservation settled"
        );

        // Processor call is independent of the recorded outcome; exhausted
        // retries leave the status as-is for out-of-band reconciliation.
        let idempotency_key = format!("settle-{}", reservation_id);
        if let Err(e) = self
            .drive_processor(success, &reservation.charge_ref, &idempotency_key)
            .await
        {
            tracing::error!(
                reservation_id = %reservation_id,
                charge_ref = %reservation.charge_ref,
                error = %e,
                "processor call failed after retries"
            );
        }

        Ok(SettlementView {
            reservation_id,
            status: target,
            already_settled: false,
        })
    }

    async fn drive_processor(
        &self,
        capture: bool,
        charge_ref: &str,
        idempotency_key: &str,
    ) -> std::result::Result<(), SettlementError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = if capture {
                self.processor.capture(charge_ref, idempotency_key).await
            } else {
                self.processor.cancel(charge_ref, idempotency_key).await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.max_processor_attempts => {
                    tracing::warn!(
                        charge_ref,
                        attempt,
                        error = %e,
                        "transient processor failure, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
