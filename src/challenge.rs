//! Challenge tickets: the human-in-the-loop interruption path.
//!
//! When the executor hits a bot-challenge it opens a ticket here. The broker
//! mints a single-use resume token, delivers a magic URL over the user's
//! preferred channel with email fallback, and resumes the executor from the
//! latest checkpoint once a human resolves the challenge. The ticket's fixed
//! expiry is the system's timeout primitive for the human step.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::checkpoint::CheckpointService;
use crate::config::ChallengeConfig;
use crate::db::Database;
use crate::error::{ChallengeError, NotifyError, Result};
use crate::executor::AttemptExecutor;
use crate::notify::{DeliveryChannel, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Once a ticket leaves `pending` it is immutable.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One bot-challenge interruption requiring human resolution.
///
/// Only the SHA-256 digest of the resume token is stored; the token itself
/// exists in the magic URL alone. At most one token is ever valid per ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeTicket {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: Uuid,
    pub provider: String,
    pub token_digest: String,
    pub magic_url: String,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub notified_via: Option<String>,
    pub resolution_note: Option<String>,
}

/// Outcome of a "mark resolved" call. Replays and races degrade to
/// `AlreadyTerminal`, never to a second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Completed,
    AlreadyTerminal(TicketStatus),
    Expired,
}

/// Mint a single-use resume token: 32 random bytes, hex-encoded.
pub fn mint_resume_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

/// Digest stored in place of the token.
pub fn token_digest(token: &str) -> String {
    hex_encode(&Sha256::digest(token.as_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct ChallengeBroker {
    db: Arc<dyn Database>,
    notifier: Notifier,
    checkpoints: Arc<CheckpointService>,
    executor: Arc<dyn AttemptExecutor>,
    config: ChallengeConfig,
}

impl ChallengeBroker {
    pub fn new(
        db: Arc<dyn Database>,
        notifier: Notifier,
        checkpoints: Arc<CheckpointService>,
        executor: Arc<dyn AttemptExecutor>,
        config: ChallengeConfig,
    ) -> Self {
        Self {
            db,
            notifier,
            checkpoints,
            executor,
            config,
        }
    }

    /// Create a ticket for a fresh interruption and attempt notification.
    ///
    /// Delivery failure does not fail ticket creation: the ticket is live and
    /// reachable through resend and inbound-reply paths, so the failure is
    /// logged and surfaced as `delivered: None`.
    pub async fn open_ticket(
        &self,
        user_id: &str,
        session_id: Uuid,
        provider: &str,
    ) -> Result<(ChallengeTicket, Option<DeliveryChannel>)> {
        let now = Utc::now();
        let token = mint_resume_token();
        let ticket = ChallengeTicket {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            session_id,
            provider: provider.to_string(),
            token_digest: token_digest(&token),
            magic_url: format!(
                "{}/resume/{}",
                self.config.public_base_url.trim_end_matches('/'),
                token
            ),
            status: TicketStatus::Pending,
            created_at: now,
            expires_at: now + Duration::seconds(self.config.ticket_ttl_secs),
            last_notified_at: None,
            notified_via: None,
            resolution_note: None,
        };
        self.db.create_ticket(&ticket).await?;
        tracing::info!(
            ticket_id = %ticket.id,
            user_id,
            provider,
            expires_at = %ticket.expires_at,
            "challenge ticket opened"
        );

        let delivered = match self.notify_ticket(&ticket, now).await {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::error!(ticket_id = %ticket.id, error = %e, "initial notification failed");
                None
            }
        };

        Ok((ticket, delivered))
    }

    /// Deliver (or re-deliver) the magic URL for a pending ticket.
    ///
    /// The 2-minute throttle is a compare-and-set on `last_notified_at`:
    /// concurrent callers race on that single write and exactly one wins.
    pub async fn notify_ticket(
        &self,
        ticket: &ChallengeTicket,
        now: DateTime<Utc>,
    ) -> Result<DeliveryChannel> {
        if ticket.status.is_terminal() {
            return Err(ChallengeError::AlreadyTerminal {
                id: ticket.id,
                status: ticket.status.as_str().to_string(),
            }
            .into());
        }

        let claimed = self
            .db
            .claim_notification_slot(ticket.id, now, self.config.resend_min_gap_secs)
            .await?;
        if !claimed {
            return Err(ChallengeError::Throttled { id: ticket.id }.into());
        }

        let subscriber = self
            .db
            .get_subscriber(&ticket.user_id)
            .await?
            .ok_or_else(|| NotifyError::NoChannel {
                user_id: ticket.user_id.clone(),
            })?;

        let sms_allowed = match subscriber.phone.as_deref() {
            // No ledger entry means the user never texted STOP.
            Some(phone) => self
                .db
                .get_consent(phone)
                .await?
                .map(|entry| entry.opted_in)
                .unwrap_or(true),
            None => false,
        };

        let channel = self
            .notifier
            .deliver(
                &subscriber,
                sms_allowed,
                &format!("Action needed: finish your {} registration", ticket.provider),
                &self.notification_body(ticket),
            )
            .await
            .map_err(crate::error::Error::from)?;

        self.db
            .record_notified_via(ticket.id, channel.as_str())
            .await?;
        tracing::info!(
            ticket_id = %ticket.id,
            channel = channel.as_str(),
            "challenge notification delivered"
        );
        Ok(channel)
    }

    /// Manual re-notification (operator surface).
    pub async fn resend(&self, ticket_id: Uuid, now: DateTime<Utc>) -> Result<DeliveryChannel> {
        let ticket = self
            .db
            .get_ticket(ticket_id)
            .await?
            .ok_or(ChallengeError::NotFound { id: ticket_id })?;

        if ticket.status == TicketStatus::Pending && now > ticket.expires_at {
            return Err(ChallengeError::Expired {
                id: ticket.id,
                expires_at: ticket.expires_at,
            }
            .into());
        }

        self.notify_ticket(&ticket, now).await
    }

    /// Claim a notification slot for an inbound-reply re-delivery and return
    /// the magic URL to embed in the reply body.
    pub async fn reply_link(
        &self,
        ticket: &ChallengeTicket,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let claimed = self
            .db
            .claim_notification_slot(ticket.id, now, self.config.resend_min_gap_secs)
            .await?;
        if !claimed {
            return Err(ChallengeError::Throttled { id: ticket.id }.into());
        }
        self.db.record_notified_via(ticket.id, "sms_reply").await?;
        Ok(ticket.magic_url.clone())
    }

    /// Look up a ticket by resume token without consuming it.
    pub async fn peek(&self, token: &str) -> Result<ChallengeTicket> {
        let digest = token_digest(token);
        let ticket = self
            .db
            .find_ticket_by_digest(&digest)
            .await?
            .ok_or(ChallengeError::InvalidToken)?;

        if !digest_matches(&digest, &ticket.token_digest) {
            return Err(ChallengeError::InvalidToken.into());
        }
        Ok(ticket)
    }

    /// Mark a challenge resolved and hand the session back to the executor.
    pub async fn resolve(&self, token: &str, now: DateTime<Utc>) -> Result<ResolveOutcome> {
        let ticket = self.peek(token).await?;

        if ticket.status.is_terminal() {
            return Ok(ResolveOutcome::AlreadyTerminal(ticket.status));
        }

        if now > ticket.expires_at {
            self.db
                .transition_ticket(ticket.id, TicketStatus::Expired, Some("expired before resolution"))
                .await?;
            tracing::warn!(ticket_id = %ticket.id, "resolution arrived after expiry");
            return Ok(ResolveOutcome::Expired);
        }

        let won = self
            .db
            .transition_ticket(ticket.id, TicketStatus::Completed, Some("resolved via magic link"))
            .await?;
        if !won {
            let current = self
                .db
                .get_ticket(ticket.id)
                .await?
                .map(|t| t.status)
                .unwrap_or(TicketStatus::Completed);
            return Ok(ResolveOutcome::AlreadyTerminal(current));
        }

        let checkpoint = self
            .checkpoints
            .restore(ticket.session_id, None, now)
            .await?;
        if let Err(e) = self.executor.resume(ticket.session_id, checkpoint).await {
            // Ticket stays completed; the executor reports its own terminal
            // outcome through the settlement callback.
            tracing::error!(
                ticket_id = %ticket.id,
                session_id = %ticket.session_id,
                error = %e,
                "resume dispatch failed"
            );
        }

        tracing::info!(ticket_id = %ticket.id, session_id = %ticket.session_id, "challenge resolved");
        Ok(ResolveOutcome::Completed)
    }

    /// Flip overdue `pending` tickets to `expired`. The executor treats
    /// expiry as terminal failure, not a retry signal.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let flipped = self.db.expire_overdue_tickets(now).await?;
        if flipped > 0 {
            tracing::info!(count = flipped, "expired overdue challenge tickets");
        }
        Ok(flipped)
    }

    /// Background sweep loop; runs until the task is aborted.
    pub async fn run_sweeper(self: Arc<Self>, every: std::time::Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_expired(Utc::now()).await {
                tracing::error!(error = %e, "ticket sweep failed");
            }
        }
    }

    fn notification_body(&self, ticket: &ChallengeTicket) -> String {
        format!(
            "A verification step is blocking your {} registration. Finish it here: {} \
             (link expires at {}). Reply HELP for help, STOP to opt out.",
            ticket.provider,
            ticket.magic_url,
            ticket.expires_at.format("%H:%M UTC"),
        )
    }
}

fn digest_matches(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LibSqlBackend;
    use crate::executor::LoggingExecutor;
    use crate::notify::test_support::{RecordingEmail, RecordingSms};
    use crate::notify::Subscriber;
    use pretty_assertions::assert_eq;

    struct Harness {
        db: Arc<dyn Database>,
        broker: ChallengeBroker,
        sms: Arc<RecordingSms>,
        email: Arc<RecordingEmail>,
    }

    async fn harness() -> Harness {
        harness_with(RecordingSms::default()).await
    }

    async fn harness_with(sms: RecordingSms) -> Harness {
        let backend = LibSqlBackend::new_memory().await.expect("memory db");
        backend.run_migrations().await.expect("migrations");
        let db: Arc<dyn Database> = Arc::new(backend);

        let sms = Arc::new(sms);
        let email = Arc::new(RecordingEmail::default());
        let notifier = Notifier::new(
            Some(sms.clone() as Arc<dyn crate::notify::SmsSender>),
            Some(email.clone() as Arc<dyn crate::notify::EmailSender>),
        );
        let checkpoints = Arc::new(CheckpointService::new(
            db.clone(),
            10,
            Duration::minutes(30),
        ));
        let broker = ChallengeBroker::new(
            db.clone(),
            notifier,
            checkpoints,
            Arc::new(LoggingExecutor),
            ChallengeConfig {
                public_base_url: "https://clerk.example".to_string(),
                ticket_ttl_secs: 600,
                resend_min_gap_secs: 120,
                sweep_interval_secs: 30,
            },
        );
        Harness {
            db,
            broker,
            sms,
            email,
        }
    }

    async fn seed_subscriber(db: &Arc<dyn Database>, phone_verified: bool) {
        db.upsert_subscriber(&Subscriber {
            user_id: "u1".to_string(),
            phone: Some("+15555550100".to_string()),
            phone_verified,
            email: Some("parent@example.com".to_string()),
        })
        .await
        .expect("subscriber");
    }

    #[test]
    fn minted_tokens_are_distinct_and_digested() {
        let a = mint_resume_token();
        let b = mint_resume_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(token_digest(&a), a);
    }

    #[tokio::test]
    async fn open_ticket_notifies_via_sms() {
        let h = harness().await;
        seed_subscriber(&h.db, true).await;

        let (ticket, delivered) = h
            .broker
            .open_ticket("u1", Uuid::new_v4(), "campsite")
            .await
            .expect("opens");

        assert_eq!(delivered, Some(DeliveryChannel::Sms));
        assert_eq!(h.sms.sent.lock().expect("lock").len(), 1);
        assert!(ticket.magic_url.starts_with("https://clerk.example/resume/"));

        let stored = h.db.get_ticket(ticket.id).await.expect("query").expect("found");
        assert!(stored.last_notified_at.is_some());
        assert_eq!(stored.notified_via.as_deref(), Some("sms"));
    }

    #[tokio::test]
    async fn unverified_phone_sends_exactly_one_email() {
        let h = harness().await;
        seed_subscriber(&h.db, false).await;

        let (ticket, delivered) = h
            .broker
            .open_ticket("u1", Uuid::new_v4(), "campsite")
            .await
            .expect("opens");

        assert_eq!(delivered, Some(DeliveryChannel::Email));
        assert!(h.sms.sent.lock().expect("lock").is_empty());
        assert_eq!(h.email.sent.lock().expect("lock").len(), 1);

        let stored = h.db.get_ticket(ticket.id).await.expect("query").expect("found");
        assert!(stored.last_notified_at.is_some());
    }

    #[tokio::test]
    async fn resend_inside_gap_is_throttled() {
        let h = harness().await;
        seed_subscriber(&h.db, true).await;

        let (ticket, _) = h
            .broker
            .open_ticket("u1", Uuid::new_v4(), "campsite")
            .await
            .expect("opens");

        let err = h
            .broker
            .resend(ticket.id, Utc::now())
            .await
            .expect_err("throttled");
        assert!(matches!(
            err,
            crate::error::Error::Challenge(ChallengeError::Throttled { .. })
        ));
        assert_eq!(h.sms.sent.lock().expect("lock").len(), 1);

        // Past the gap the resend goes through.
        let later = Utc::now() + Duration::seconds(121);
        let channel = h.broker.resend(ticket.id, later).await.expect("resends");
        assert_eq!(channel, DeliveryChannel::Sms);
        assert_eq!(h.sms.sent.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn resume_token_is_single_use() {
        let h = harness().await;
        seed_subscriber(&h.db, true).await;

        let (ticket, _) = h
            .broker
            .open_ticket("u1", Uuid::new_v4(), "campsite")
            .await
            .expect("opens");
        let token = ticket
            .magic_url
            .rsplit('/')
            .next()
            .expect("token segment")
            .to_string();

        let first = h.broker.resolve(&token, Utc::now()).await.expect("resolves");
        assert_eq!(first, ResolveOutcome::Completed);

        let second = h.broker.resolve(&token, Utc::now()).await.expect("replays");
        assert_eq!(
            second,
            ResolveOutcome::AlreadyTerminal(TicketStatus::Completed)
        );
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let h = harness().await;
        let err = h
            .broker
            .resolve(&mint_resume_token(), Utc::now())
            .await
            .expect_err("unknown");
        assert!(matches!(
            err,
            crate::error::Error::Challenge(ChallengeError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn late_resolution_expires_the_ticket() {
        let h = harness().await;
        seed_subscriber(&h.db, true).await;

        let (ticket, _) = h
            .broker
            .open_ticket("u1", Uuid::new_v4(), "campsite")
            .await
            .expect("opens");
        let token = ticket
            .magic_url
            .rsplit('/')
            .next()
            .expect("token segment")
            .to_string();

        let late = ticket.expires_at + Duration::seconds(1);
        let outcome = h.broker.resolve(&token, late).await.expect("handled");
        assert_eq!(outcome, ResolveOutcome::Expired);

        let stored = h.db.get_ticket(ticket.id).await.expect("query").expect("found");
        assert_eq!(stored.status, TicketStatus::Expired);
    }

    #[tokio::test]
    async fn sweep_flips_overdue_tickets() {
        let h = harness().await;
        seed_subscriber(&h.db, true).await;

        let (ticket, _) = h
            .broker
            .open_ticket("u1", Uuid::new_v4(), "campsite")
            .await
            .expect("opens");

        let flipped = h
            .broker
            .sweep_expired(ticket.expires_at + Duration::seconds(1))
            .await
            .expect("sweeps");
        assert_eq!(flipped, 1);

        let stored = h.db.get_ticket(ticket.id).await.expect("query").expect("found");
        assert_eq!(stored.status, TicketStatus::Expired);

        // Terminal tickets are immune to later sweeps and resolutions.
        let again = h
            .broker
            .sweep_expired(ticket.expires_at + Duration::seconds(2))
            .await
            .expect("sweeps");
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn notification_falls_back_when_sms_fails() {
        let h = harness_with(RecordingSms {
            fail: true,
            ..Default::default()
        })
        .await;
        seed_subscriber(&h.db, true).await;

        let (_, delivered) = h
            .broker
            .open_ticket("u1", Uuid::new_v4(), "campsite")
            .await
            .expect("opens");

        assert_eq!(delivered, Some(DeliveryChannel::Email));
        assert_eq!(h.email.sent.lock().expect("lock").len(), 1);
    }
}
