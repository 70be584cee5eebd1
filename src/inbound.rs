//! Inbound SMS reply routing.
//!
//! Users reply to notification texts instead of tapping links often enough
//! that unmatched replies re-deliver the most recent unresolved ticket's
//! magic URL rather than vanishing. Consent keywords are handled first and
//! update the ledger synchronously.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::challenge::ChallengeBroker;
use crate::db::Database;
use crate::error::{ChallengeError, Error, Result};

const OPT_OUT_KEYWORDS: &[&str] = &["STOP", "STOPALL", "UNSUBSCRIBE", "CANCEL", "END", "QUIT"];
const OPT_IN_KEYWORDS: &[&str] = &["START", "YES", "UNSTOP"];
const HELP_KEYWORDS: &[&str] = &["HELP", "INFO"];

const HELP_TEXT: &str = "campclerk: we text you when a registration needs a human step. \
Reply STOP to opt out, START to opt back in.";

const GENERIC_GUIDANCE: &str = "No action is waiting on you right now. \
We'll text you a link when a registration needs your help. Reply HELP for help.";

const OPTED_OUT_GUIDANCE: &str = "You are opted out of campclerk messages. \
Reply START to receive registration links again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    OptOut,
    OptIn,
    Help,
    Other,
}

/// Classify a short inbound message. Consent keywords match the whole
/// trimmed message, case-insensitively, per SMS-gateway convention.
pub fn classify_reply(text: &str) -> ReplyKind {
    let normalized = text.trim().to_ascii_uppercase();
    if OPT_OUT_KEYWORDS.contains(&normalized.as_str()) {
        ReplyKind::OptOut
    } else if OPT_IN_KEYWORDS.contains(&normalized.as_str()) {
        ReplyKind::OptIn
    } else if HELP_KEYWORDS.contains(&normalized.as_str()) {
        ReplyKind::Help
    } else {
        ReplyKind::Other
    }
}

pub struct ReplyRouter {
    db: Arc<dyn Database>,
    broker: Arc<ChallengeBroker>,
}

impl ReplyRouter {
    pub fn new(db: Arc<dyn Database>, broker: Arc<ChallengeBroker>) -> Self {
        Self { db, broker }
    }

    /// Handle one inbound message and produce the reply body the gateway
    /// should deliver back to the sender.
    pub async fn handle(&self, from: &str, body: &str, now: DateTime<Utc>) -> Result<String> {
        match classify_reply(body) {
            ReplyKind::OptOut => {
                self.db.set_consent(from, false, now).await?;
                tracing::info!(phone = from, "consent revoked via STOP");
                Ok("You are opted out of campclerk messages. Reply START to opt back in."
                    .to_string())
            }
            ReplyKind::OptIn => {
                self.db.set_consent(from, true, now).await?;
                tracing::info!(phone = from, "consent granted via START");
                Ok("You are opted in to campclerk messages. Reply STOP to opt out.".to_string())
            }
            ReplyKind::Help => Ok(HELP_TEXT.to_string()),
            ReplyKind::Other => self.redeliver_link(from, now).await,
        }
    }

    async fn redeliver_link(&self, from: &str, now: DateTime<Utc>) -> Result<String> {
        let opted_in = self
            .db
            .get_consent(from)
            .await?
            .map(|entry| entry.opted_in)
            .unwrap_or(true);
        if !opted_in {
            return Ok(OPTED_OUT_GUIDANCE.to_string());
        }

        let Some(subscriber) = self.db.find_subscriber_by_phone(from).await? else {
            return Ok(GENERIC_GUIDANCE.to_string());
        };

        let Some(ticket) = self
            .db
            .latest_pending_ticket(&subscriber.user_id, now)
            .await?
        else {
            return Ok(GENERIC_GUIDANCE.to_string());
        };

        match self.broker.reply_link(&ticket, now).await {
            Ok(url) => Ok(format!(
                "Resume your {} registration here: {} (expires at {}).",
                ticket.provider,
                url,
                ticket.expires_at.format("%H:%M UTC"),
            )),
            Err(Error::Challenge(ChallengeError::Throttled { .. })) => Ok(
                "We sent your link a moment ago; check your recent messages.".to_string(),
            ),
            Err(e) => Err(e),
        }
    }
}
