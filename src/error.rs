//! Error types for campclerk.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),
}

/// Configuration-related errors. These fail fast at startup and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Detection-probe errors. All transient: the next tick retries, and an
/// `error` signal is logged so the staleness guard still converges.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Fetch of {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("Fetch of {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Plan {plan_id} has no detection URL")]
    NoDetectionUrl { plan_id: Uuid },
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("SMS delivery to {to} failed: {reason}")]
    SmsFailed { to: String, reason: String },

    #[error("Email delivery to {to} failed: {reason}")]
    EmailFailed { to: String, reason: String },

    #[error("No deliverable channel for user {user_id}")]
    NoChannel { user_id: String },

    #[error("Recipient {phone} has opted out of automated messages")]
    OptedOut { phone: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Challenge-ticket errors.
#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("Ticket {id} not found")]
    NotFound { id: Uuid },

    #[error("Unknown or reused resume token")]
    InvalidToken,

    #[error("Ticket {id} expired at {expires_at}")]
    Expired {
        id: Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Ticket {id} already in terminal state {status}")]
    AlreadyTerminal { id: Uuid, status: String },

    #[error("Re-notification for ticket {id} throttled")]
    Throttled { id: Uuid },
}

/// Settlement errors.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Reservation {id} not found")]
    UnknownReservation { id: Uuid },

    #[error("Processor {action} for charge {charge_ref} failed: {reason}")]
    ProcessorFailed {
        action: String,
        charge_ref: String,
        reason: String,
    },

    #[error("Processor {action} for charge {charge_ref} rejected: HTTP {status}")]
    ProcessorRejected {
        action: String,
        charge_ref: String,
        status: u16,
    },
}

impl SettlementError {
    /// Transient processor failures are retried with bounded attempts;
    /// rejections and unknown reservations are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProcessorFailed { .. } => true,
            Self::ProcessorRejected { status, .. } => *status >= 500,
            Self::UnknownReservation { .. } => false,
        }
    }
}

/// Webhook surface errors (security failures reject without state mutation).
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Bad shared secret")]
    BadSecret,

    #[error("Unverifiable gateway signature")]
    BadSignature,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to bind {addr}: {reason}")]
    StartupFailed { addr: String, reason: String },
}

/// Result type alias for the coordinator.
pub type Result<T> = std::result::Result<T, Error>;
