//! Registration plans and the append-only detection log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the open instant for a plan is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    /// The user registers by hand; the poller never probes.
    Manual,
    /// The provider published an exact open instant.
    Published,
    /// Open instant unknown; detect it from the provider page.
    Auto,
}

impl PlanStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Published => "published",
            Self::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "published" => Some(Self::Published),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    /// Whether the poller should watch plans with this strategy.
    pub fn is_pollable(self) -> bool {
        matches!(self, Self::Published | Self::Auto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Done,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One user's standing intent to auto-register for a specific session.
///
/// Plans are never deleted; the poller flips `status` to `done` when an open
/// verdict dispatches the attempt, and archival stays with the CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationPlan {
    pub id: Uuid,
    pub user_id: String,
    /// Reference into the external session catalog.
    pub session_ref: String,
    /// Exact open instant, when the provider published one.
    pub manual_open_at: Option<DateTime<Utc>>,
    /// Page to probe for open/closed signals.
    pub detection_url: Option<String>,
    pub strategy: PlanStrategy,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistrationPlan {
    pub fn new(user_id: impl Into<String>, session_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            session_ref: session_ref.into(),
            manual_open_at: None,
            detection_url: None,
            strategy: PlanStrategy::Auto,
            status: PlanStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of one detection probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSignal {
    OpenDetected,
    ClosedDetected,
    /// The probe itself failed. Never conflated with `ClosedDetected`: a
    /// transient outage must not look like "confirmed not open".
    Error,
}

impl DetectionSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenDetected => "open_detected",
            Self::ClosedDetected => "closed_detected",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open_detected" => Some(Self::OpenDetected),
            "closed_detected" => Some(Self::ClosedDetected),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Immutable fact: one probe of one plan at one instant.
///
/// The log is append-only and doubles as the staleness guard: "has this plan
/// been checked recently" is answered by reading the latest entry, never by a
/// separate lock table. Entries for a plan are monotone by `observed_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionLogEntry {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub observed_at: DateTime<Utc>,
    pub signal: DetectionSignal,
    pub evidence: String,
}

impl DetectionLogEntry {
    pub fn new(plan_id: Uuid, observed_at: DateTime<Utc>, signal: DetectionSignal, evidence: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            observed_at,
            signal,
            evidence: evidence.into(),
        }
    }
}
