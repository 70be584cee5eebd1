//! Request/response types for the webhook surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Settlement callback body, posted by the attempt executor on its terminal
/// outcome.
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementCallbackRequest {
    pub reservation_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub provider_response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementCallbackResponse {
    pub ok: bool,
    pub status: String,
}

/// Inbound SMS webhook body from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundSmsRequest {
    pub from: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundSmsResponse {
    pub reply: String,
}

/// Ticket view surfaced behind a magic resume link.
#[derive(Debug, Clone, Serialize)]
pub struct TicketView {
    pub id: Uuid,
    pub provider: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveResponse {
    pub status: String,
    /// `true` when this call found the ticket already terminal (token replay
    /// or a lost race) and performed no transition.
    pub already_resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResendResponse {
    pub ticket_id: Uuid,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Operator summary.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub active_plans: i64,
    pub done_plans: i64,
    pub pending_tickets: i64,
    pub pending_reservations: i64,
    pub generated_at: DateTime<Utc>,
}
