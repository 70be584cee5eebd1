//! Axum HTTP server for the webhook surface.
//!
//! Public routes carry their own authentication (shared secret, HMAC
//! signature, or capability token in the URL); operator routes sit behind a
//! bearer token.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::challenge::{ChallengeBroker, ResolveOutcome, TicketStatus};
use crate::db::Database;
use crate::error::{ChallengeError, Error, SettlementError};
use crate::inbound::ReplyRouter;
use crate::plan::PlanStatus;
use crate::settlement::SettlementCommitter;
use crate::web::auth::{AuthState, auth_middleware, constant_time_eq, verify_signature};
use crate::web::types::*;

/// Shared state for all webhook handlers.
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub committer: Arc<SettlementCommitter>,
    pub broker: Arc<ChallengeBroker>,
    pub replies: Arc<ReplyRouter>,
    /// Shared secret for the settlement callback.
    pub callback_secret: SecretString,
    /// Shared token the SMS gateway signs inbound bodies with.
    pub inbound_auth_token: SecretString,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl AppState {
    /// Ask the server to shut down gracefully.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Start the webhook HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    operator_token: String,
) -> Result<SocketAddr, crate::error::WebhookError> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        crate::error::WebhookError::StartupFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        }
    })?;
    let bound_addr =
        listener
            .local_addr()
            .map_err(|e| crate::error::WebhookError::StartupFailed {
                addr: addr.to_string(),
                reason: format!("Failed to get local addr: {}", e),
            })?;

    let auth_state = AuthState {
        token: operator_token,
    };

    // Public routes: each carries its own authentication.
    let public = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/settlement/callback", post(settlement_callback_handler))
        .route("/api/inbound/sms", post(inbound_sms_handler))
        .route("/resume/{token}", get(resume_peek_handler))
        .route("/resume/{token}/complete", post(resume_complete_handler));

    // Operator routes behind the bearer token.
    let protected = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/tickets/{id}/resend", post(resend_handler))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            auth_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = Router::new()
        .merge(public)
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(256 * 1024))
        .with_state(state.clone());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Webhook server shutting down");
            })
            .await
        {
            tracing::error!("Webhook server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "webhook server listening");
    Ok(bound_addr)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn settlement_callback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SettlementCallbackRequest>,
) -> Result<Json<SettlementCallbackResponse>, (StatusCode, String)> {
    let presented = headers
        .get("x-callback-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(presented, state.callback_secret.expose_secret()) {
        tracing::warn!("settlement callback rejected: bad shared secret");
        return Err((StatusCode::UNAUTHORIZED, "Bad shared secret".to_string()));
    }

    match state
        .committer
        .commit(
            request.reservation_id,
            request.success,
            request.provider_response,
            Utc::now(),
        )
        .await
    {
        Ok(view) => Ok(Json(SettlementCallbackResponse {
            ok: true,
            status: view.status.as_str().to_string(),
        })),
        Err(Error::Settlement(SettlementError::UnknownReservation { id })) => Err((
            StatusCode::NOT_FOUND,
            format!("Reservation {} not found", id),
        )),
        Err(e) => {
            tracing::error!(error = %e, "settlement callback failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn inbound_sms_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<InboundSmsResponse>, (StatusCode, String)> {
    let presented = headers
        .get("x-gateway-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(state.inbound_auth_token.expose_secret(), &body, presented) {
        tracing::warn!("inbound webhook rejected: unverifiable signature");
        return Err((
            StatusCode::UNAUTHORIZED,
            "Unverifiable signature".to_string(),
        ));
    }

    let request: InboundSmsRequest = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid payload: {}", e)))?;

    match state
        .replies
        .handle(&request.from, &request.body, Utc::now())
        .await
    {
        Ok(reply) => Ok(Json(InboundSmsResponse { reply })),
        Err(e) => {
            tracing::error!(error = %e, "inbound reply handling failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn resume_peek_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<TicketView>, (StatusCode, String)> {
    let ticket = match state.broker.peek(&token).await {
        Ok(ticket) => ticket,
        Err(Error::Challenge(ChallengeError::InvalidToken)) => {
            return Err((StatusCode::NOT_FOUND, "Unknown resume link".to_string()));
        }
        Err(e) => {
            tracing::error!(error = %e, "resume peek failed");
            return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };

    if ticket.status == TicketStatus::Expired
        || (ticket.status == TicketStatus::Pending && Utc::now() > ticket.expires_at)
    {
        return Err((
            StatusCode::GONE,
            "This resume link has expired. The attempt was abandoned.".to_string(),
        ));
    }

    Ok(Json(TicketView {
        id: ticket.id,
        provider: ticket.provider,
        status: ticket.status.as_str().to_string(),
        created_at: ticket.created_at,
        expires_at: ticket.expires_at,
    }))
}

async fn resume_complete_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<ResolveResponse>, (StatusCode, String)> {
    match state.broker.resolve(&token, Utc::now()).await {
        Ok(ResolveOutcome::Completed) => Ok(Json(ResolveResponse {
            status: TicketStatus::Completed.as_str().to_string(),
            already_resolved: false,
        })),
        Ok(ResolveOutcome::AlreadyTerminal(status)) => Ok(Json(ResolveResponse {
            status: status.as_str().to_string(),
            already_resolved: true,
        })),
        Ok(ResolveOutcome::Expired) => Err((
            StatusCode::GONE,
            "This resume link expired before the challenge was resolved.".to_string(),
        )),
        Err(Error::Challenge(ChallengeError::InvalidToken)) => {
            Err((StatusCode::NOT_FOUND, "Unknown resume link".to_string()))
        }
        Err(e) => {
            tracing::error!(error = %e, "resolution failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn resend_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ResendResponse>, (StatusCode, String)> {
    let ticket_id = Uuid::parse_str(&id)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid ticket ID".to_string()))?;

    match state.broker.resend(ticket_id, Utc::now()).await {
        Ok(channel) => Ok(Json(ResendResponse {
            ticket_id,
            channel: channel.as_str().to_string(),
        })),
        Err(Error::Challenge(ChallengeError::NotFound { .. })) => {
            Err((StatusCode::NOT_FOUND, "Ticket not found".to_string()))
        }
        Err(Error::Challenge(ChallengeError::Throttled { .. })) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            "Notification recently sent; try again shortly".to_string(),
        )),
        Err(Error::Challenge(ChallengeError::Expired { .. })) => {
            Err((StatusCode::GONE, "Ticket expired".to_string()))
        }
        Err(Error::Challenge(ChallengeError::AlreadyTerminal { status, .. })) => Err((
            StatusCode::CONFLICT,
            format!("Ticket already {}", status),
        )),
        Err(Error::Notify(e)) => Err((StatusCode::BAD_GATEWAY, e.to_string())),
        Err(e) => {
            tracing::error!(error = %e, "resend failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let active_plans = state
        .db
        .count_plans(PlanStatus::Active)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let done_plans = state
        .db
        .count_plans(PlanStatus::Done)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let pending_tickets = state
        .db
        .count_pending_tickets()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let pending_reservations = state
        .db
        .count_pending_reservations()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(StatusResponse {
        active_plans,
        done_plans,
        pending_tickets,
        pending_reservations,
        generated_at: Utc::now(),
    }))
}
