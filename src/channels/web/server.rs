//! Axum server for the payment webhook.
//!
//! One consuming endpoint: the payment processor POSTs status events here,
//! at-least-once. Whatever the delivery count, the response is HTTP 200 for
//! anything that parses — duplicates get an "already processed" message, not
//! an error, so the processor stops retrying. Idempotency itself lives in
//! [`PaymentLedger`]; this layer only authenticates, decodes, and maps
//! outcomes onto the wire contract.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::watch;

use crate::error::ChannelError;
use crate::payments::{PaymentLedger, PaymentStatus, WebhookOutcome};

const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

/// Shared state for the webhook handlers.
pub struct AppState {
    pub ledger: Arc<PaymentLedger>,
    /// When set, every webhook must carry the matching token header.
    pub shared_secret: Option<SecretString>,
}

/// Webhook body delivered by the payment processor.
#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub track_id: String,
    pub status: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Wire response: `{status: ok|error, message}`.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub message: String,
}

impl WebhookResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok",
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
        }
    }
}

/// Build the router. Exposed separately from [`start_server`] so tests can
/// drive it with `tower::ServiceExt::oneshot`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/payment", post(payment_webhook_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the webhook server. Returns the bound address (useful when binding
/// to port 0); shuts down when `shutdown` flips to true.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr, ChannelError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ChannelError::StartupFailed {
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed {
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let app = router(state);
    tokio::spawn(async move {
        let shutdown_signal = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            tracing::error!(error = %e, "webhook server exited with error");
        }
    });

    tracing::info!(addr = %bound_addr, "payment webhook listening");
    Ok(bound_addr)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn token_matches(secret: &SecretString, headers: &HeaderMap) -> bool {
    let presented = headers
        .get(WEBHOOK_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    presented
        .as_bytes()
        .ct_eq(secret.expose_secret().as_bytes())
        .into()
}

async fn payment_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<WebhookBody>,
) -> (StatusCode, Json<WebhookResponse>) {
    if let Some(secret) = &state.shared_secret
        && !token_matches(secret, &headers)
    {
        tracing::warn!(track_id = %body.track_id, "webhook with bad token rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(WebhookResponse::error("invalid webhook token")),
        );
    }

    let status = match PaymentStatus::parse(&body.status) {
        Ok(status) => status,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::error(format!(
                    "unknown status '{}'",
                    body.status
                ))),
            );
        }
    };

    let payload = serde_json::json!({
        "track_id": body.track_id,
        "status": body.status,
        "amount": body.amount,
        "currency": body.currency,
    });

    match state.ledger.apply(&body.track_id, status, &payload).await {
        Ok(WebhookOutcome::Applied { current_status }) => (
            StatusCode::OK,
            Json(WebhookResponse::ok(format!(
                "applied, status now {}",
                current_status.as_str()
            ))),
        ),
        Ok(WebhookOutcome::AlreadyProcessed { current_status }) => (
            StatusCode::OK,
            Json(WebhookResponse::ok(format!(
                "already processed, status {}",
                current_status.as_str()
            ))),
        ),
        Ok(WebhookOutcome::NoMatch) => (
            StatusCode::OK,
            Json(WebhookResponse::ok("no matching payment")),
        ),
        Ok(WebhookOutcome::Ignored) => (
            StatusCode::OK,
            Json(WebhookResponse::ok("non-terminal status acknowledged")),
        ),
        Err(e) => {
            tracing::error!(track_id = %body.track_id, error = %e, "webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookResponse::error("internal error, retry later")),
            )
        }
    }
}
