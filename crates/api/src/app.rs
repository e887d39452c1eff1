//! HTTP surface: the Stripe webhook endpoint plus a small admin API.
//!
//! The webhook handler verifies the signature against the raw body, maps the
//! event to a job, and acknowledges immediately; all fulfillment work happens
//! on the worker channel.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::sync::mpsc;

use postcards_fulfillment::client::PcmClient;
use postcards_fulfillment::notify::LogNotifier;
use postcards_fulfillment::service::FulfillmentService;
use postcards_store::SqliteRetryQueue;

use crate::stripe::{self, StripeEvent};
use crate::worker::FulfillmentJob;

/// The production service wiring.
pub type AppService = FulfillmentService<PcmClient, LogNotifier, SqliteRetryQueue>;

#[derive(Clone)]
pub struct AppState {
    pub jobs: mpsc::Sender<FulfillmentJob>,
    pub service: Arc<AppService>,
    pub webhook_secret: Option<String>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(stripe_webhook))
        .route("/admin/retry-queue", get(retry_queue_status))
        .route("/admin/retry-queue/process", post(process_retry_queue))
        .route("/admin/fulfillment/connection", get(connection_status))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if let Err(err) =
            stripe::verify_signature(&body, signature, secret, Utc::now().timestamp())
        {
            tracing::warn!(error = %err, "rejected webhook with bad signature");
            return json_error(StatusCode::UNAUTHORIZED, "bad_signature", err.to_string());
        }
    } else {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set; accepting unsigned webhook");
    }

    let event: StripeEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_payload", err.to_string());
        }
    };

    tracing::info!(event_id = %event.id, event_type = %event.event_type, "webhook received");

    match FulfillmentJob::from_event(&event.event_type, event.data.object) {
        Some(job) => {
            if state.jobs.send(job).await.is_err() {
                tracing::error!("fulfillment worker channel closed");
                return json_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "worker_unavailable",
                    "fulfillment worker is not running",
                );
            }
        }
        None => {
            tracing::debug!(event_type = %event.event_type, "unhandled event type");
        }
    }

    (StatusCode::OK, Json(serde_json::json!({ "received": true }))).into_response()
}

async fn retry_queue_status(State(state): State<AppState>) -> axum::response::Response {
    match state.service.retry_queue_status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string()),
    }
}

async fn process_retry_queue(State(state): State<AppState>) -> axum::response::Response {
    if state.jobs.send(FulfillmentJob::ProcessRetryQueue).await.is_err() {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "worker_unavailable",
            "fulfillment worker is not running",
        );
    }
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "scheduled": true }))).into_response()
}

async fn connection_status(State(state): State<AppState>) -> axum::response::Response {
    let status = state.service.test_connection().await;
    (StatusCode::OK, Json(status)).into_response()
}

fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
