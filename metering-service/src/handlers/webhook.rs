//! Provider webhook endpoint.

use crate::services::metrics::record_webhook_event;
use crate::startup::AppState;
use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use service_core::error::AppError;

const SIGNATURE_HEADERS: [&str; 2] = ["Signature", "Stripe-Signature"];

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
}

/// Verifies and parses the event, then dispatches it. Any structurally valid,
/// signed event is acknowledged with 200 even when dispatch fails.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let event = state
        .webhooks
        .accept(signature_header(&headers), &body)
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected billing webhook");
            record_webhook_event("unknown", "rejected");
            AppError::from(e)
        })?;

    match state.webhooks.dispatch(&event).await {
        Ok(outcome) => {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                outcome = outcome.label(),
                "Billing webhook handled"
            );
            record_webhook_event(&event.event_type, outcome.label());
        }
        Err(e) => {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Billing webhook dispatch failed"
            );
            record_webhook_event(&event.event_type, "failed");
        }
    }

    Ok(Json(json!({ "received": true })))
}
