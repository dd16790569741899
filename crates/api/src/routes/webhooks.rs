//! Stripe webhook endpoint
//!
//! Takes the raw body so signature verification sees the exact bytes
//! Stripe signed. Unresolved events are acknowledged with 2xx (they are
//! flagged for manual reconciliation, redelivery would not help); apply
//! errors return 5xx so Stripe redelivers.

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use swapdeck_ledger::WebhookDisposition;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /webhooks/payments
pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let Some(handler) = &state.webhooks else {
        return Err(ApiError::ServiceUnavailable(
            "Payment webhooks are not configured".to_string(),
        ));
    };

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    let event = handler
        .verify_event(&body, signature)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let event_type = event.type_.to_string();
    let disposition = handler.handle_event(event).await?;

    match &disposition {
        WebhookDisposition::Applied => {
            tracing::info!(event_type = %event_type, "webhook applied");
        }
        WebhookDisposition::Duplicate => {
            tracing::info!(event_type = %event_type, "webhook duplicate, no-op");
        }
        WebhookDisposition::Ignored => {
            tracing::debug!(event_type = %event_type, "webhook ignored");
        }
        WebhookDisposition::Unresolved => {
            tracing::warn!(event_type = %event_type, "webhook flagged for reconciliation");
        }
    }

    Ok(Json(
        json!({ "received": true, "disposition": disposition.as_str() }),
    ))
}
