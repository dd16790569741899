//! HTTP routes

pub mod credits;
pub mod face_swap;
pub mod health;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::auth::require_auth;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Webhook and health endpoints are unauthenticated; everything else
    // requires a provider-issued bearer token
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/webhooks/payments", post(webhooks::handle_payment_webhook));

    let protected = Router::new()
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::get_transactions))
        .route("/face-swap", post(face_swap::create_face_swap))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
}
