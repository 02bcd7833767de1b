//! HTTP routes

pub mod auth;
pub mod health;
pub mod stripe;

#[cfg(test)]
mod tests;

use axum::{
    routing::{get, post},
    Router,
};

use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        // Enrollment checkout and Stripe webhooks
        .route("/api/stripe/create-checkout", post(stripe::create_checkout))
        .route("/api/stripe/webhook", post(stripe::webhook))
        // Account provisioning and self-service account flows
        .route("/api/auth/verify-token", get(auth::verify_token))
        .route("/api/auth/setup-account", post(auth::setup_account))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/verify-email", post(auth::verify_email))
        .route("/api/auth/forgot-password", post(auth::forgot_password))
        .route("/api/auth/reset-password", post(auth::reset_password))
        .fallback(|| async { ApiError::NotFound })
        .with_state(state)
}
