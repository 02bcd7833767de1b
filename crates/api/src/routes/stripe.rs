//! Checkout and Stripe webhook endpoints

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};
use serde::Serialize;
use tutorly_billing::{BillingError, CheckoutResponse, EnrollmentRequest};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// Validate an enrollment and return the hosted checkout URL
pub async fn create_checkout(
    State(state): State<AppState>,
    body: Result<Json<EnrollmentRequest>, JsonRejection>,
) -> ApiResult<Json<CheckoutResponse>> {
    let Json(request) = body.map_err(|e| {
        tracing::debug!(error = %e, "Rejected checkout body");
        ApiError::validation("Invalid request body")
    })?;

    match state.billing.checkout.create_checkout(request).await {
        Ok(response) => Ok(Json(response)),
        Err(BillingError::InvalidInput(message)) => Err(ApiError::Validation(message)),
        Err(e) => {
            tracing::error!(error = %e, "Checkout creation failed");
            Err(ApiError::internal("Failed to create checkout session"))
        }
    }
}

/// Receive a Stripe webhook
///
/// The body is taken as raw bytes: the signature covers the exact payload.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::validation("Missing stripe-signature header"))?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|_| ApiError::validation("Webhook signature verification failed"))?;

    let event_id = event.id.clone();
    let event_type = event.type_.clone();

    match state.billing.webhooks.handle_event(event).await {
        Ok(()) => {}
        Err(BillingError::WebhookInFlight) => {
            return Err(ApiError::Conflict(
                "Webhook event is being processed, retry later".to_string(),
            ));
        }
        Err(e) => {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Webhook handler failed"
            );
            return Err(ApiError::internal("Webhook handler failed"));
        }
    }

    Ok(Json(WebhookAck { received: true }))
}
