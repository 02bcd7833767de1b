//! Stripe webhook handling
//!
//! Verifies the signature over the raw request body, records each event in
//! the processing ledger, and reconciles local subscription state.
//! Deliveries may repeat and arrive in any order.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tutorly_shared::{EnrollmentStore, SubscriptionStatus, SubscriptionUpsert, WebhookClaim};

use crate::checkout::EnrollmentIntent;
use crate::error::{BillingError, BillingResult};
use crate::provisioning::AccountProvisioner;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed timestamp, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CUSTOMER_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const CUSTOMER_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

/// Verified Stripe event envelope
///
/// The object is kept as raw JSON and decoded per event type, so payloads from
/// newer API versions never fail envelope parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// A reference that Stripe sends either as a bare id or an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    subscription: Option<Expandable>,
    customer: Option<Expandable>,
    customer_email: Option<String>,
    amount_total: Option<i64>,
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: Option<String>,
    subscription: Option<Expandable>,
    // Newer API versions move the subscription under parent.subscription_details
    parent: Option<InvoiceParent>,
}

#[derive(Debug, Deserialize)]
struct InvoiceParent {
    subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct InvoiceSubscriptionDetails {
    subscription: Option<Expandable>,
}

impl InvoiceObject {
    fn subscription_id(self) -> Option<String> {
        self.subscription
            .or_else(|| {
                self.parent
                    .and_then(|p| p.subscription_details)
                    .and_then(|d| d.subscription)
            })
            .map(Expandable::into_id)
    }
}

fn decode_object<T: DeserializeOwned>(event: &WebhookEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        BillingError::WebhookEventNotSupported(format!(
            "{} object could not be decoded: {}",
            event.type_, e
        ))
    })
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn EnrollmentStore>,
    webhook_secret: String,
    provisioner: AccountProvisioner,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn EnrollmentStore>,
        webhook_secret: impl Into<String>,
        provisioner: AccountProvisioner,
    ) -> Self {
        Self {
            store,
            webhook_secret: webhook_secret.into(),
            provisioner,
        }
    }

    /// Verify and parse a Stripe webhook event
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.verify_event_at(payload, signature, now)
    }

    /// Verification against an explicit clock, in unix seconds
    pub fn verify_event_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        // Header format: t=timestamp,v1=signature[,v1=signature][,v0=...]
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in signature.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = value.parse().ok(),
                    "v1" => candidates.push(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header, potential forgery");
            BillingError::WebhookSignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header, potential forgery");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance, potential replay"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let computed = hex::encode(mac.finalize().into_bytes());

        let matched = candidates
            .iter()
            .any(|candidate| bool::from(computed.as_bytes().ct_eq(candidate.as_bytes())));

        if !matched {
            tracing::warn!(
                payload_len = payload.len(),
                "Webhook signature mismatch, potential forgery"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Webhook signature verified"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event
    ///
    /// The ledger claim is atomic: of concurrent deliveries of one event id
    /// only one processes it. An event whose last attempt failed, or that has
    /// been stuck in processing past the timeout, can be claimed again.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<()> {
        let claim = self
            .store
            .claim_webhook_event(&event.id, &event.type_)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                BillingError::from(e)
            })?;

        match claim {
            WebhookClaim::Claimed => {}
            WebhookClaim::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    "Duplicate webhook event, already processed successfully"
                );
                return Ok(());
            }
            WebhookClaim::InFlight => {
                // Not acknowledged: the processor must redeliver once the holder finishes or times out
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    "Webhook event is being processed by another worker"
                );
                return Err(BillingError::WebhookInFlight);
            }
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;
        let error_message = result.as_ref().err().map(ToString::to_string);

        // Retry once; a missing result leaves the event reclaimable only after the timeout
        if let Err(e) = self
            .store
            .finish_webhook_event(&event.id, error_message.as_deref())
            .await
        {
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                "First attempt to record webhook result failed, retrying"
            );
            if let Err(retry_err) = self
                .store
                .finish_webhook_event(&event.id, error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    error_message = ?error_message,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record webhook result after retry, event stays in processing"
                );
            }
        }

        result
    }

    async fn process_event_internal(&self, event: &WebhookEvent) -> BillingResult<()> {
        match event.type_.as_str() {
            CHECKOUT_SESSION_COMPLETED => self.handle_checkout_completed(event).await,
            CUSTOMER_SUBSCRIPTION_UPDATED => {
                self.handle_subscription_updated(event).await;
                Ok(())
            }
            CUSTOMER_SUBSCRIPTION_DELETED => {
                self.handle_subscription_deleted(event).await;
                Ok(())
            }
            INVOICE_PAYMENT_FAILED => {
                self.handle_invoice_payment_failed(event).await;
                Ok(())
            }
            other => {
                tracing::info!(event_type = %other, event_id = %event.id, "Unhandled event type");
                Ok(())
            }
        }
    }

    /// Record the subscription and link or provision the payer
    ///
    /// Errors propagate so the processor redelivers.
    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let session: CheckoutSessionObject = decode_object(event)?;

        let Some(subscription_id) = session.subscription.map(Expandable::into_id) else {
            tracing::info!(
                session_id = %session.id,
                "Checkout session has no subscription, nothing to record"
            );
            return Ok(());
        };

        let metadata = session.metadata.unwrap_or_default();
        let intent = EnrollmentIntent::from_metadata(&metadata, session.customer_email.as_deref());

        let monthly_amount = session
            .amount_total
            .map(|minor| Decimal::new(minor, 2))
            .unwrap_or_else(|| intent.plan.monthly_price());

        let identity = if intent.student_email.is_empty() {
            None
        } else {
            self.store
                .find_identity_by_email(&intent.student_email)
                .await?
        };

        let outcome = self
            .store
            .upsert_subscription(SubscriptionUpsert {
                stripe_subscription_id: subscription_id.clone(),
                stripe_customer_id: session.customer.map(Expandable::into_id),
                plan: intent.plan.as_str().to_string(),
                student_name: intent.student_name.clone(),
                student_email: intent.student_email.clone(),
                student_year: intent.student_year.clone(),
                courses: intent.courses.clone(),
                sessions_per_week: intent.sessions_per_week,
                monthly_amount,
                user_id: identity.as_ref().map(|i| i.id),
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            created = outcome.created,
            plan = %intent.plan,
            linked = identity.is_some(),
            "Subscription recorded from checkout"
        );

        if identity.is_none() && !intent.student_email.is_empty() {
            self.provisioner
                .begin_provisioning(&intent.student_email, &intent.student_name)
                .await?;
        } else if intent.student_email.is_empty() {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Checkout session carried no email, skipping account provisioning"
            );
        }

        Ok(())
    }

    async fn handle_subscription_updated(&self, event: &WebhookEvent) {
        let subscription: SubscriptionObject = match decode_object(event) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "Ignoring subscription update");
                return;
            }
        };

        let status = match subscription.status.parse::<SubscriptionStatus>() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Unknown subscription status, ignoring update"
                );
                return;
            }
        };

        self.apply_status(&subscription.id, status).await;
    }

    async fn handle_subscription_deleted(&self, event: &WebhookEvent) {
        match decode_object::<SubscriptionObject>(event) {
            Ok(subscription) => {
                self.apply_status(&subscription.id, SubscriptionStatus::Canceled)
                    .await
            }
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "Ignoring subscription deletion")
            }
        }
    }

    async fn handle_invoice_payment_failed(&self, event: &WebhookEvent) {
        let invoice: InvoiceObject = match decode_object(event) {
            Ok(invoice) => invoice,
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "Ignoring failed invoice");
                return;
            }
        };

        let invoice_id = invoice.id.clone().unwrap_or_default();
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::info!(invoice_id = %invoice_id, "Failed invoice has no subscription");
            return;
        };

        tracing::warn!(
            invoice_id = %invoice_id,
            subscription_id = %subscription_id,
            "Invoice payment failed"
        );
        self.apply_status(&subscription_id, SubscriptionStatus::PastDue)
            .await;
    }

    /// Set a local status; misses and store failures are logged, never raised
    async fn apply_status(&self, subscription_id: &str, status: SubscriptionStatus) {
        match self
            .store
            .set_subscription_status(subscription_id, status)
            .await
        {
            Ok(Some(_)) => tracing::info!(
                subscription_id = %subscription_id,
                status = %status,
                "Subscription status updated"
            ),
            Ok(None) => tracing::info!(
                subscription_id = %subscription_id,
                status = %status,
                "No local subscription for status change"
            ),
            Err(e) => tracing::error!(
                subscription_id = %subscription_id,
                status = %status,
                error = %e,
                "Failed to update subscription status"
            ),
        }
    }
}
