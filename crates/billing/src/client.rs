//! Stripe client configuration and the payment processor seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Upper bound for a single checkout session creation call
pub const STRIPE_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Everything the processor needs to open a hosted subscription checkout
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionRequest {
    pub customer_email: String,
    pub success_url: String,
    pub cancel_url: String,
    pub currency: String,
    pub unit_amount: i64,
    pub product_name: String,
    pub product_description: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedCheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CreatedCheckoutSession>;
}

// Form body for POST /v1/checkout/sessions, encoded with bracketed keys
#[derive(Serialize)]
struct CheckoutSessionForm<'a> {
    mode: &'static str,
    customer_email: &'a str,
    success_url: &'a str,
    cancel_url: &'a str,
    payment_method_types: Vec<&'static str>,
    line_items: Vec<LineItemForm<'a>>,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct LineItemForm<'a> {
    quantity: u32,
    price_data: PriceDataForm<'a>,
}

#[derive(Serialize)]
struct PriceDataForm<'a> {
    currency: &'a str,
    unit_amount: i64,
    recurring: RecurringForm,
    product_data: ProductDataForm<'a>,
}

#[derive(Serialize)]
struct RecurringForm {
    interval: &'static str,
}

#[derive(Serialize)]
struct ProductDataForm<'a> {
    name: &'a str,
    description: &'a str,
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CreatedCheckoutSession> {
        let form = CheckoutSessionForm {
            mode: "subscription",
            customer_email: &request.customer_email,
            success_url: &request.success_url,
            cancel_url: &request.cancel_url,
            payment_method_types: vec!["card"],
            line_items: vec![LineItemForm {
                quantity: 1,
                price_data: PriceDataForm {
                    currency: &request.currency,
                    unit_amount: request.unit_amount,
                    recurring: RecurringForm { interval: "month" },
                    product_data: ProductDataForm {
                        name: &request.product_name,
                        description: &request.product_description,
                    },
                },
            }],
            metadata: &request.metadata,
        };

        let call = self
            .inner
            .post_form::<CreatedCheckoutSession, _>("/checkout/sessions", form);

        match tokio::time::timeout(STRIPE_REQUEST_TIMEOUT, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BillingError::StripeApi(
                "checkout session request timed out".to_string(),
            )),
        }
    }
}
