// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tutorly Billing Module
//!
//! Handles the Stripe side of enrollment: opening checkout sessions,
//! reconciling subscription state from webhooks, and provisioning accounts
//! for new payers.
//!
//! ## Features
//!
//! - **Checkout**: Validate enrollment requests and open hosted subscription checkouts
//! - **Webhooks**: Verify signatures, de-duplicate deliveries, mirror subscription status
//! - **Provisioning**: Setup tokens and welcome emails for payers without an account

pub mod checkout;
pub mod client;
pub mod email;
pub mod error;
pub mod provisioning;
pub mod webhooks;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


// Checkout
pub use checkout::{
    CheckoutResponse, CheckoutService, EnrollmentIntent, EnrollmentRequest, StudentInfo,
};

// Client
pub use client::{
    CheckoutSessionRequest, CreatedCheckoutSession, PaymentProcessor, StripeClient, StripeConfig,
};

// Email
pub use email::BillingEmailService;

// Error
pub use error::{BillingError, BillingResult};

// Provisioning
pub use provisioning::{AccountProvisioner, SetupTokenInfo};

// Webhooks
pub use webhooks::{WebhookEvent, WebhookHandler};

use std::sync::Arc;
use tutorly_shared::{EnrollmentStore, Mailer};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub checkout: CheckoutService,
    pub provisioner: AccountProvisioner,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(
        store: Arc<dyn EnrollmentStore>,
        mailer: Arc<dyn Mailer>,
        base_url: &str,
    ) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        Ok(Self::new(
            store,
            Arc::new(stripe),
            mailer,
            webhook_secret,
            base_url,
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn EnrollmentStore>,
        processor: Arc<dyn PaymentProcessor>,
        mailer: Arc<dyn Mailer>,
        webhook_secret: String,
        base_url: &str,
    ) -> Self {
        let provisioner =
            AccountProvisioner::new(store.clone(), BillingEmailService::new(mailer), base_url);

        Self {
            checkout: CheckoutService::new(processor, base_url),
            provisioner: provisioner.clone(),
            webhooks: WebhookHandler::new(store, webhook_secret, provisioner),
        }
    }
}
