//! Application state

use std::sync::Arc;
use tutorly_billing::{BillingResult, BillingService, PaymentProcessor};
use tutorly_shared::{EmailConfig, EnrollmentStore, Mailer, PgStore, ResendMailer};

use crate::{accounts::AccountService, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub accounts: AccountService,
}

impl AppState {
    /// Wire state from explicit collaborators
    pub fn new(
        config: Config,
        store: Arc<dyn EnrollmentStore>,
        processor: Arc<dyn PaymentProcessor>,
        mailer: Arc<dyn Mailer>,
        webhook_secret: String,
    ) -> Self {
        let billing = BillingService::new(
            store.clone(),
            processor,
            mailer.clone(),
            webhook_secret,
            &config.app_base_url,
        );
        Self::assemble(config, store, billing, mailer)
    }

    /// Production wiring: Postgres store, Resend mailer, Stripe from env
    pub fn from_env(config: Config, pool: sqlx::PgPool) -> BillingResult<Self> {
        let store: Arc<dyn EnrollmentStore> = Arc::new(PgStore::new(pool));

        let resend = ResendMailer::new(EmailConfig::from_env());
        if resend.is_enabled() {
            tracing::info!("Email delivery enabled");
        } else {
            tracing::warn!("Email delivery not configured (missing RESEND_API_KEY)");
        }
        let mailer: Arc<dyn Mailer> = Arc::new(resend);

        let billing = BillingService::from_env(store.clone(), mailer.clone(), &config.app_base_url)?;
        tracing::info!("Stripe billing service initialized");

        Ok(Self::assemble(config, store, billing, mailer))
    }

    fn assemble(
        config: Config,
        store: Arc<dyn EnrollmentStore>,
        billing: BillingService,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let accounts = AccountService::new(store, mailer, &config.app_base_url);
        Self {
            config,
            billing: Arc::new(billing),
            accounts,
        }
    }
}
