//! Account Provisioner
//!
//! A payer without an identity gets a 7-day setup token by email. Redeeming
//! the token with a password creates a verified identity and links the
//! payer's most recent subscription to it.

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tutorly_shared::password::{hash_password_blocking, validate_password_strength};
use tutorly_shared::{
    AccountSetup, AccountSetupOutcome, EnrollmentStore, Identity, PendingActionKind, TokenError,
    TokenManager,
};

use crate::email::BillingEmailService;
use crate::error::BillingResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupTokenInfo {
    pub email: String,
    pub name: String,
}

#[derive(Clone)]
pub struct AccountProvisioner {
    store: Arc<dyn EnrollmentStore>,
    tokens: TokenManager,
    email: BillingEmailService,
    base_url: String,
}

impl AccountProvisioner {
    pub fn new(
        store: Arc<dyn EnrollmentStore>,
        email: BillingEmailService,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            tokens: TokenManager::new(store.clone()),
            store,
            email,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn setup_link(&self, token: &str) -> String {
        format!("{}/auth/setup?token={}", self.base_url, token)
    }

    /// Issue a setup token and send the welcome email
    ///
    /// Does nothing while an unexpired setup token is outstanding for the
    /// email, so redelivered payment events send one welcome email. Returns
    /// whether a token was issued. If the email cannot be sent the token is
    /// withdrawn and the error returned, so a redelivery issues a fresh one.
    pub async fn begin_provisioning(&self, email: &str, student_name: &str) -> BillingResult<bool> {
        let Some(action) = self
            .tokens
            .issue_if_none_outstanding(email, PendingActionKind::ProvisionAccount)
            .await?
        else {
            tracing::info!(email = %email, "Setup token already outstanding, not resending welcome");
            return Ok(false);
        };

        let link = self.setup_link(&action.token);
        if let Err(e) = self.email.send_welcome(email, student_name, &link).await {
            tracing::error!(
                email = %email,
                error = %e,
                "Failed to send welcome email, withdrawing setup token"
            );
            self.store.take_pending_action(&action.token).await?;
            return Err(e.into());
        }

        tracing::info!(email = %email, "Welcome email sent");
        Ok(true)
    }

    /// Look up a setup token for display before the password form
    pub async fn verify_setup_token(&self, token: &str) -> Result<SetupTokenInfo, TokenError> {
        let action = self
            .tokens
            .inspect(token, PendingActionKind::ProvisionAccount)
            .await?;

        let name = self
            .store
            .latest_subscription_for_email(&action.identifier)
            .await?
            .map(|s| s.student_name)
            .unwrap_or_default();

        Ok(SetupTokenInfo {
            email: action.identifier,
            name,
        })
    }

    /// Redeem a setup token, creating a verified identity
    pub async fn complete_setup(&self, token: &str, password: &str) -> Result<Identity, TokenError> {
        validate_password_strength(password)?;

        let action = self
            .tokens
            .inspect(token, PendingActionKind::ProvisionAccount)
            .await?;

        if self
            .store
            .find_identity_by_email(&action.identifier)
            .await?
            .is_some()
        {
            return Err(TokenError::AccountExists);
        }

        let password_hash = hash_password_blocking(password.to_string()).await?;

        let outcome = self
            .store
            .complete_account_setup(AccountSetup {
                token: token.to_string(),
                password_hash,
                verified_at: OffsetDateTime::now_utc(),
            })
            .await?;

        match outcome {
            AccountSetupOutcome::Created {
                identity,
                linked_subscription,
            } => {
                tracing::info!(
                    user_id = %identity.id,
                    email = %identity.email,
                    subscription_id = ?linked_subscription,
                    "Account created from setup token"
                );
                Ok(identity)
            }
            AccountSetupOutcome::TokenMissing => Err(TokenError::Invalid),
            AccountSetupOutcome::AccountExists => Err(TokenError::AccountExists),
        }
    }
}
