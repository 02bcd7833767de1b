//! Self-service account flows: registration, email verification and
//! password reset. All three use pending-action tokens of their own kind.

use std::sync::Arc;
use time::OffsetDateTime;
use tutorly_shared::password::{hash_password_blocking, validate_password_strength};
use tutorly_shared::{
    EnrollmentStore, Identity, Mailer, NewIdentity, PendingActionKind, StoreError, TokenError,
    TokenManager,
};

use crate::email::AccountEmailService;

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("Missing required fields")]
    MissingFields,

    #[error("Email already registered")]
    EmailTaken,

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl From<StoreError> for AccountError {
    fn from(err: StoreError) -> Self {
        AccountError::Token(TokenError::Store(err))
    }
}

#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn EnrollmentStore>,
    tokens: TokenManager,
    email: AccountEmailService,
    base_url: String,
}

impl AccountService {
    pub fn new(store: Arc<dyn EnrollmentStore>, mailer: Arc<dyn Mailer>, base_url: &str) -> Self {
        Self {
            tokens: TokenManager::new(store.clone()),
            store,
            email: AccountEmailService::new(mailer),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create an unverified identity and send a verification link
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Identity, AccountError> {
        let (name, email) = (name.trim(), email.trim());
        if name.is_empty() || email.is_empty() || password.is_empty() {
            return Err(AccountError::MissingFields);
        }
        validate_password_strength(password)?;

        if self.store.find_identity_by_email(email).await?.is_some() {
            return Err(AccountError::EmailTaken);
        }

        let password_hash = hash_password_blocking(password.to_string()).await?;
        let identity = match self
            .store
            .create_identity(NewIdentity {
                email: email.to_string(),
                name: name.to_string(),
                password_hash: Some(password_hash),
                email_verified_at: None,
            })
            .await
        {
            Ok(identity) => identity,
            Err(StoreError::Conflict(_)) => return Err(AccountError::EmailTaken),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(user_id = %identity.id, "Account registered");

        // The account exists either way; a lost link can be replaced via password reset
        match self.tokens.issue(email, PendingActionKind::VerifyEmail).await {
            Ok(action) => {
                let url = format!("{}/auth/verify-email?token={}", self.base_url, action.token);
                if let Err(e) = self.email.send_verification(email, name, &url).await {
                    tracing::error!(error = %e, email = %email, "Failed to send verification email");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, email = %email, "Failed to issue verification token")
            }
        }

        Ok(identity)
    }

    pub async fn verify_email(&self, token: &str) -> Result<(), TokenError> {
        let action = self
            .tokens
            .consume(token, PendingActionKind::VerifyEmail)
            .await?;

        if !self
            .store
            .mark_email_verified(&action.identifier, OffsetDateTime::now_utc())
            .await?
        {
            tracing::warn!(email = %action.identifier, "Verification token for missing account");
            return Err(TokenError::Invalid);
        }

        tracing::info!(email = %action.identifier, "Email verified");
        Ok(())
    }

    /// Send a reset link if the email belongs to an account
    ///
    /// Returns whether a link was issued; callers must not reveal it.
    pub async fn request_password_reset(&self, email: &str) -> Result<bool, TokenError> {
        let email = email.trim();
        let Some(identity) = self.store.find_identity_by_email(email).await? else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(false);
        };

        let action = self
            .tokens
            .issue(&identity.email, PendingActionKind::ResetPassword)
            .await?;
        let url = format!("{}/auth/reset-password?token={}", self.base_url, action.token);

        if let Err(e) = self
            .email
            .send_password_reset(&identity.email, &identity.name, &url)
            .await
        {
            tracing::error!(error = %e, user_id = %identity.id, "Failed to send password reset email");
        }

        Ok(true)
    }

    pub async fn reset_password(&self, token: &str, password: &str) -> Result<(), TokenError> {
        validate_password_strength(password)?;

        self.tokens
            .inspect(token, PendingActionKind::ResetPassword)
            .await?;
        let password_hash = hash_password_blocking(password.to_string()).await?;

        let action = self
            .tokens
            .consume(token, PendingActionKind::ResetPassword)
            .await?;

        if !self
            .store
            .set_password_hash(&action.identifier, &password_hash)
            .await?
        {
            return Err(TokenError::Invalid);
        }

        tracing::info!(email = %action.identifier, "Password reset");
        Ok(())
    }
}
