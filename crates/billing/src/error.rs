use tutorly_shared::{EmailError, StoreError, TokenError};

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Another delivery of the same event holds the ledger claim
    #[error("Webhook event is still being processed")]
    WebhookInFlight,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Email error: {0}")]
    Email(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<EmailError> for BillingError {
    fn from(err: EmailError) -> Self {
        BillingError::Email(err.to_string())
    }
}

impl From<TokenError> for BillingError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Store(e) => BillingError::Database(e.to_string()),
            other => BillingError::Internal(other.to_string()),
        }
    }
}
