//! Persistence boundary for identities, subscriptions, pending actions and
//! the webhook event ledger.
//!
//! Two backends implement [`EnrollmentStore`]: [`PgStore`] for production and
//! [`MemoryStore`] for tests and local runs without a database.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::models::{
    AccountSetup, AccountSetupOutcome, Identity, NewIdentity, PendingAction, Subscription,
    SubscriptionUpsert, UpsertOutcome, WebhookClaim,
};
use crate::types::{PendingActionKind, SubscriptionStatus};

/// How long an event may sit in `processing` before another delivery may reclaim it
pub const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Database(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    // Identities

    async fn find_identity_by_email(&self, email: &str) -> StoreResult<Option<Identity>>;

    /// Fails with [`StoreError::Conflict`] when the email is taken
    async fn create_identity(&self, identity: NewIdentity) -> StoreResult<Identity>;

    /// Returns false when no identity has this email
    async fn set_password_hash(&self, email: &str, password_hash: &str) -> StoreResult<bool>;

    async fn mark_email_verified(&self, email: &str, at: OffsetDateTime) -> StoreResult<bool>;

    // Subscriptions

    /// Insert or update keyed by the processor subscription id
    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> StoreResult<UpsertOutcome>;

    /// Returns `None` when no local record exists; never creates one
    async fn set_subscription_status(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<Option<Subscription>>;

    async fn find_subscription(&self, stripe_subscription_id: &str)
        -> StoreResult<Option<Subscription>>;

    async fn latest_subscription_for_email(&self, email: &str) -> StoreResult<Option<Subscription>>;

    // Pending actions

    async fn insert_pending_action(&self, action: &PendingAction) -> StoreResult<()>;

    async fn find_pending_action(&self, token: &str) -> StoreResult<Option<PendingAction>>;

    /// Insert `action` unless an unexpired action of the same kind is
    /// outstanding for its identifier, clearing expired ones first
    ///
    /// Returns whether the action was inserted. Concurrent callers for one
    /// identifier insert at most one provisioning action between them.
    async fn insert_pending_action_unless_live(
        &self,
        action: &PendingAction,
        now: OffsetDateTime,
    ) -> StoreResult<bool>;

    /// Atomically removes the token, returning it if this call removed it
    async fn take_pending_action(&self, token: &str) -> StoreResult<Option<PendingAction>>;

    async fn delete_pending_actions_for(
        &self,
        identifier: &str,
        kind: PendingActionKind,
    ) -> StoreResult<u64>;

    async fn purge_expired_pending_actions(&self, now: OffsetDateTime) -> StoreResult<u64>;

    /// Redeem a provisioning token in a single unit of work: consume the
    /// token, create a verified identity named after the latest subscription
    /// for the email, and link that subscription. Nothing is written unless
    /// every step succeeds.
    async fn complete_account_setup(&self, setup: AccountSetup)
        -> StoreResult<AccountSetupOutcome>;

    // Webhook ledger

    async fn claim_webhook_event(&self, event_id: &str, event_type: &str)
        -> StoreResult<WebhookClaim>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        error_message: Option<&str>,
    ) -> StoreResult<()>;
}
