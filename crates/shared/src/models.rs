//! Persistent records owned by the enrollment core

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{PendingActionKind, Plan, SubscriptionStatus};

/// A person who can sign in
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub email_verified_at: Option<OffsetDateTime>,
    pub role: String,
    pub onboarded: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Identity {
    pub fn is_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }
}

/// Fields required to create an identity
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub email: String,
    pub name: String,
    pub password_hash: Option<String>,
    pub email_verified_at: Option<OffsetDateTime>,
}

/// Local mirror of one processor subscription
///
/// Student fields are a snapshot taken at checkout time and are kept even
/// after the subscription is linked to an identity.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub plan: String,
    pub student_name: String,
    pub student_email: String,
    pub student_year: String,
    pub courses: Vec<String>,
    pub sessions_per_week: Option<i32>,
    pub monthly_amount: Decimal,
    pub status: String,
    pub user_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn plan(&self) -> Option<Plan> {
        self.plan.parse().ok()
    }

    pub fn status(&self) -> Option<SubscriptionStatus> {
        self.status.parse().ok()
    }
}

/// Snapshot written by a completed checkout
///
/// Creating a record stores every field. Updating an existing record only
/// touches the status, customer id, contact email and (when present) the
/// identity link.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub plan: String,
    pub student_name: String,
    pub student_email: String,
    pub student_year: String,
    pub courses: Vec<String>,
    pub sessions_per_week: Option<i32>,
    pub monthly_amount: Decimal,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub subscription: Subscription,
    pub created: bool,
}

/// Single-use, expiring token bound to an email and a purpose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub token: String,
    pub identifier: String,
    pub kind: PendingActionKind,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl PendingAction {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Input to the atomic token-redemption-and-identity-creation step
#[derive(Debug, Clone)]
pub struct AccountSetup {
    pub token: String,
    pub password_hash: String,
    pub verified_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub enum AccountSetupOutcome {
    Created {
        identity: Identity,
        linked_subscription: Option<Uuid>,
    },
    /// The token was already consumed (or never existed for this kind)
    TokenMissing,
    /// An identity with the token's email exists; nothing was changed
    AccountExists,
}

/// State of a webhook event in the processing ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    /// Caller holds exclusive processing rights
    Claimed,
    /// Another delivery of the same event finished successfully
    AlreadyProcessed,
    /// Another delivery is processing it right now
    InFlight,
}
