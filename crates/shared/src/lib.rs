#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tutorly shared core
//!
//! Domain types, persistence, pending-action tokens, password hashing and the
//! outbound mail transport used by the billing, api and worker crates.

pub mod db;
pub mod email;
pub mod models;
pub mod password;
pub mod store;
pub mod tokens;
pub mod types;

pub use email::{EmailConfig, EmailError, Mailer, OutboundEmail, ResendMailer};
pub use models::{
    AccountSetup, AccountSetupOutcome, Identity, NewIdentity, PendingAction, Subscription,
    SubscriptionUpsert, UpsertOutcome, WebhookClaim,
};
pub use store::{EnrollmentStore, MemoryStore, PgStore, StoreError, StoreResult};
pub use tokens::{TokenError, TokenManager};
pub use types::{PendingActionKind, Plan, SubscriptionStatus, PLAN_CURRENCY};
