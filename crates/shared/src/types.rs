//! Shared enumerations for plans, subscription lifecycle and pending actions

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currency every plan is charged in
pub const PLAN_CURRENCY: &str = "gbp";

/// Tutoring plans offered at checkout
///
/// The monthly price is flat per plan: it does not depend on how many
/// courses were selected or how many sessions per week were requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Steady,
    Focus,
}

impl Plan {
    pub const ALL: [Plan; 2] = [Plan::Steady, Plan::Focus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Steady => "steady",
            Plan::Focus => "focus",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Plan::Steady => "Steady",
            Plan::Focus => "Focus",
        }
    }

    /// Monthly price in minor units (pence)
    pub fn monthly_price_pence(&self) -> i64 {
        match self {
            Plan::Steady => 2_500,
            Plan::Focus => 4_000,
        }
    }

    /// Monthly price as a decimal currency amount
    pub fn monthly_price(&self) -> Decimal {
        Decimal::new(self.monthly_price_pence(), 2)
    }

    /// Short description of the session cadence shown on the checkout page
    pub fn session_summary(&self) -> &'static str {
        match self {
            Plan::Steady => "Weekly 1-hour sessions",
            Plan::Focus => "Intensive 2-hour sessions",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan: {0}")]
pub struct UnknownPlan(pub String);

impl FromStr for Plan {
    type Err = UnknownPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "steady" => Ok(Plan::Steady),
            "focus" => Ok(Plan::Focus),
            other => Err(UnknownPlan(other.to_string())),
        }
    }
}

/// Local mirror of the payment processor's subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Trialing,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subscription status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Purpose a pending-action token was issued for
///
/// Each redemption path only accepts tokens of its own kind, so a password
/// reset token can never complete an account setup for the same email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingActionKind {
    VerifyEmail,
    ResetPassword,
    ProvisionAccount,
}

impl PendingActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingActionKind::VerifyEmail => "verify_email",
            PendingActionKind::ResetPassword => "reset_password",
            PendingActionKind::ProvisionAccount => "provision_account",
        }
    }

    /// How long a freshly issued token of this kind stays redeemable
    pub fn ttl(&self) -> time::Duration {
        match self {
            PendingActionKind::VerifyEmail => time::Duration::hours(24),
            PendingActionKind::ResetPassword => time::Duration::hours(1),
            PendingActionKind::ProvisionAccount => time::Duration::days(7),
        }
    }
}

impl fmt::Display for PendingActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pending action kind: {0}")]
pub struct UnknownActionKind(pub String);

impl FromStr for PendingActionKind {
    type Err = UnknownActionKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verify_email" => Ok(PendingActionKind::VerifyEmail),
            "reset_password" => Ok(PendingActionKind::ResetPassword),
            "provision_account" => Ok(PendingActionKind::ProvisionAccount),
            other => Err(UnknownActionKind(other.to_string())),
        }
    }
}
