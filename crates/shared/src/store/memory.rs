use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{EnrollmentStore, StoreError, StoreResult, WEBHOOK_PROCESSING_TIMEOUT_MINUTES};
use crate::models::{
    AccountSetup, AccountSetupOutcome, Identity, NewIdentity, PendingAction, Subscription,
    SubscriptionUpsert, UpsertOutcome, WebhookClaim,
};
use crate::types::{PendingActionKind, SubscriptionStatus};

#[derive(Debug, Clone)]
struct LedgerEntry {
    event_type: String,
    result: String,
    started_at: OffsetDateTime,
    error_message: Option<String>,
}

#[derive(Default)]
struct Inner {
    identities: Vec<Identity>,
    // Insertion order doubles as creation order
    subscriptions: Vec<Subscription>,
    pending_actions: HashMap<String, PendingAction>,
    webhook_events: HashMap<String, LedgerEntry>,
}

/// In-memory store for tests and local development
///
/// A single lock guards all tables, so every trait method is atomic with
/// respect to every other.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a database error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection refused".to_string()));
        }
        Ok(())
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().await.subscriptions.clone()
    }

    pub async fn identities(&self) -> Vec<Identity> {
        self.inner.lock().await.identities.clone()
    }

    pub async fn pending_actions_for(&self, identifier: &str) -> Vec<PendingAction> {
        let inner = self.inner.lock().await;
        let mut actions: Vec<PendingAction> = inner
            .pending_actions
            .values()
            .filter(|a| a.identifier == identifier)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.created_at);
        actions
    }

    /// Ledger state of an event: `processing`, `success` or `error`
    pub async fn webhook_event_result(&self, event_id: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .webhook_events
            .get(event_id)
            .map(|e| e.result.clone())
    }

    /// Backdate a ledger entry to simulate a crashed worker
    pub async fn backdate_webhook_event(&self, event_id: &str, minutes: i64) {
        if let Some(entry) = self.inner.lock().await.webhook_events.get_mut(event_id) {
            entry.started_at -= time::Duration::minutes(minutes);
        }
    }
}

fn latest_for_email<'a>(subscriptions: &'a [Subscription], email: &str) -> Option<&'a Subscription> {
    subscriptions
        .iter()
        .rev()
        .find(|s| s.student_email == email)
}

fn build_identity(identity: NewIdentity) -> Identity {
    let now = OffsetDateTime::now_utc();
    Identity {
        id: Uuid::new_v4(),
        email: identity.email,
        name: identity.name,
        password_hash: identity.password_hash,
        email_verified_at: identity.email_verified_at,
        role: "student".to_string(),
        onboarded: false,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn find_identity_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.identities.iter().find(|i| i.email == email).cloned())
    }

    async fn create_identity(&self, identity: NewIdentity) -> StoreResult<Identity> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.identities.iter().any(|i| i.email == identity.email) {
            return Err(StoreError::Conflict(format!(
                "identity with email {} already exists",
                identity.email
            )));
        }
        let created = build_identity(identity);
        inner.identities.push(created.clone());
        Ok(created)
    }

    async fn set_password_hash(&self, email: &str, password_hash: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.identities.iter_mut().find(|i| i.email == email) {
            Some(identity) => {
                identity.password_hash = Some(password_hash.to_string());
                identity.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_email_verified(&self, email: &str, at: OffsetDateTime) -> StoreResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.identities.iter_mut().find(|i| i.email == email) {
            Some(identity) => {
                identity.email_verified_at = Some(at);
                identity.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> StoreResult<UpsertOutcome> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = inner
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id == upsert.stripe_subscription_id)
        {
            existing.status = SubscriptionStatus::Active.as_str().to_string();
            if upsert.stripe_customer_id.is_some() {
                existing.stripe_customer_id = upsert.stripe_customer_id;
            }
            existing.student_email = upsert.student_email;
            if upsert.user_id.is_some() {
                existing.user_id = upsert.user_id;
            }
            existing.updated_at = now;
            return Ok(UpsertOutcome {
                subscription: existing.clone(),
                created: false,
            });
        }

        let subscription = Subscription {
            id: Uuid::new_v4(),
            stripe_subscription_id: upsert.stripe_subscription_id,
            stripe_customer_id: upsert.stripe_customer_id,
            plan: upsert.plan,
            student_name: upsert.student_name,
            student_email: upsert.student_email,
            student_year: upsert.student_year,
            courses: upsert.courses,
            sessions_per_week: upsert.sessions_per_week,
            monthly_amount: upsert.monthly_amount,
            status: SubscriptionStatus::Active.as_str().to_string(),
            user_id: upsert.user_id,
            created_at: now,
            updated_at: now,
        };
        inner.subscriptions.push(subscription.clone());

        Ok(UpsertOutcome {
            subscription,
            created: true,
        })
    }

    async fn set_subscription_status(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<Option<Subscription>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .map(|s| {
                s.status = status.as_str().to_string();
                s.updated_at = OffsetDateTime::now_utc();
                s.clone()
            }))
    }

    async fn find_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .iter()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .cloned())
    }

    async fn latest_subscription_for_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<Subscription>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(latest_for_email(&inner.subscriptions, email).cloned())
    }

    async fn insert_pending_action(&self, action: &PendingAction) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.pending_actions.contains_key(&action.token) {
            return Err(StoreError::Conflict("duplicate token".to_string()));
        }
        inner
            .pending_actions
            .insert(action.token.clone(), action.clone());
        Ok(())
    }

    async fn find_pending_action(&self, token: &str) -> StoreResult<Option<PendingAction>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.pending_actions.get(token).cloned())
    }

    async fn insert_pending_action_unless_live(
        &self,
        action: &PendingAction,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.pending_actions.retain(|_, a| {
            !(a.identifier == action.identifier && a.kind == action.kind && a.is_expired_at(now))
        });
        let live = inner
            .pending_actions
            .values()
            .any(|a| a.identifier == action.identifier && a.kind == action.kind);
        if live {
            return Ok(false);
        }
        inner
            .pending_actions
            .insert(action.token.clone(), action.clone());
        Ok(true)
    }

    async fn take_pending_action(&self, token: &str) -> StoreResult<Option<PendingAction>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.pending_actions.remove(token))
    }

    async fn delete_pending_actions_for(
        &self,
        identifier: &str,
        kind: PendingActionKind,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let before = inner.pending_actions.len();
        inner
            .pending_actions
            .retain(|_, a| !(a.identifier == identifier && a.kind == kind));
        Ok((before - inner.pending_actions.len()) as u64)
    }

    async fn purge_expired_pending_actions(&self, now: OffsetDateTime) -> StoreResult<u64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let before = inner.pending_actions.len();
        inner.pending_actions.retain(|_, a| !a.is_expired_at(now));
        Ok((before - inner.pending_actions.len()) as u64)
    }

    async fn complete_account_setup(
        &self,
        setup: AccountSetup,
    ) -> StoreResult<AccountSetupOutcome> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let email = match inner.pending_actions.get(&setup.token) {
            Some(action) if action.kind == PendingActionKind::ProvisionAccount => {
                action.identifier.clone()
            }
            _ => return Ok(AccountSetupOutcome::TokenMissing),
        };

        if inner.identities.iter().any(|i| i.email == email) {
            return Ok(AccountSetupOutcome::AccountExists);
        }

        inner.pending_actions.remove(&setup.token);

        let name = latest_for_email(&inner.subscriptions, &email)
            .map(|s| s.student_name.clone())
            .unwrap_or_default();

        let identity = build_identity(NewIdentity {
            email: email.clone(),
            name,
            password_hash: Some(setup.password_hash),
            email_verified_at: Some(setup.verified_at),
        });
        inner.identities.push(identity.clone());

        let identity_id = identity.id;
        let linked_subscription = inner
            .subscriptions
            .iter_mut()
            .rev()
            .find(|s| s.student_email == email)
            .map(|s| {
                s.user_id = Some(identity_id);
                s.updated_at = OffsetDateTime::now_utc();
                s.id
            });

        Ok(AccountSetupOutcome::Created {
            identity,
            linked_subscription,
        })
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
    ) -> StoreResult<WebhookClaim> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();
        let stuck_before = now - time::Duration::minutes(i64::from(WEBHOOK_PROCESSING_TIMEOUT_MINUTES));

        if let Some(entry) = inner.webhook_events.get_mut(event_id) {
            let reclaimable = entry.result == "error"
                || (entry.result == "processing" && entry.started_at < stuck_before);
            if !reclaimable {
                return Ok(if entry.result == "success" {
                    WebhookClaim::AlreadyProcessed
                } else {
                    WebhookClaim::InFlight
                });
            }
            entry.result = "processing".to_string();
            entry.started_at = now;
            entry.error_message = None;
            return Ok(WebhookClaim::Claimed);
        }

        inner.webhook_events.insert(
            event_id.to_string(),
            LedgerEntry {
                event_type: event_type.to_string(),
                result: "processing".to_string(),
                started_at: now,
                error_message: None,
            },
        );
        Ok(WebhookClaim::Claimed)
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.webhook_events.get_mut(event_id) {
            entry.result = if error_message.is_some() {
                "error".to_string()
            } else {
                "success".to_string()
            };
            entry.error_message = error_message.map(str::to_string);
            tracing::debug!(
                event_id = %event_id,
                event_type = %entry.event_type,
                result = %entry.result,
                "Recorded webhook processing result"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn upsert(sub_id: &str, email: &str, name: &str) -> SubscriptionUpsert {
        SubscriptionUpsert {
            stripe_subscription_id: sub_id.to_string(),
            stripe_customer_id: Some("cus_1".to_string()),
            plan: "focus".to_string(),
            student_name: name.to_string(),
            student_email: email.to_string(),
            student_year: "Year 10".to_string(),
            courses: vec!["maths".to_string(), "physics".to_string()],
            sessions_per_week: Some(2),
            monthly_amount: Decimal::new(4000, 2),
            user_id: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_snapshot_and_link() {
        let store = MemoryStore::new();
        let first = store.upsert_subscription(upsert("sub_1", "a@x.com", "Ann")).await.unwrap();
        assert!(first.created);

        let user_id = Uuid::new_v4();
        let mut linked = upsert("sub_1", "a@x.com", "Renamed");
        linked.user_id = Some(user_id);
        let second = store.upsert_subscription(linked).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.subscription.user_id, Some(user_id));
        assert_eq!(second.subscription.student_name, "Ann");

        // An update without an identity never clears the link
        let third = store.upsert_subscription(upsert("sub_1", "a@x.com", "Ann")).await.unwrap();
        assert_eq!(third.subscription.user_id, Some(user_id));
        assert_eq!(store.subscriptions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_status_update_on_missing_record_creates_nothing() {
        let store = MemoryStore::new();
        let result = store
            .set_subscription_status("sub_missing", SubscriptionStatus::Canceled)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(store.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_reclaims_failed_and_stuck_events() {
        let store = MemoryStore::new();
        assert_eq!(
            store.claim_webhook_event("evt_1", "checkout.session.completed").await.unwrap(),
            WebhookClaim::Claimed
        );
        assert_eq!(
            store.claim_webhook_event("evt_1", "checkout.session.completed").await.unwrap(),
            WebhookClaim::InFlight
        );

        store.finish_webhook_event("evt_1", Some("boom")).await.unwrap();
        assert_eq!(
            store.claim_webhook_event("evt_1", "checkout.session.completed").await.unwrap(),
            WebhookClaim::Claimed
        );

        store.backdate_webhook_event("evt_1", 31).await;
        assert_eq!(
            store.claim_webhook_event("evt_1", "checkout.session.completed").await.unwrap(),
            WebhookClaim::Claimed
        );

        store.finish_webhook_event("evt_1", None).await.unwrap();
        assert_eq!(
            store.claim_webhook_event("evt_1", "checkout.session.completed").await.unwrap(),
            WebhookClaim::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_account_setup_rejects_wrong_kind() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        store
            .insert_pending_action(&PendingAction {
                token: "tok".to_string(),
                identifier: "a@x.com".to_string(),
                kind: PendingActionKind::ResetPassword,
                expires_at: now + time::Duration::hours(1),
                created_at: now,
            })
            .await
            .unwrap();

        let outcome = store
            .complete_account_setup(AccountSetup {
                token: "tok".to_string(),
                password_hash: "hash".to_string(),
                verified_at: now,
            })
            .await
            .unwrap();

        assert!(matches!(outcome, AccountSetupOutcome::TokenMissing));
        assert!(store.find_pending_action("tok").await.unwrap().is_some());
        assert!(store.identities().await.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.find_identity_by_email("a@x.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
