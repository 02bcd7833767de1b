use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{EnrollmentStore, StoreError, StoreResult, WEBHOOK_PROCESSING_TIMEOUT_MINUTES};
use crate::models::{
    AccountSetup, AccountSetupOutcome, Identity, NewIdentity, PendingAction, Subscription,
    SubscriptionUpsert, UpsertOutcome, WebhookClaim,
};
use crate::types::{PendingActionKind, SubscriptionStatus};

const IDENTITY_COLUMNS: &str = "id, email, name, password_hash, email_verified_at, role, \
     onboarded, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, stripe_subscription_id, stripe_customer_id, plan, \
     student_name, student_email, student_year, courses, sessions_per_week, monthly_amount, \
     status, user_id, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct PendingActionRow {
    token: String,
    identifier: String,
    kind: String,
    expires_at: OffsetDateTime,
    created_at: OffsetDateTime,
}

impl TryFrom<PendingActionRow> for PendingAction {
    type Error = StoreError;

    fn try_from(row: PendingActionRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse::<PendingActionKind>()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(PendingAction {
            token: row.token,
            identifier: row.identifier,
            kind,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    subscription: Subscription,
    inserted: bool,
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnrollmentStore for PgStore {
    async fn find_identity_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        let identity = sqlx::query_as::<_, Identity>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(identity)
    }

    async fn create_identity(&self, identity: NewIdentity) -> StoreResult<Identity> {
        let created = sqlx::query_as::<_, Identity>(&format!(
            r#"
            INSERT INTO identities (email, name, password_hash, email_verified_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {IDENTITY_COLUMNS}
            "#
        ))
        .bind(&identity.email)
        .bind(&identity.name)
        .bind(&identity.password_hash)
        .bind(identity.email_verified_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn set_password_hash(&self, email: &str, password_hash: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE identities SET password_hash = $1, updated_at = NOW() WHERE email = $2",
        )
        .bind(password_hash)
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_email_verified(&self, email: &str, at: OffsetDateTime) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE identities SET email_verified_at = $1, updated_at = NOW() WHERE email = $2",
        )
        .bind(at)
        .bind(email)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> StoreResult<UpsertOutcome> {
        // xmax is zero only for a row this statement inserted
        let row = sqlx::query_as::<_, UpsertRow>(&format!(
            r#"
            INSERT INTO subscriptions (
                stripe_subscription_id, stripe_customer_id, plan, student_name,
                student_email, student_year, courses, sessions_per_week,
                monthly_amount, status, user_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'active', $10)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = 'active',
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                student_email = EXCLUDED.student_email,
                user_id = COALESCE(EXCLUDED.user_id, subscriptions.user_id),
                updated_at = NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}, (xmax = 0) AS inserted
            "#
        ))
        .bind(&upsert.stripe_subscription_id)
        .bind(&upsert.stripe_customer_id)
        .bind(&upsert.plan)
        .bind(&upsert.student_name)
        .bind(&upsert.student_email)
        .bind(&upsert.student_year)
        .bind(&upsert.courses)
        .bind(upsert.sessions_per_week)
        .bind(upsert.monthly_amount)
        .bind(upsert.user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            subscription: row.subscription,
            created: row.inserted,
        })
    }

    async fn set_subscription_status(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> StoreResult<Option<Subscription>> {
        let updated = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET status = $1, updated_at = NOW()
            WHERE stripe_subscription_id = $2
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated)
    }

    async fn find_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn latest_subscription_for_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE student_email = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn insert_pending_action(&self, action: &PendingAction) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_actions (token, identifier, kind, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&action.token)
        .bind(&action.identifier)
        .bind(action.kind.as_str())
        .bind(action.expires_at)
        .bind(action.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_pending_action(&self, token: &str) -> StoreResult<Option<PendingAction>> {
        let row = sqlx::query_as::<_, PendingActionRow>(
            r#"
            SELECT token, identifier, kind, expires_at, created_at
            FROM pending_actions
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingAction::try_from).transpose()
    }

    async fn insert_pending_action_unless_live(
        &self,
        action: &PendingAction,
        now: OffsetDateTime,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM pending_actions
            WHERE identifier = $1 AND kind = $2 AND expires_at <= $3
            "#,
        )
        .bind(&action.identifier)
        .bind(action.kind.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // The partial unique index on provisioning rows settles concurrent inserts
        let inserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO pending_actions (token, identifier, kind, expires_at, created_at)
            SELECT $1, $2, $3, $4, $5
            WHERE NOT EXISTS (
                SELECT 1 FROM pending_actions
                WHERE identifier = $2 AND kind = $3 AND expires_at > $6
            )
            ON CONFLICT DO NOTHING
            RETURNING token
            "#,
        )
        .bind(&action.token)
        .bind(&action.identifier)
        .bind(action.kind.as_str())
        .bind(action.expires_at)
        .bind(action.created_at)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.is_some())
    }

    async fn take_pending_action(&self, token: &str) -> StoreResult<Option<PendingAction>> {
        let row = sqlx::query_as::<_, PendingActionRow>(
            r#"
            DELETE FROM pending_actions
            WHERE token = $1
            RETURNING token, identifier, kind, expires_at, created_at
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingAction::try_from).transpose()
    }

    async fn delete_pending_actions_for(
        &self,
        identifier: &str,
        kind: PendingActionKind,
    ) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM pending_actions WHERE identifier = $1 AND kind = $2")
            .bind(identifier)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_expired_pending_actions(&self, now: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM pending_actions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn complete_account_setup(
        &self,
        setup: AccountSetup,
    ) -> StoreResult<AccountSetupOutcome> {
        let mut tx = self.pool.begin().await?;

        // Claiming the token first serialises concurrent redemptions on the row lock
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM pending_actions
            WHERE token = $1 AND kind = $2
            RETURNING identifier
            "#,
        )
        .bind(&setup.token)
        .bind(PendingActionKind::ProvisionAccount.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((email,)) = claimed else {
            tx.rollback().await?;
            return Ok(AccountSetupOutcome::TokenMissing);
        };

        let latest: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, student_name FROM subscriptions
            WHERE student_email = $1
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&email)
        .fetch_optional(&mut *tx)
        .await?;

        let name = latest
            .as_ref()
            .map(|(_, student_name)| student_name.clone())
            .unwrap_or_default();

        let identity = sqlx::query_as::<_, Identity>(&format!(
            r#"
            INSERT INTO identities (email, name, password_hash, email_verified_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            RETURNING {IDENTITY_COLUMNS}
            "#
        ))
        .bind(&email)
        .bind(&name)
        .bind(&setup.password_hash)
        .bind(setup.verified_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(identity) = identity else {
            // Leaves the token in place, matching a redemption that never ran
            tx.rollback().await?;
            return Ok(AccountSetupOutcome::AccountExists);
        };

        let linked_subscription = match latest {
            Some((subscription_id, _)) => {
                sqlx::query(
                    "UPDATE subscriptions SET user_id = $1, updated_at = NOW() WHERE id = $2",
                )
                .bind(identity.id)
                .bind(subscription_id)
                .execute(&mut *tx)
                .await?;
                Some(subscription_id)
            }
            None => None,
        };

        tx.commit().await?;

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
        // A row is returned only when this call inserted the event or reclaimed
        // one that failed or got stuck mid-processing.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $3))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(WebhookClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((status,)) if status == "success" => WebhookClaim::AlreadyProcessed,
            _ => WebhookClaim::InFlight,
        })
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let processing_result = if error_message.is_some() {
            "error"
        } else {
            "success"
        };

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
