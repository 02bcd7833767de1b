//! Single-use, expiring tokens for email verification, password reset and
//! account provisioning.

use rand::Rng;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::models::PendingAction;
use crate::store::{EnrollmentStore, StoreError};
use crate::types::PendingActionKind;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Invalid or expired token")]
    Invalid,

    #[error("Token has expired")]
    Expired,

    #[error("Account already exists with this email")]
    AccountExists,

    #[error("Password must be at least 8 characters")]
    WeakPassword,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 64 lowercase hex characters from 32 random bytes
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn new_action(identifier: &str, kind: PendingActionKind, now: OffsetDateTime) -> PendingAction {
    PendingAction {
        token: generate_token(),
        identifier: identifier.to_string(),
        kind,
        expires_at: now + kind.ttl(),
        created_at: now,
    }
}

/// Issues, inspects and consumes pending-action tokens
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn EnrollmentStore>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn EnrollmentStore>) -> Self {
        Self { store }
    }

    /// Issue a fresh token, replacing any outstanding token of the same kind
    /// for this identifier
    pub async fn issue(
        &self,
        identifier: &str,
        kind: PendingActionKind,
    ) -> Result<PendingAction, TokenError> {
        let replaced = self.store.delete_pending_actions_for(identifier, kind).await?;
        if replaced > 0 {
            tracing::debug!(kind = %kind, replaced, "Replaced outstanding tokens");
        }
        self.insert_new(identifier, kind).await
    }

    /// Issue a token only when no unexpired one of this kind is outstanding
    ///
    /// Returns `None` when an outstanding token already covers the identifier.
    /// The check and insert are one store operation, so concurrent callers
    /// issue a single token.
    pub async fn issue_if_none_outstanding(
        &self,
        identifier: &str,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, TokenError> {
        let action = new_action(identifier, kind, OffsetDateTime::now_utc());
        let inserted = self
            .store
            .insert_pending_action_unless_live(&action, action.created_at)
            .await?;
        Ok(inserted.then_some(action))
    }

    async fn insert_new(
        &self,
        identifier: &str,
        kind: PendingActionKind,
    ) -> Result<PendingAction, TokenError> {
        let action = new_action(identifier, kind, OffsetDateTime::now_utc());
        self.store.insert_pending_action(&action).await?;
        Ok(action)
    }

    /// Look up a token without consuming it
    ///
    /// A token of another kind is reported as invalid and left untouched.
    /// An expired token is deleted.
    pub async fn inspect(
        &self,
        token: &str,
        kind: PendingActionKind,
    ) -> Result<PendingAction, TokenError> {
        let action = match self.store.find_pending_action(token).await? {
            Some(action) if action.kind == kind => action,
            _ => return Err(TokenError::Invalid),
        };

        if action.is_expired_at(OffsetDateTime::now_utc()) {
            self.store.take_pending_action(token).await?;
            return Err(TokenError::Expired);
        }

        Ok(action)
    }

    /// Validate and remove a token in one step
    ///
    /// Of two concurrent callers only one receives the action; the other sees
    /// [`TokenError::Invalid`].
    pub async fn consume(
        &self,
        token: &str,
        kind: PendingActionKind,
    ) -> Result<PendingAction, TokenError> {
        self.inspect(token, kind).await?;
        self.store
            .take_pending_action(token)
            .await?
            .ok_or(TokenError::Invalid)
    }
}
