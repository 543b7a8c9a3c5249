//! Persistence boundary for principals and their one-time tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{NewPrincipal, OneTimePurpose, OneTimeToken, Principal};
use crate::error::StoreError;

/// All mutations are atomic at the record level; the lockout counter in
/// particular must be incremented without a read-modify-write race.
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    /// Lookup by normalized email.
    async fn find_by_identifier(&self, email: &str) -> Result<Option<Principal>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, StoreError>;

    /// Returns `None` if the email is already taken.
    async fn create(&self, new: NewPrincipal, now: DateTime<Utc>) -> Result<Option<Principal>, StoreError>;

    /// Increment the failed-attempt counter and return the new value. When a
    /// previous lock has already expired the counter restarts at 1 and the
    /// stale lock is cleared in the same step.
    async fn increment_failure_count(&self, id: Uuid, now: DateTime<Utc>) -> Result<u32, StoreError>;

    /// Zero the counter and clear any lock.
    async fn reset_failure_count(&self, id: Uuid) -> Result<(), StoreError>;

    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> Result<(), StoreError>;

    async fn update_password(&self, id: Uuid, credential_hash: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Stamp the login time and clear the counter and lock.
    async fn record_login(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn mark_verified(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Stores only hashes of verification and reset tokens.
#[async_trait]
pub trait OneTimeTokenStore: Send + Sync {
    async fn create(&self, token: &OneTimeToken) -> Result<(), StoreError>;

    /// Mark an unexpired, unconsumed token as consumed and return its owner.
    async fn consume(
        &self,
        token_hash: &str,
        purpose: OneTimePurpose,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Consume every outstanding token of a purpose for a principal.
    async fn invalidate_for_principal(
        &self,
        principal_id: Uuid,
        purpose: OneTimePurpose,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
