//! Persistence boundary for refresh tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    /// The token's `jti`.
    pub id: String,
    pub principal_id: Uuid,
    pub session_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub device: Option<String>,
}

/// Result of an atomic rotation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Old record marked used and replacement stored.
    Rotated,
    /// The old record had already been consumed.
    AlreadyUsed,
    Revoked,
    Expired,
    NotFound,
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn create(&self, record: &RefreshTokenRecord) -> Result<(), StoreError>;

    async fn find_by_identifier(&self, id: &str) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Mark a live record used. Returns false if it was already used,
    /// revoked or unknown.
    async fn mark_used(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Mark `old_id` used and store `replacement` in one step. Nothing is
    /// written unless the outcome is `Rotated`.
    async fn rotate(
        &self,
        old_id: &str,
        replacement: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, StoreError>;

    async fn revoke(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn revoke_for_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn revoke_for_principal(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Remove records whose expiry has passed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
