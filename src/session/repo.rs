//! Persistence boundary for sessions.
//!
//! Every method must be atomic at the record level. Eviction in particular
//! must pick and revoke the victims in one step so two concurrent logins
//! cannot both keep a slot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{EndReason, Session};
use crate::error::StoreError;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with `StoreError::Conflict` when the token hash already exists.
    async fn create(&self, session: &Session) -> Result<(), StoreError>;

    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError>;

    /// Active, unexpired sessions of a principal, oldest first.
    async fn list_active_by_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError>;

    /// Returns false when the session was already ended.
    async fn mark_revoked(&self, id: Uuid, reason: EndReason, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Revoke every active session of a principal except `keep`.
    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        keep: Option<Uuid>,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Remove sessions whose expiry has passed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn update_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Swap the token hash if it still equals `old_hash`; re-arms expiry and
    /// activity. Returns false when another rotation won.
    async fn rotate_token(
        &self,
        id: Uuid,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Revoke the oldest active sessions of a principal (never `keep`) until
    /// at most `ceiling` remain including `keep`. Returns the evicted ids.
    async fn evict_oldest(
        &self,
        principal_id: Uuid,
        keep: Uuid,
        ceiling: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;
}
