//! Persistence-backed session lifecycle.
//!
//! Transitions are validated on the in-memory record first and then written
//! through the store, so the state machine rules live in one place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{EndReason, Session, SessionConfig, SessionStatus};
use super::privilege::PrivilegeLevel;
use super::repo::SessionStore;
use crate::error::{AuthError, SessionStateError, StoreError};
use crate::utils::{generate_secret_token, hash_token};

const CREATE_ATTEMPTS: usize = 3;

/// A freshly created session and the raw token for the client.
#[derive(Debug)]
pub struct IssuedSession {
    pub session: Session,
    pub token: SecretString,
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Create an `Active` session for a principal.
    ///
    /// # Errors
    /// Returns `DependencyUnavailable` if the store fails, or `Internal` if no
    /// unique token could be generated.
    pub async fn create(
        &self,
        principal_id: Uuid,
        ip_address: &str,
        client_signature: &str,
        privilege: PrivilegeLevel,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession, AuthError> {
        for _ in 0..CREATE_ATTEMPTS {
            let token = generate_secret_token()?;
            let session = Session::new(
                hash_token(&token),
                principal_id,
                ip_address,
                client_signature,
                privilege,
                now,
                &self.config,
            );
            match self.store.create(&session).await {
                Ok(()) => {
                    debug!(session = %session.id, principal_id = %principal_id, "Session created");
                    return Ok(IssuedSession {
                        session,
                        token: SecretString::from(token),
                    });
                }
                Err(StoreError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(AuthError::Internal(
            "failed to generate unique session token".to_string(),
        ))
    }

    /// Look a session up by the raw token the client presented.
    ///
    /// # Errors
    /// `Session(NotFound)` for unknown tokens.
    pub async fn resolve(&self, token: &str) -> Result<Session, AuthError> {
        self.store
            .find_by_token_hash(&hash_token(token))
            .await?
            .ok_or(AuthError::Session(SessionStateError::NotFound))
    }

    /// # Errors
    /// `Session(NotFound)` for unknown ids.
    pub async fn get(&self, id: Uuid) -> Result<Session, AuthError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(AuthError::Session(SessionStateError::NotFound))
    }

    /// Fail unless the session is `Active` or `Idle`.
    ///
    /// # Errors
    /// `Session(Revoked)` or `Session(Expired)`.
    pub fn ensure_live(&self, session: &Session, now: DateTime<Utc>) -> Result<SessionStatus, AuthError> {
        match session.status(now, &self.config) {
            SessionStatus::Revoked => Err(SessionStateError::Revoked.into()),
            SessionStatus::Expired => Err(SessionStateError::Expired.into()),
            status => Ok(status),
        }
    }

    /// # Errors
    /// Fails from a terminal state or when the store fails.
    pub async fn record_activity(&self, session: &mut Session, now: DateTime<Utc>) -> Result<(), AuthError> {
        session.record_activity(now, &self.config)?;
        self.store.touch(session.id, now).await?;
        Ok(())
    }

    /// # Errors
    /// Fails unless the session is `Active` or when the maximum age would be
    /// exceeded.
    pub async fn extend(&self, id: Uuid, hours: Option<i64>, now: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
        let mut session = self.get(id).await?;
        let expires_at = session.extend(hours, now, &self.config)?;
        self.store.update_expiry(id, expires_at).await?;
        info!(session = %id, expires_at = %expires_at, "Session extended");
        Ok(expires_at)
    }

    /// Revoke a single session. Returns false if it had already ended.
    ///
    /// # Errors
    /// `Session(NotFound)` or `DependencyUnavailable`.
    pub async fn revoke(&self, id: Uuid, reason: EndReason, now: DateTime<Utc>) -> Result<bool, AuthError> {
        let mut session = self.get(id).await?;
        if session.revoke(reason, now, &self.config).is_err() {
            return Ok(false);
        }
        let revoked = self.store.mark_revoked(id, reason, now).await?;
        if revoked {
            info!(session = %id, reason = %reason, "Session revoked");
        }
        Ok(revoked)
    }

    /// # Errors
    /// `DependencyUnavailable` when the store fails.
    pub async fn revoke_all(
        &self,
        principal_id: Uuid,
        keep: Option<Uuid>,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<u64, AuthError> {
        let revoked = self
            .store
            .revoke_all_for_principal(principal_id, keep, reason, now)
            .await?;
        info!(principal_id = %principal_id, revoked, reason = %reason, "Sessions revoked");
        Ok(revoked)
    }

    /// # Errors
    /// `Session(NotFound)` or `DependencyUnavailable`.
    pub async fn requires_reauthentication(
        &self,
        id: Uuid,
        sensitive_action: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        let session = self.get(id).await?;
        Ok(session.requires_reauthentication(sensitive_action, now, &self.config))
    }

    /// # Errors
    /// `DependencyUnavailable` when the store fails.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        Ok(self.store.delete_expired(now).await?)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
