//! Session security checks: origin binding, identifier rotation,
//! concurrent-session ceiling and privilege escalation detection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::warn;
use uuid::Uuid;

use super::manager::{IssuedSession, SessionManager};
use super::models::Session;
use super::privilege::PrivilegeLevel;
use crate::error::{AuthError, SessionSecurityKind};
use crate::events::{EventRegistry, SecurityEvent, SecurityEventDetail};
use crate::utils::{generate_secret_token, hash_token, log_prefix};

pub struct SessionGuard {
    sessions: Arc<SessionManager>,
    events: Arc<EventRegistry>,
}

impl SessionGuard {
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>, events: Arc<EventRegistry>) -> Self {
        Self { sessions, events }
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Create a session and evict the principal's oldest sessions beyond the
    /// ceiling. If eviction fails the new session is revoked again.
    ///
    /// # Errors
    /// `DependencyUnavailable` when the store fails.
    pub async fn admit(
        &self,
        principal_id: Uuid,
        ip_address: &str,
        client_signature: &str,
        privilege: PrivilegeLevel,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession, AuthError> {
        let issued = self
            .sessions
            .create(principal_id, ip_address, client_signature, privilege, now)
            .await?;
        if let Err(err) = self.enforce_ceiling(principal_id, issued.session.id, now).await {
            let _ = self
                .sessions
                .store()
                .mark_revoked(issued.session.id, super::EndReason::Compensation, now)
                .await;
            return Err(err);
        }
        Ok(issued)
    }

    /// Evict the oldest sessions so that at most `ceiling` remain, `keep`
    /// included. Returns the number evicted.
    ///
    /// # Errors
    /// `DependencyUnavailable` when the store fails.
    pub async fn enforce_ceiling(&self, principal_id: Uuid, keep: Uuid, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let ceiling = self.sessions.config().ceiling();
        let evicted = self
            .sessions
            .store()
            .evict_oldest(principal_id, keep, ceiling, now)
            .await?;
        if !evicted.is_empty() {
            warn!(
                principal_id = %principal_id,
                evicted = evicted.len(),
                ceiling,
                "Concurrent session ceiling reached, oldest sessions evicted"
            );
            self.events
                .emit(SecurityEvent::new(
                    Some(principal_id),
                    now,
                    SecurityEventDetail::ConcurrentSessionEviction {
                        evicted: evicted.len(),
                        ceiling,
                    },
                ))
                .await;
        }
        Ok(evicted.len())
    }

    /// Validate a raw session token against the request origin and record
    /// activity on success.
    ///
    /// # Errors
    /// `Session(..)` for unknown or ended sessions, `SessionSecurity(HijackSuspected)`
    /// when the IP or client signature differs from the recorded one.
    pub async fn validate(
        &self,
        token: &str,
        ip_address: &str,
        client_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let session = self.sessions.resolve(token).await?;
        self.check_binding(session, ip_address, client_signature, now).await
    }

    /// Same as [`SessionGuard::validate`] for callers holding the session id
    /// (from an access or refresh token).
    ///
    /// # Errors
    /// See [`SessionGuard::validate`].
    pub async fn validate_id(
        &self,
        id: Uuid,
        ip_address: &str,
        client_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let session = self.sessions.get(id).await?;
        self.check_binding(session, ip_address, client_signature, now).await
    }

    /// Origin and liveness check for a session id without recording
    /// activity. Callers record activity once their own outcome is settled.
    ///
    /// # Errors
    /// See [`SessionGuard::validate`].
    pub async fn inspect_id(
        &self,
        id: Uuid,
        ip_address: &str,
        client_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let session = self.sessions.get(id).await?;
        self.check_origin(session, ip_address, client_signature, now).await
    }

    async fn check_binding(
        &self,
        session: Session,
        ip_address: &str,
        client_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let mut session = self.check_origin(session, ip_address, client_signature, now).await?;
        self.sessions.record_activity(&mut session, now).await?;
        Ok(session)
    }

    async fn check_origin(
        &self,
        session: Session,
        ip_address: &str,
        client_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        self.sessions.ensure_live(&session, now)?;
        if let Some(mismatch) = session.matches_origin(ip_address, client_signature) {
            warn!(
                session = %log_prefix(&session.token_hash),
                principal_id = %session.principal_id,
                mismatch = ?mismatch,
                "Session presented from a different origin"
            );
            self.events
                .emit(SecurityEvent::new(
                    Some(session.principal_id),
                    now,
                    SecurityEventDetail::HijackSuspected {
                        session: session.id.to_string(),
                        mismatch,
                        ip: super::models::normalize_ip(ip_address),
                    },
                ))
                .await;
            return Err(AuthError::SessionSecurity(SessionSecurityKind::HijackSuspected));
        }
        Ok(session)
    }

    /// Issue a new token for an existing session. Returns `None` (and
    /// records a fixation attempt) when the origin does not match, or when a
    /// concurrent rotation already replaced the token.
    ///
    /// # Errors
    /// `Session(..)` for unknown or ended sessions.
    pub async fn rotate(
        &self,
        old_token: &str,
        ip_address: &str,
        client_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SecretString>, AuthError> {
        let session = self.sessions.resolve(old_token).await?;
        self.sessions.ensure_live(&session, now)?;

        if session.matches_origin(ip_address, client_signature).is_some() {
            warn!(
                session = %log_prefix(&session.token_hash),
                principal_id = %session.principal_id,
                "Session rotation refused, origin mismatch"
            );
            self.events
                .emit(SecurityEvent::new(
                    Some(session.principal_id),
                    now,
                    SecurityEventDetail::FixationAttempt {
                        session: session.id.to_string(),
                        ip: super::models::normalize_ip(ip_address),
                    },
                ))
                .await;
            return Ok(None);
        }

        let token = generate_secret_token()?;
        let expires_at = self
            .sessions
            .config()
            .rearmed_expiry(session.created_at, now);
        let rotated = self
            .sessions
            .store()
            .rotate_token(session.id, &session.token_hash, &hash_token(&token), expires_at, now)
            .await?;
        if !rotated {
            warn!(session = %session.id, "Session rotation lost a race");
            return Ok(None);
        }
        Ok(Some(SecretString::from(token)))
    }

    /// True (and recorded) when `requested` outranks `current`.
    pub async fn detect_escalation(
        &self,
        principal_id: Option<Uuid>,
        session_id: Option<Uuid>,
        requested: PrivilegeLevel,
        current: PrivilegeLevel,
        now: DateTime<Utc>,
    ) -> bool {
        if requested.rank() <= current.rank() {
            return false;
        }
        warn!(
            principal_id = ?principal_id,
            current = %current,
            requested = %requested,
            "Privilege escalation attempt"
        );
        self.events
            .emit(SecurityEvent::new(
                principal_id,
                now,
                SecurityEventDetail::PrivilegeEscalation {
                    session: session_id.map(|id| id.to_string()),
                    current,
                    requested,
                },
            ))
            .await;
        true
    }

    /// Snapshot of the events recorded in this process.
    #[must_use]
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.events()
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard").finish_non_exhaustive()
    }
}
