//! Password credential verification with account lockout.
//!
//! Unknown identifiers and wrong secrets collapse into the same
//! `AuthError::Authentication` and cost the same Argon2 work. Account status
//! is only revealed once the secret has verified.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::{debug, warn};

use super::models::{LockoutPolicy, Principal};
use super::repo::PrincipalStore;
use crate::credential::CredentialHasher;
use crate::error::AuthError;
use crate::events::{EventRegistry, SecurityEvent, SecurityEventDetail};
use crate::utils::{normalize_email, valid_email};

pub struct CredentialVerifier {
    store: Arc<dyn PrincipalStore>,
    hasher: CredentialHasher,
    lockout: LockoutPolicy,
    events: Arc<EventRegistry>,
}

impl CredentialVerifier {
    #[must_use]
    pub fn new(
        store: Arc<dyn PrincipalStore>,
        hasher: CredentialHasher,
        lockout: LockoutPolicy,
        events: Arc<EventRegistry>,
    ) -> Self {
        Self {
            store,
            hasher,
            lockout,
            events,
        }
    }

    #[must_use]
    pub fn lockout(&self) -> &LockoutPolicy {
        &self.lockout
    }

    /// Verify an identifier/secret pair.
    ///
    /// A wrong secret increments the failure counter and locks the account
    /// once the threshold is reached. Success does not touch the record;
    /// callers commit it with [`CredentialVerifier::record_success`] once the
    /// rest of their flow has succeeded.
    ///
    /// # Errors
    /// - `Authentication` for unknown identifiers, wrong secrets and
    ///   accounts without a credential.
    /// - `AccountLocked` while a lock is in force.
    /// - `AccountNotUsable` when the secret verified but the account is
    ///   disabled, deactivated or unverified.
    /// - `DependencyUnavailable` when the store fails.
    pub async fn authenticate(
        &self,
        identifier: &str,
        secret: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<Principal, AuthError> {
        let email = normalize_email(identifier);
        let principal = if valid_email(&email) {
            self.store.find_by_identifier(&email).await?
        } else {
            None
        };

        let Some(principal) = principal else {
            self.hasher.verify_dummy(secret).await;
            return Err(AuthError::Authentication);
        };

        if let Some(retry_after_seconds) = principal.lock_remaining_seconds(now) {
            debug!(principal_id = %principal.id, "Authentication attempt on locked account");
            return Err(AuthError::AccountLocked { retry_after_seconds });
        }

        let Some(stored_hash) = principal.credential_hash.as_deref() else {
            self.hasher.verify_dummy(secret).await;
            return Err(AuthError::Authentication);
        };

        if !self.hasher.verify(secret, stored_hash).await? {
            self.register_failure(&principal, now).await?;
            return Err(AuthError::Authentication);
        }

        principal.usability().map_err(AuthError::AccountNotUsable)?;
        Ok(principal)
    }

    /// Check a secret for an already loaded principal (re-authentication
    /// before sensitive changes). Does not touch the lockout counter.
    ///
    /// # Errors
    /// `Internal` if the stored hash is malformed.
    pub async fn verify_secret(&self, principal: &Principal, secret: &SecretString) -> Result<bool, AuthError> {
        match principal.credential_hash.as_deref() {
            Some(stored_hash) => self.hasher.verify(secret, stored_hash).await,
            None => {
                self.hasher.verify_dummy(secret).await;
                Ok(false)
            }
        }
    }

    /// Reset the counter, clear the lock and stamp the login time.
    ///
    /// # Errors
    /// `DependencyUnavailable` when the store fails.
    pub async fn record_success(&self, principal: &Principal, now: DateTime<Utc>) -> Result<(), AuthError> {
        self.store.record_login(principal.id, now).await?;
        Ok(())
    }

    async fn register_failure(&self, principal: &Principal, now: DateTime<Utc>) -> Result<(), AuthError> {
        let failed_attempts = self.store.increment_failure_count(principal.id, now).await?;
        debug!(principal_id = %principal.id, failed_attempts, "Authentication failed");

        if let Some(locked_until) = self.lockout.lock_deadline(failed_attempts, now) {
            self.store.lock_until(principal.id, locked_until).await?;
            warn!(
                principal_id = %principal.id,
                failed_attempts,
                locked_until = %locked_until,
                "Account locked after repeated failures"
            );
            self.events
                .emit(SecurityEvent::new(
                    Some(principal.id),
                    now,
                    SecurityEventDetail::AccountLocked {
                        failed_attempts,
                        locked_until,
                    },
                ))
                .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("lockout", &self.lockout)
            .finish_non_exhaustive()
    }
}
