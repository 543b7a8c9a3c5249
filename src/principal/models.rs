//! Principal (account) record and lockout rules.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::NotUsableReason;
use crate::permission::PermissionCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    /// `None` for delegated-only accounts, which cannot sign in with a secret.
    pub credential_hash: Option<String>,
    pub is_active: bool,
    pub is_verified: bool,
    pub is_superuser: bool,
    pub is_disabled: bool,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub role_ids: Vec<Uuid>,
    pub direct_permissions: Vec<PermissionCode>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Principal {
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Whole seconds until the lock lifts, rounded up.
    #[must_use]
    pub fn lock_remaining_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| {
                let millis = (until - now).num_milliseconds();
                u64::try_from((millis + 999) / 1000).unwrap_or(0)
            })
    }

    /// Checked in order: disabled, deactivated, unverified.
    ///
    /// # Errors
    /// Returns the first reason the account cannot be used.
    pub fn usability(&self) -> Result<(), NotUsableReason> {
        if self.is_disabled {
            Err(NotUsableReason::Disabled)
        } else if !self.is_active {
            Err(NotUsableReason::Deactivated)
        } else if !self.is_verified {
            Err(NotUsableReason::Unverified)
        } else {
            Ok(())
        }
    }

    /// Only active, enabled and unlocked accounts may receive reset links.
    #[must_use]
    pub fn can_reset_password(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_disabled && !self.is_locked(now)
    }
}

/// Caller-facing projection of a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrincipalSummary {
    pub id: Uuid,
    pub email: String,
    pub is_verified: bool,
    pub is_superuser: bool,
    pub roles: Vec<String>,
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub email: String,
    pub credential_hash: Option<String>,
    pub is_verified: bool,
    pub role_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    threshold: u32,
    duration: Duration,
}

impl LockoutPolicy {
    /// Five failures lock the account for 30 minutes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            threshold: 5,
            duration: Duration::minutes(30),
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Lock deadline once `failed_attempts` reaches the threshold.
    #[must_use]
    pub fn lock_deadline(&self, failed_attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (failed_attempts >= self.threshold).then(|| now + self.duration)
    }
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Purpose of a single-use token sent out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OneTimePurpose {
    EmailVerification,
    PasswordReset,
}

impl OneTimePurpose {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmailVerification => "email_verification",
            Self::PasswordReset => "password_reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimeToken {
    pub token_hash: String,
    pub principal_id: Uuid,
    pub purpose: OneTimePurpose,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
pub(crate) fn test_principal(email: &str, now: DateTime<Utc>) -> Principal {
    Principal {
        id: Uuid::new_v4(),
        email: email.to_string(),
        credential_hash: None,
        is_active: true,
        is_verified: true,
        is_superuser: false,
        is_disabled: false,
        failed_attempts: 0,
        locked_until: None,
        role_ids: Vec::new(),
        direct_permissions: Vec::new(),
        last_login_at: None,
        created_at: now,
        updated_at: now,
    }
}
