use chrono::Duration;
use secrecy::SecretString;
use serde::Serialize;
use uuid::Uuid;

use crate::principal::{LockoutPolicy, PrincipalSummary};
use crate::token::TokenPair;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    lockout: LockoutPolicy,
    reset_token_ttl: Duration,
    verification_token_ttl: Duration,
}

impl AuthConfig {
    /// Defaults: lock after 5 failures for 30 minutes, reset links valid for
    /// one hour, verification links for 24 hours.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lockout: LockoutPolicy::new(),
            reset_token_ttl: Duration::hours(1),
            verification_token_ttl: Duration::hours(24),
        }
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: LockoutPolicy) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl(mut self, ttl: Duration) -> Self {
        self.reset_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_verification_token_ttl(mut self, ttl: Duration) -> Self {
        self.verification_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn lockout(&self) -> LockoutPolicy {
        self.lockout
    }

    #[must_use]
    pub fn reset_token_ttl(&self) -> Duration {
        self.reset_token_ttl
    }

    #[must_use]
    pub fn verification_token_ttl(&self) -> Duration {
        self.verification_token_ttl
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub identifier: String,
    pub secret: SecretString,
    pub ip_address: String,
    pub client_signature: String,
    pub device: Option<String>,
}

impl LoginRequest {
    #[must_use]
    pub fn new(
        identifier: impl Into<String>,
        secret: SecretString,
        ip_address: impl Into<String>,
        client_signature: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            secret,
            ip_address: ip_address.into(),
            client_signature: client_signature.into(),
            device: None,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }
}

#[derive(Debug)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    /// Raw session token; only its hash is stored.
    pub session_token: SecretString,
    pub session_id: Uuid,
    pub principal: PrincipalSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutScope {
    ThisSession,
    AllSessions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogoutOutcome {
    pub sessions_revoked: u64,
    pub refresh_tokens_revoked: u64,
}

/// Returned for every registration attempt, whether or not an account was
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrationReceipt {
    pub message: &'static str,
}

impl RegistrationReceipt {
    pub(crate) const UNIFORM: Self = Self {
        message: "If the address can be registered, a verification message is on its way.",
    };
}

/// Returned for every reset request, whether or not the address is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PasswordResetReceipt {
    pub message: &'static str,
}

impl PasswordResetReceipt {
    pub(crate) const UNIFORM: Self = Self {
        message: "If an account exists for this address, a reset link has been sent.",
    };
}
