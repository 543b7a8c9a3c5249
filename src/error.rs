//! Error taxonomy shared by every flow.
//!
//! [`AuthError`] is what callers of the library see. [`AuthError::denial`]
//! produces the opaque view that may be shown to an end user: everything
//! security shaped collapses to `access_denied` and the detail only reaches
//! the event sinks and the logs.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::rate_limit::Tier;
use crate::session::SessionStatus;

/// Why an account whose secret verified still cannot sign in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotUsableReason {
    Unverified,
    Deactivated,
    Disabled,
}

impl NotUsableReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Deactivated => "deactivated",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for NotUsableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenErrorKind {
    Invalid,
    Expired,
    Reused,
}

impl fmt::Display for TokenErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Reused => "reused",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSecurityKind {
    FixationRejected,
    HijackSuspected,
    EscalationDetected,
}

impl fmt::Display for SessionSecurityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FixationRejected => "fixation rejected",
            Self::HijackSuspected => "hijack suspected",
            Self::EscalationDetected => "escalation detected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionStateError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("session revoked")]
    Revoked,
    #[error("cannot {operation} a session in state {from}")]
    InvalidTransition {
        from: SessionStatus,
        operation: &'static str,
    },
    #[error("extension beyond maximum session age")]
    ExceedsMaxAge,
    #[error("extension must be a positive number of hours")]
    InvalidExtension,
}

/// Field-level validation feedback. Safe to show to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: &'static str,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    Authentication,
    #[error("account locked, retry after {retry_after_seconds}s")]
    AccountLocked { retry_after_seconds: u64 },
    #[error("account not usable: {0}")]
    AccountNotUsable(NotUsableReason),
    #[error("token {0}")]
    Token(TokenErrorKind),
    #[error("session security: {0}")]
    SessionSecurity(SessionSecurityKind),
    #[error(transparent)]
    Session(#[from] SessionStateError),
    #[error("rate limit exceeded for {tier} tier, retry after {retry_after_seconds}s")]
    RateLimitExceeded {
        retry_after_seconds: u64,
        tier: Tier,
        blacklisted: bool,
    },
    #[error("validation failed")]
    Validation(Vec<FieldViolation>),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures reported by storage and delivery collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("invalid stored value: {0}")]
    Decode(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Caller-facing rendition of an [`AuthError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub code: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldViolation>,
}

impl Denial {
    const fn new(code: &'static str, message: &'static str) -> Self {
        Self {
            code,
            message,
            retry_after_seconds: None,
            fields: Vec::new(),
        }
    }
}

impl AuthError {
    /// True for errors whose detail must not reach the caller.
    #[must_use]
    pub const fn is_security(&self) -> bool {
        matches!(
            self,
            Self::AccountLocked { .. } | Self::SessionSecurity(_) | Self::Token(TokenErrorKind::Reused)
        )
    }

    #[must_use]
    pub fn denial(&self) -> Denial {
        match self {
            Self::Authentication => Denial::new("invalid_credentials", "Invalid credentials"),
            Self::AccountLocked { .. }
            | Self::SessionSecurity(_)
            | Self::Token(TokenErrorKind::Reused) => Denial::new("access_denied", "Access denied"),
            Self::AccountNotUsable(_) => Denial::new("account_unavailable", "Account is not available"),
            Self::Token(_) => Denial::new("invalid_token", "Token is invalid or expired"),
            Self::Session(_) => Denial::new("invalid_session", "Session is no longer valid"),
            Self::RateLimitExceeded {
                retry_after_seconds,
                blacklisted,
                ..
            } => {
                let base = if *blacklisted {
                    Denial::new(
                        "access_restricted",
                        "Access temporarily restricted due to security policy violations",
                    )
                } else {
                    Denial::new("rate_limited", "Too many requests")
                };
                Denial {
                    retry_after_seconds: Some(*retry_after_seconds),
                    ..base
                }
            }
            Self::Validation(fields) => Denial {
                fields: fields.clone(),
                ..Denial::new("validation_failed", "Validation failed")
            },
            Self::Configuration(_) | Self::DependencyUnavailable(_) | Self::Internal(_) => {
                Denial::new("unavailable", "Service temporarily unavailable")
            }
        }
    }
}
