//! Session record and its computed state machine.
//!
//! Status is never stored: it is derived from the active flag, the expiry
//! and the last activity each time it is needed, so a session that crosses
//! its expiry becomes invalid on the very next check.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::privilege::PrivilegeLevel;
use crate::error::SessionStateError;

const MIN_SESSION_DURATION_MINUTES: i64 = 5;
const MAX_CLIENT_SIGNATURE_LEN: usize = 500;
const UNKNOWN_IP: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Expired,
    Revoked,
}

impl SessionStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session was ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Logout,
    LogoutAll,
    ConcurrencyLimit,
    PasswordChanged,
    SecurityResponse,
    Compensation,
    AdminRevoked,
}

impl EndReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::LogoutAll => "logout_all",
            Self::ConcurrencyLimit => "concurrency_limit",
            Self::PasswordChanged => "password_changed",
            Self::SecurityResponse => "security_response",
            Self::Compensation => "compensation",
            Self::AdminRevoked => "admin_revoked",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndReason {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "logout" => Ok(Self::Logout),
            "logout_all" => Ok(Self::LogoutAll),
            "concurrency_limit" => Ok(Self::ConcurrencyLimit),
            "password_changed" => Ok(Self::PasswordChanged),
            "security_response" => Ok(Self::SecurityResponse),
            "compensation" => Ok(Self::Compensation),
            "admin_revoked" => Ok(Self::AdminRevoked),
            other => Err(format!("unknown end reason: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    default_duration: Duration,
    max_age: Duration,
    idle_window: Duration,
    elevated_idle_window: Duration,
    sensitive_window: Duration,
    ceiling: usize,
}

impl SessionConfig {
    /// Defaults: 24h duration, 30 day maximum age, 30 min idle window,
    /// 5 min idle window for elevated sessions, 15 min window for sensitive
    /// actions and at most 5 concurrent sessions per principal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            default_duration: Duration::hours(24),
            max_age: Duration::days(30),
            idle_window: Duration::minutes(30),
            elevated_idle_window: Duration::minutes(5),
            sensitive_window: Duration::minutes(15),
            ceiling: 5,
        }
    }

    /// Durations below 5 minutes are raised to 5 minutes.
    #[must_use]
    pub fn with_default_duration(mut self, duration: Duration) -> Self {
        self.default_duration = duration.max(Duration::minutes(MIN_SESSION_DURATION_MINUTES));
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_idle_window(mut self, window: Duration) -> Self {
        self.idle_window = window;
        self
    }

    #[must_use]
    pub fn with_elevated_idle_window(mut self, window: Duration) -> Self {
        self.elevated_idle_window = window;
        self
    }

    #[must_use]
    pub fn with_sensitive_window(mut self, window: Duration) -> Self {
        self.sensitive_window = window;
        self
    }

    /// A ceiling of zero is treated as one.
    #[must_use]
    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling.max(1);
        self
    }

    #[must_use]
    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    #[must_use]
    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Expiry for a session (re)armed at `now`, capped at the absolute
    /// maximum age measured from `created_at`.
    #[must_use]
    pub fn rearmed_expiry(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        (now + self.default_duration).min(created_at + self.max_age)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Stable handle referenced by tokens; never derived from the secret.
    pub id: Uuid,
    /// SHA-256 of the session token; changes on rotation.
    pub token_hash: String,
    pub principal_id: Uuid,
    pub ip_address: String,
    pub client_signature: String,
    pub privilege: PrivilegeLevel,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl Session {
    #[must_use]
    pub fn new(
        token_hash: String,
        principal_id: Uuid,
        ip_address: &str,
        client_signature: &str,
        privilege: PrivilegeLevel,
        now: DateTime<Utc>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            token_hash,
            principal_id,
            ip_address: normalize_ip(ip_address),
            client_signature: normalize_client_signature(client_signature),
            privilege,
            created_at: now,
            last_activity_at: now,
            expires_at: config.rearmed_expiry(now, now),
            is_active: true,
            ended_at: None,
            end_reason: None,
        }
    }

    #[must_use]
    pub fn status(&self, now: DateTime<Utc>, config: &SessionConfig) -> SessionStatus {
        if !self.is_active {
            SessionStatus::Revoked
        } else if now > self.expires_at {
            SessionStatus::Expired
        } else if now - self.last_activity_at > config.idle_window {
            SessionStatus::Idle
        } else {
            SessionStatus::Active
        }
    }

    /// # Errors
    /// Fails from a terminal state.
    pub fn record_activity(&mut self, now: DateTime<Utc>, config: &SessionConfig) -> Result<(), SessionStateError> {
        let status = self.status(now, config);
        if status.is_terminal() {
            return Err(SessionStateError::InvalidTransition {
                from: status,
                operation: "record activity on",
            });
        }
        self.last_activity_at = self.last_activity_at.max(now);
        Ok(())
    }

    /// Push expiry to `now + hours` (default duration when `None`).
    ///
    /// # Errors
    /// Fails unless the session is `Active`, for a non-positive `hours`, or
    /// if the new expiry would pass the absolute maximum age.
    pub fn extend(
        &mut self,
        hours: Option<i64>,
        now: DateTime<Utc>,
        config: &SessionConfig,
    ) -> Result<DateTime<Utc>, SessionStateError> {
        let status = self.status(now, config);
        if status != SessionStatus::Active {
            return Err(SessionStateError::InvalidTransition {
                from: status,
                operation: "extend",
            });
        }
        let extension = match hours {
            None => config.default_duration,
            Some(hours) if hours <= 0 => return Err(SessionStateError::InvalidExtension),
            Some(hours) => Duration::try_hours(hours).ok_or(SessionStateError::ExceedsMaxAge)?,
        };
        let new_expiry = now
            .checked_add_signed(extension)
            .ok_or(SessionStateError::ExceedsMaxAge)?;
        if new_expiry > self.created_at + config.max_age {
            return Err(SessionStateError::ExceedsMaxAge);
        }
        if new_expiry <= self.created_at {
            return Err(SessionStateError::InvalidTransition {
                from: status,
                operation: "shorten",
            });
        }
        self.expires_at = new_expiry;
        Ok(new_expiry)
    }

    /// # Errors
    /// Fails from a terminal state.
    pub fn revoke(
        &mut self,
        reason: EndReason,
        now: DateTime<Utc>,
        config: &SessionConfig,
    ) -> Result<(), SessionStateError> {
        let status = self.status(now, config);
        if status.is_terminal() {
            return Err(SessionStateError::InvalidTransition {
                from: status,
                operation: "revoke",
            });
        }
        self.is_active = false;
        self.ended_at = Some(now);
        self.end_reason = Some(reason);
        Ok(())
    }

    #[must_use]
    pub fn requires_reauthentication(&self, sensitive_action: bool, now: DateTime<Utc>, config: &SessionConfig) -> bool {
        if self.status(now, config) != SessionStatus::Active {
            return true;
        }
        if sensitive_action {
            return now - self.created_at > config.sensitive_window;
        }
        if self.privilege.is_elevated() {
            return now - self.last_activity_at > config.elevated_idle_window;
        }
        false
    }

    /// Zero unless the session is `Active`.
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Utc>, config: &SessionConfig) -> Duration {
        if self.status(now, config) == SessionStatus::Active {
            self.expires_at - now
        } else {
            Duration::zero()
        }
    }

    #[must_use]
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.ended_at.unwrap_or(now) - self.created_at
    }

    /// True once `threshold` (0..1) of the session lifetime has elapsed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn should_refresh(&self, threshold: f64, now: DateTime<Utc>, config: &SessionConfig) -> bool {
        if self.status(now, config) != SessionStatus::Active {
            return false;
        }
        let total = (self.expires_at - self.created_at).num_seconds();
        if total <= 0 {
            return false;
        }
        let elapsed = (now - self.created_at).num_seconds();
        elapsed as f64 / total as f64 >= threshold
    }

    #[must_use]
    pub fn matches_origin(&self, ip_address: &str, client_signature: &str) -> Option<crate::events::BindingMismatch> {
        use crate::events::BindingMismatch;

        let ip_matches = self.ip_address == normalize_ip(ip_address);
        let signature_matches = self.client_signature == normalize_client_signature(client_signature);
        match (ip_matches, signature_matches) {
            (true, true) => None,
            (false, true) => Some(BindingMismatch::Ip),
            (true, false) => Some(BindingMismatch::ClientSignature),
            (false, false) => Some(BindingMismatch::Both),
        }
    }
}

pub(crate) fn normalize_ip(ip: &str) -> String {
    let trimmed = ip.trim();
    if trimmed.is_empty() {
        UNKNOWN_IP.to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn normalize_client_signature(signature: &str) -> String {
    signature.chars().take(MAX_CLIENT_SIGNATURE_LEN).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::BindingMismatch;

    fn session(now: DateTime<Utc>, config: &SessionConfig) -> Session {
        Session::new(
            "hash".to_string(),
            Uuid::new_v4(),
            "203.0.113.7",
            "agent/1.0",
            PrivilegeLevel::User,
            now,
            config,
        )
    }

    #[test]
    fn new_session_is_active_with_default_expiry() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let session = session(now, &config);
        assert_eq!(session.status(now, &config), SessionStatus::Active);
        assert_eq!(session.expires_at, now + Duration::hours(24));
        assert!(session.expires_at > session.created_at);
    }

    #[test]
    fn status_is_computed_from_time() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let session = session(now, &config);
        assert_eq!(session.status(now + Duration::minutes(31), &config), SessionStatus::Idle);
        assert_eq!(session.status(now + Duration::hours(25), &config), SessionStatus::Expired);
    }

    #[test]
    fn activity_brings_idle_back_to_active() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let mut session = session(now, &config);
        let later = now + Duration::minutes(45);
        assert_eq!(session.status(later, &config), SessionStatus::Idle);
        session.record_activity(later, &config).unwrap();
        assert_eq!(session.status(later, &config), SessionStatus::Active);
    }

    #[test]
    fn extend_is_capped_at_max_age() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let mut session = session(now, &config);
        let new_expiry = session.extend(Some(48), now, &config).unwrap();
        assert_eq!(new_expiry, now + Duration::hours(48));

        let late = now + Duration::days(29) + Duration::hours(23);
        session.record_activity(late, &config).unwrap_err();
        session.expires_at = now + Duration::days(30);
        session.last_activity_at = late;
        assert_eq!(
            session.extend(Some(2), late, &config),
            Err(SessionStateError::ExceedsMaxAge)
        );
        assert!(session.expires_at <= session.created_at + config.max_age());
    }

    #[test]
    fn extend_rejects_non_positive_and_huge_hours() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let mut session = session(now, &config);
        let before = session.expires_at;
        let later = now + Duration::hours(3);
        session.last_activity_at = later;

        assert_eq!(
            session.extend(Some(-2), later, &config),
            Err(SessionStateError::InvalidExtension)
        );
        assert_eq!(
            session.extend(Some(0), later, &config),
            Err(SessionStateError::InvalidExtension)
        );
        assert_eq!(
            session.extend(Some(i64::MAX), later, &config),
            Err(SessionStateError::ExceedsMaxAge)
        );
        assert_eq!(
            session.extend(Some(i64::MAX / 3600), later, &config),
            Err(SessionStateError::ExceedsMaxAge)
        );
        assert_eq!(session.expires_at, before);
    }

    #[test]
    fn extend_requires_active_state() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let mut session = session(now, &config);
        let idle = now + Duration::hours(1);
        assert!(matches!(
            session.extend(None, idle, &config),
            Err(SessionStateError::InvalidTransition {
                from: SessionStatus::Idle,
                ..
            })
        ));
    }

    #[test]
    fn revoke_is_terminal() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let mut session = session(now, &config);
        session.revoke(EndReason::Logout, now, &config).unwrap();
        assert!(!session.is_active);
        assert_eq!(session.ended_at, Some(now));
        assert_eq!(session.status(now, &config), SessionStatus::Revoked);
        assert!(session.revoke(EndReason::Logout, now, &config).is_err());
        assert!(session.record_activity(now, &config).is_err());
    }

    #[test]
    fn reauthentication_policy() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let mut session = session(now, &config);
        assert!(!session.requires_reauthentication(false, now, &config));
        assert!(!session.requires_reauthentication(true, now + Duration::minutes(10), &config));
        assert!(session.requires_reauthentication(true, now + Duration::minutes(16), &config));

        session.privilege = PrivilegeLevel::Admin;
        assert!(session.requires_reauthentication(false, now + Duration::minutes(6), &config));
        assert!(!session.requires_reauthentication(false, now + Duration::minutes(4), &config));
        assert!(session.requires_reauthentication(false, now + Duration::hours(25), &config));
    }

    #[test]
    fn origin_is_normalized_before_comparison() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let mut session = session(now, &config);
        assert_eq!(session.matches_origin("203.0.113.7", "agent/1.0"), None);
        assert_eq!(
            session.matches_origin("198.51.100.1", "agent/1.0"),
            Some(BindingMismatch::Ip)
        );
        assert_eq!(
            session.matches_origin("198.51.100.1", "other"),
            Some(BindingMismatch::Both)
        );

        session.ip_address = normalize_ip("  ");
        assert_eq!(session.ip_address, "unknown");
        assert_eq!(session.matches_origin("", "agent/1.0"), None);
    }

    #[test]
    fn long_client_signatures_are_truncated() {
        let long = "x".repeat(900);
        assert_eq!(normalize_client_signature(&long).len(), 500);
    }

    #[test]
    fn refresh_threshold_and_remaining_time() {
        let config = SessionConfig::new();
        let now = Utc::now();
        let session = session(now, &config);
        let later = now + Duration::hours(19);
        assert!(!session.should_refresh(0.75, later, &config));
        let mut touched = session.clone();
        touched.last_activity_at = later;
        assert!(touched.should_refresh(0.75, later, &config));
        assert_eq!(touched.time_remaining(later, &config), Duration::hours(5));
        assert_eq!(session.duration(later), Duration::hours(19));
    }

    #[test]
    fn min_duration_is_enforced() {
        let config = SessionConfig::new().with_default_duration(Duration::seconds(10));
        assert_eq!(config.default_duration(), Duration::minutes(5));
    }
}
