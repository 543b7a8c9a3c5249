//! End-to-end authentication flows.
//!
//! [`AuthService`] is the only component that reads the clock. Each flow
//! composes the credential, session, token and rate-limit services and
//! undoes what it already persisted when a later step fails.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{
    AuthConfig, LoginOutcome, LoginRequest, LogoutOutcome, LogoutScope, PasswordResetReceipt,
    RegistrationReceipt,
};
use super::{AuthStores, SecurityAlertSink};
use crate::clock::{Clock, SystemClock};
use crate::credential::{CredentialHasher, CredentialPolicy};
use crate::error::{AuthError, FieldViolation, SessionSecurityKind, SessionStateError, TokenErrorKind};
use crate::events::{EventRegistry, EventSink, SecurityEvent, TracingEventSink};
use crate::notify::{LogNotifier, Notification, NotificationDispatcher, Notifier};
use crate::permission::{Authorizer, Grant};
use crate::principal::{
    CredentialVerifier, NewPrincipal, OneTimePurpose, OneTimeToken, OneTimeTokenStore, Principal,
    PrincipalStore, PrincipalSummary,
};
use crate::rate_limit::{EndpointCategory, NoopRateLimiter, RateLimiter, Tier};
use crate::session::{normalize_ip, EndReason, PrivilegeLevel, SessionConfig, SessionGuard, SessionManager};
use crate::token::{AccessClaims, TokenConfig, TokenIssuer, TokenPair, TokenSigner};
use crate::utils::{generate_secret_token, hash_token, normalize_email, valid_email};

pub struct AuthServiceBuilder {
    stores: AuthStores,
    signer: TokenSigner,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    session_config: SessionConfig,
    token_config: TokenConfig,
    policy: CredentialPolicy,
    hasher: Option<CredentialHasher>,
    rate_limiter: Arc<dyn RateLimiter>,
    notifier: Arc<dyn Notifier>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl AuthServiceBuilder {
    #[must_use]
    pub fn new(stores: AuthStores, signer: TokenSigner) -> Self {
        Self {
            stores,
            signer,
            clock: Arc::new(SystemClock),
            config: AuthConfig::new(),
            session_config: SessionConfig::new(),
            token_config: TokenConfig::new(),
            policy: CredentialPolicy::new(),
            hasher: None,
            rate_limiter: Arc::new(NoopRateLimiter),
            notifier: Arc::new(LogNotifier),
            sinks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: AuthConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    #[must_use]
    pub fn with_token_config(mut self, config: TokenConfig) -> Self {
        self.token_config = config;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: CredentialPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: CredentialHasher) -> Self {
        self.hasher = Some(hasher);
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Extra sink next to the log sink and the alert sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// # Errors
    /// `Internal` when the default hasher cannot be constructed.
    pub fn build(self) -> Result<AuthService, AuthError> {
        let hasher = match self.hasher {
            Some(hasher) => hasher,
            None => CredentialHasher::new(None)?,
        };
        let notifications = NotificationDispatcher::new(self.notifier);

        let mut registry = EventRegistry::new()
            .with_sink(Arc::new(TracingEventSink))
            .with_sink(Arc::new(SecurityAlertSink::new(
                Arc::clone(&self.stores.principals),
                notifications.clone(),
            )));
        for sink in self.sinks {
            registry = registry.with_sink(sink);
        }
        let events = Arc::new(registry);

        let verifier = CredentialVerifier::new(
            Arc::clone(&self.stores.principals),
            hasher.clone(),
            self.config.lockout(),
            Arc::clone(&events),
        );
        let authorizer = Authorizer::new(Arc::clone(&self.stores.principals), Arc::clone(&self.stores.roles));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&self.stores.sessions),
            self.session_config,
        ));
        let guard = SessionGuard::new(sessions, Arc::clone(&events));
        let tokens = TokenIssuer::new(
            self.token_config,
            self.signer,
            Arc::clone(&self.stores.refresh_tokens),
            Arc::clone(&events),
        );

        Ok(AuthService {
            clock: self.clock,
            config: self.config,
            principals: self.stores.principals,
            one_time_tokens: self.stores.one_time_tokens,
            verifier,
            hasher,
            policy: self.policy,
            authorizer,
            tokens,
            guard,
            rate_limiter: self.rate_limiter,
            notifications,
            events,
        })
    }
}

pub struct AuthService {
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    principals: Arc<dyn PrincipalStore>,
    one_time_tokens: Arc<dyn OneTimeTokenStore>,
    verifier: CredentialVerifier,
    hasher: CredentialHasher,
    policy: CredentialPolicy,
    authorizer: Authorizer,
    tokens: TokenIssuer,
    guard: SessionGuard,
    rate_limiter: Arc<dyn RateLimiter>,
    notifications: NotificationDispatcher,
    events: Arc<EventRegistry>,
}

fn summary(principal: &Principal, grant: &Grant, last_login_at: Option<DateTime<Utc>>) -> PrincipalSummary {
    PrincipalSummary {
        id: principal.id,
        email: principal.email.clone(),
        is_verified: principal.is_verified,
        is_superuser: principal.is_superuser,
        roles: grant.roles.clone(),
        last_login_at,
    }
}

impl AuthService {
    #[must_use]
    pub fn builder(stores: AuthStores, signer: TokenSigner) -> AuthServiceBuilder {
        AuthServiceBuilder::new(stores, signer)
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.guard.sessions()
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// Events recorded in this process, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.events()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Verify credentials, open a session and mint a token pair.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `Authentication`, `AccountLocked`,
    /// `AccountNotUsable` or `DependencyUnavailable`. Nothing stays
    /// persisted when a step after session creation fails.
    pub async fn login(&self, request: LoginRequest) -> Result<LoginOutcome, AuthError> {
        let ip_address = normalize_ip(&request.ip_address);
        self.rate_limiter
            .check(EndpointCategory::Login, Tier::Public, &ip_address)
            .await?;

        let now = self.now();
        let principal = self
            .verifier
            .authenticate(&request.identifier, &request.secret, now)
            .await?;
        let grant = self.authorizer.grant_for(&principal).await?;
        let issued = self
            .guard
            .admit(
                principal.id,
                &ip_address,
                &request.client_signature,
                grant.privilege,
                now,
            )
            .await?;
        let session_id = issued.session.id;

        let tokens = match self
            .tokens
            .issue(principal.id, session_id, &grant, request.device.as_deref(), now)
            .await
        {
            Ok(tokens) => tokens,
            Err(err) => {
                self.compensate_login(session_id, now).await;
                return Err(err);
            }
        };

        if let Err(err) = self.verifier.record_success(&principal, now).await {
            self.compensate_login(session_id, now).await;
            return Err(err);
        }

        info!(
            principal_id = %principal.id,
            session = %session_id,
            privilege = %grant.privilege,
            "Login succeeded"
        );
        Ok(LoginOutcome {
            tokens,
            session_token: issued.token,
            session_id,
            principal: summary(&principal, &grant, Some(now)),
        })
    }

    async fn compensate_login(&self, session_id: Uuid, now: DateTime<Utc>) {
        if let Err(err) = self.tokens.revoke_session(session_id, now).await {
            error!(session = %session_id, "Failed to revoke refresh tokens during compensation: {err}");
        }
        if let Err(err) = self
            .guard
            .sessions()
            .revoke(session_id, EndReason::Compensation, now)
            .await
        {
            error!(session = %session_id, "Failed to revoke session during compensation: {err}");
        }
        warn!(session = %session_id, "Login rolled back");
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// consumed; presenting it again revokes the whole session family.
    ///
    /// # Errors
    /// `Token(..)`, `Session(..)`, `SessionSecurity(HijackSuspected)`,
    /// `AccountNotUsable` or `DependencyUnavailable`.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        ip_address: &str,
        client_signature: &str,
    ) -> Result<TokenPair, AuthError> {
        let now = self.now();
        let claims = self.tokens.verify_refresh(refresh_token, now)?;
        let mut session = self
            .guard
            .inspect_id(claims.sid, ip_address, client_signature, now)
            .await?;
        if session.principal_id != claims.sub {
            warn!(session = %session.id, "Refresh token subject does not own the session");
            return Err(AuthError::Token(TokenErrorKind::Invalid));
        }
        let principal = self
            .principals
            .find_by_id(claims.sub)
            .await?
            .ok_or(AuthError::Token(TokenErrorKind::Invalid))?;
        principal.usability().map_err(AuthError::AccountNotUsable)?;

        let grant = self.authorizer.grant_for(&principal).await?;
        let pair = self.tokens.rotate(&claims, &grant, now).await?;
        // best effort: the presented token is already consumed
        if let Err(err) = self.guard.sessions().record_activity(&mut session, now).await {
            warn!(session = %session.id, "Failed to record refresh activity: {err}");
        }
        debug!(principal_id = %principal.id, session = %session.id, "Token pair refreshed");
        Ok(pair)
    }

    /// End the caller's session, or all of the principal's sessions, and
    /// revoke the matching refresh tokens. Works with an expired access
    /// token as long as its signature verifies.
    ///
    /// # Errors
    /// `Token(Invalid)` or `DependencyUnavailable`.
    pub async fn logout(&self, access_token: &str, scope: LogoutScope) -> Result<LogoutOutcome, AuthError> {
        let now = self.now();
        let claims = self.tokens.verify_access_for_logout(access_token)?;
        let outcome = match scope {
            LogoutScope::ThisSession => {
                let revoked = match self
                    .guard
                    .sessions()
                    .revoke(claims.sid, EndReason::Logout, now)
                    .await
                {
                    Ok(revoked) => revoked,
                    Err(AuthError::Session(SessionStateError::NotFound)) => false,
                    Err(err) => return Err(err),
                };
                LogoutOutcome {
                    sessions_revoked: u64::from(revoked),
                    refresh_tokens_revoked: self.tokens.revoke_session(claims.sid, now).await?,
                }
            }
            LogoutScope::AllSessions => LogoutOutcome {
                sessions_revoked: self
                    .guard
                    .sessions()
                    .revoke_all(claims.sub, None, EndReason::LogoutAll, now)
                    .await?,
                refresh_tokens_revoked: self.tokens.revoke_principal(claims.sub, now).await?,
            },
        };
        info!(
            principal_id = %claims.sub,
            scope = ?scope,
            sessions = outcome.sessions_revoked,
            refresh_tokens = outcome.refresh_tokens_revoked,
            "Logout"
        );
        Ok(outcome)
    }

    /// # Errors
    /// `DependencyUnavailable` when a store fails.
    pub async fn authorize(&self, principal_id: Uuid, resource: &str, action: &str) -> Result<bool, AuthError> {
        self.authorizer.authorize(principal_id, resource, action).await
    }

    /// Verify an access token and the session behind it for one request.
    ///
    /// # Errors
    /// `Token(..)`, `Session(..)`, `SessionSecurity(HijackSuspected)` or
    /// `DependencyUnavailable`.
    pub async fn authenticate_request(
        &self,
        access_token: &str,
        ip_address: &str,
        client_signature: &str,
    ) -> Result<AccessClaims, AuthError> {
        let now = self.now();
        let claims = self.tokens.verify_access(access_token, now)?;
        let session = self
            .guard
            .validate_id(claims.sid, ip_address, client_signature, now)
            .await?;
        if session.principal_id != claims.sub {
            return Err(AuthError::Token(TokenErrorKind::Invalid));
        }
        Ok(claims)
    }

    /// Report an attempt to act above the session's privilege.
    ///
    /// # Errors
    /// `SessionSecurity(EscalationDetected)` when `requested` outranks the
    /// session, `Session(..)` for unknown or ended sessions.
    pub async fn check_privilege(&self, session_id: Uuid, requested: PrivilegeLevel) -> Result<(), AuthError> {
        let now = self.now();
        let sessions = self.guard.sessions();
        let session = sessions.get(session_id).await?;
        sessions.ensure_live(&session, now)?;
        if self
            .guard
            .detect_escalation(
                Some(session.principal_id),
                Some(session.id),
                requested,
                session.privilege,
                now,
            )
            .await
        {
            return Err(AuthError::SessionSecurity(SessionSecurityKind::EscalationDetected));
        }
        Ok(())
    }

    fn check_secret_policy(&self, secret: &SecretString, field: &'static str) -> Result<(), AuthError> {
        let report = self.policy.evaluate(secret.expose_secret());
        if report.is_valid() {
            Ok(())
        } else {
            Err(AuthError::Validation(report.field_violations(field)))
        }
    }

    async fn issue_one_time_token(
        &self,
        principal_id: Uuid,
        purpose: OneTimePurpose,
        now: DateTime<Utc>,
    ) -> Result<SecretString, AuthError> {
        let ttl = match purpose {
            OneTimePurpose::EmailVerification => self.config.verification_token_ttl(),
            OneTimePurpose::PasswordReset => self.config.reset_token_ttl(),
        };
        let token = generate_secret_token()?;
        self.one_time_tokens
            .create(&OneTimeToken {
                token_hash: hash_token(&token),
                principal_id,
                purpose,
                expires_at: now + ttl,
                consumed_at: None,
            })
            .await?;
        Ok(SecretString::from(token))
    }

    /// Create an unverified account and send a verification link. The
    /// receipt is the same whether or not the address was already taken.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `Validation` for a malformed address or weak
    /// secret, or `DependencyUnavailable`.
    pub async fn register(
        &self,
        email: &str,
        secret: &SecretString,
        ip_address: &str,
    ) -> Result<RegistrationReceipt, AuthError> {
        self.rate_limiter
            .check(EndpointCategory::Registration, Tier::Public, &normalize_ip(ip_address))
            .await?;

        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(AuthError::Validation(vec![FieldViolation {
                field: "email",
                code: "invalid_format",
                message: "Enter a valid email address".to_string(),
            }]));
        }
        self.check_secret_policy(secret, "password")?;

        let now = self.now();
        let credential_hash = self.hasher.hash(secret).await?;
        let created = self
            .principals
            .create(
                NewPrincipal {
                    email: email.clone(),
                    credential_hash: Some(credential_hash),
                    is_verified: false,
                    role_ids: Vec::new(),
                },
                now,
            )
            .await?;

        match created {
            Some(principal) => {
                let token = self
                    .issue_one_time_token(principal.id, OneTimePurpose::EmailVerification, now)
                    .await?;
                self.notifications.dispatch(Notification::EmailVerification {
                    to_email: principal.email,
                    token,
                });
                info!(principal_id = %principal.id, "Principal registered");
            }
            None => debug!("Registration for an existing address"),
        }
        Ok(RegistrationReceipt::UNIFORM)
    }

    /// # Errors
    /// `Token(Invalid)` for unknown, consumed or expired tokens.
    pub async fn verify_email(&self, token: &str) -> Result<(), AuthError> {
        let now = self.now();
        let principal_id = self
            .one_time_tokens
            .consume(&hash_token(token), OneTimePurpose::EmailVerification, now)
            .await?
            .ok_or(AuthError::Token(TokenErrorKind::Invalid))?;
        self.principals.mark_verified(principal_id, now).await?;
        info!(principal_id = %principal_id, "Email verified");
        Ok(())
    }

    /// Send a reset link when the address belongs to an account that may
    /// reset. The receipt never reveals which case applied.
    ///
    /// # Errors
    /// `RateLimitExceeded` or `DependencyUnavailable`.
    pub async fn request_password_reset(
        &self,
        email: &str,
        ip_address: &str,
    ) -> Result<PasswordResetReceipt, AuthError> {
        self.rate_limiter
            .check(EndpointCategory::PasswordReset, Tier::Public, &normalize_ip(ip_address))
            .await?;

        let now = self.now();
        let email = normalize_email(email);
        let principal = if valid_email(&email) {
            self.principals.find_by_identifier(&email).await?
        } else {
            None
        };

        match principal {
            Some(principal) if principal.can_reset_password(now) => {
                self.one_time_tokens
                    .invalidate_for_principal(principal.id, OneTimePurpose::PasswordReset, now)
                    .await?;
                let token = self
                    .issue_one_time_token(principal.id, OneTimePurpose::PasswordReset, now)
                    .await?;
                self.notifications.dispatch(Notification::PasswordReset {
                    to_email: principal.email,
                    token,
                });
                info!(principal_id = %principal.id, "Password reset requested");
            }
            Some(principal) => debug!(principal_id = %principal.id, "Password reset refused for account state"),
            None => debug!("Password reset for an unknown address"),
        }
        Ok(PasswordResetReceipt::UNIFORM)
    }

    /// Replace the secret using a reset token, unlock the account and end
    /// every session.
    ///
    /// # Errors
    /// `Validation` for a weak secret, `Token(Invalid)` for an unusable
    /// token, or `DependencyUnavailable`.
    pub async fn reset_password(&self, token: &str, new_secret: &SecretString) -> Result<(), AuthError> {
        self.check_secret_policy(new_secret, "new_password")?;

        let now = self.now();
        let principal_id = self
            .one_time_tokens
            .consume(&hash_token(token), OneTimePurpose::PasswordReset, now)
            .await?
            .ok_or(AuthError::Token(TokenErrorKind::Invalid))?;
        let principal = self
            .principals
            .find_by_id(principal_id)
            .await?
            .ok_or(AuthError::Token(TokenErrorKind::Invalid))?;

        let credential_hash = self.hasher.hash(new_secret).await?;
        self.principals
            .update_password(principal.id, &credential_hash, now)
            .await?;
        self.principals.reset_failure_count(principal.id).await?;
        self.end_everything(principal.id, None, now).await?;

        self.notifications.dispatch(Notification::PasswordChanged {
            to_email: principal.email,
        });
        info!(principal_id = %principal.id, "Password reset completed");
        Ok(())
    }

    /// Change the secret of the authenticated caller. The calling session
    /// stays open; every other session and all refresh tokens are revoked.
    ///
    /// # Errors
    /// `Authentication` when `current` is wrong, `Validation` when the new
    /// secret is weak or unchanged, plus the errors of
    /// [`AuthService::authenticate_request`].
    pub async fn change_password(
        &self,
        access_token: &str,
        ip_address: &str,
        client_signature: &str,
        current: &SecretString,
        new_secret: &SecretString,
    ) -> Result<(), AuthError> {
        let claims = self
            .authenticate_request(access_token, ip_address, client_signature)
            .await?;
        let principal = self
            .principals
            .find_by_id(claims.sub)
            .await?
            .ok_or(AuthError::Token(TokenErrorKind::Invalid))?;

        if !self.verifier.verify_secret(&principal, current).await? {
            return Err(AuthError::Authentication);
        }
        if current.expose_secret() == new_secret.expose_secret() {
            return Err(AuthError::Validation(vec![FieldViolation {
                field: "new_password",
                code: "unchanged",
                message: "New password must differ from the current one".to_string(),
            }]));
        }
        self.check_secret_policy(new_secret, "new_password")?;

        let now = self.now();
        let credential_hash = self.hasher.hash(new_secret).await?;
        self.principals
            .update_password(principal.id, &credential_hash, now)
            .await?;
        self.end_everything(principal.id, Some(claims.sid), now).await?;

        self.notifications.dispatch(Notification::PasswordChanged {
            to_email: principal.email,
        });
        info!(principal_id = %principal.id, "Password changed");
        Ok(())
    }

    async fn end_everything(&self, principal_id: Uuid, keep: Option<Uuid>, now: DateTime<Utc>) -> Result<(), AuthError> {
        self.tokens.revoke_principal(principal_id, now).await?;
        self.guard
            .sessions()
            .revoke_all(principal_id, keep, EndReason::PasswordChanged, now)
            .await?;
        Ok(())
    }

    /// Replace the session token, keeping the session. `None` means the
    /// rotation was refused.
    ///
    /// # Errors
    /// `Session(..)` or `DependencyUnavailable`.
    pub async fn rotate_session(
        &self,
        session_token: &str,
        ip_address: &str,
        client_signature: &str,
    ) -> Result<Option<SecretString>, AuthError> {
        self.guard
            .rotate(session_token, ip_address, client_signature, self.now())
            .await
    }

    /// # Errors
    /// `Session(..)` or `DependencyUnavailable`.
    pub async fn extend_session(&self, session_id: Uuid, hours: Option<i64>) -> Result<DateTime<Utc>, AuthError> {
        self.guard.sessions().extend(session_id, hours, self.now()).await
    }

    /// # Errors
    /// `Session(NotFound)` or `DependencyUnavailable`.
    pub async fn requires_reauthentication(&self, session_id: Uuid, sensitive_action: bool) -> Result<bool, AuthError> {
        self.guard
            .sessions()
            .requires_reauthentication(session_id, sensitive_action, self.now())
            .await
    }

    /// Delete expired sessions and refresh tokens. Returns both counts.
    ///
    /// # Errors
    /// `DependencyUnavailable` when a store fails.
    pub async fn purge_expired(&self) -> Result<(u64, u64), AuthError> {
        let now = self.now();
        let sessions = self.guard.sessions().cleanup_expired(now).await?;
        let tokens = self.tokens.purge_expired(now).await?;
        if sessions + tokens > 0 {
            info!(sessions, refresh_tokens = tokens, "Expired records purged");
        }
        Ok((sessions, tokens))
    }
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("config", &self.config)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::clock::ManualClock;
    use crate::events::SecurityEventKind;
    use crate::rate_limit::{CounterRateLimiter, Environment, RateLimitConfig};
    use crate::session::SessionStore;
    use crate::store::memory::{MemoryStores, RecordingNotifier};

    const SECRET: &str = "Correct-Horse-9-Battery";
    const IP: &str = "203.0.113.7";
    const AGENT: &str = "Mozilla/5.0 test";

    struct Harness {
        clock: Arc<ManualClock>,
        stores: MemoryStores,
        notifier: Arc<RecordingNotifier>,
        auth: AuthService,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn harness_with(configure: impl FnOnce(AuthServiceBuilder) -> AuthServiceBuilder) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let stores = MemoryStores::new(clock.clone());
        let notifier = Arc::new(RecordingNotifier::new());
        let builder = AuthService::builder(stores.auth_stores(), TokenSigner::from_seed(&[9u8; 32]))
            .with_clock(clock.clone())
            .with_hasher(CredentialHasher::low_cost().unwrap())
            .with_notifier(notifier.clone());
        let auth = configure(builder).build().unwrap();
        Harness {
            clock,
            stores,
            notifier,
            auth,
        }
    }

    fn harness() -> Harness {
        harness_with(|builder| builder)
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    impl Harness {
        async fn verified_principal(&self, email: &str) -> Uuid {
            let hash = CredentialHasher::low_cost().unwrap().hash(&secret(SECRET)).await.unwrap();
            self.stores
                .principals
                .create(
                    NewPrincipal {
                        email: email.to_string(),
                        credential_hash: Some(hash),
                        is_verified: true,
                        role_ids: Vec::new(),
                    },
                    start(),
                )
                .await
                .unwrap()
                .unwrap()
                .id
        }

        async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, AuthError> {
            self.auth
                .login(LoginRequest::new(email, secret(password), IP, AGENT))
                .await
        }

        async fn principal(&self, id: Uuid) -> Principal {
            self.stores.principals.find_by_id(id).await.unwrap().unwrap()
        }

        async fn wait_for_notifications(&self, count: usize) -> Vec<Notification> {
            for _ in 0..100 {
                let sent = self.notifier.sent();
                if sent.len() >= count {
                    return sent;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
            self.notifier.sent()
        }
    }

    fn count_events(auth: &AuthService, kind: SecurityEventKind) -> usize {
        auth.events().iter().filter(|event| event.kind() == kind).count()
    }

    #[tokio::test]
    async fn login_issues_session_and_tokens() {
        let h = harness();
        let id = h.verified_principal("ada@example.com").await;

        let outcome = h.login("Ada@Example.com", SECRET).await.unwrap();
        assert_eq!(outcome.principal.id, id);
        assert_eq!(outcome.principal.last_login_at, Some(start()));

        let claims = h
            .auth
            .authenticate_request(&outcome.tokens.access_token, IP, AGENT)
            .await
            .unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.sid, outcome.session_id);
        assert_eq!(h.principal(id).await.last_login_at, Some(start()));
    }

    #[tokio::test]
    async fn unknown_and_wrong_secret_look_the_same() {
        let h = harness();
        h.verified_principal("ada@example.com").await;

        let unknown = h.login("nobody@example.com", SECRET).await.unwrap_err();
        let wrong = h.login("ada@example.com", "Wrong-Horse-9-Battery").await.unwrap_err();
        assert_eq!(unknown.denial(), wrong.denial());
    }

    #[tokio::test]
    async fn five_failures_lock_the_account() {
        let h = harness();
        let id = h.verified_principal("ada@example.com").await;

        for _ in 0..5 {
            let err = h.login("ada@example.com", "Wrong-Horse-9-Battery").await.unwrap_err();
            assert!(matches!(err, AuthError::Authentication));
        }
        let principal = h.principal(id).await;
        assert_eq!(principal.failed_attempts, 5);
        assert_eq!(principal.locked_until, Some(start() + Duration::minutes(30)));

        let err = h.login("ada@example.com", SECRET).await.unwrap_err();
        assert!(matches!(err, AuthError::AccountLocked { retry_after_seconds: 1800 }));
        assert_eq!(count_events(&h.auth, SecurityEventKind::AccountLocked), 1);

        let sent = h.wait_for_notifications(1).await;
        assert!(sent.iter().any(|n| matches!(
            n,
            Notification::SecurityAlert { kind: SecurityEventKind::AccountLocked, .. }
        )));

        h.clock.advance(Duration::minutes(31));
        assert!(h.login("ada@example.com", SECRET).await.is_ok());
        assert_eq!(h.principal(id).await.failed_attempts, 0);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let h = harness();
        let id = h.verified_principal("ada@example.com").await;

        for _ in 0..4 {
            assert!(h.login("ada@example.com", "Wrong-Horse-9-Battery").await.is_err());
        }
        assert_eq!(h.principal(id).await.failed_attempts, 4);
        h.login("ada@example.com", SECRET).await.unwrap();
        let principal = h.principal(id).await;
        assert_eq!(principal.failed_attempts, 0);
        assert!(principal.locked_until.is_none());
    }

    #[tokio::test]
    async fn unverified_account_is_refused_after_secret_check() {
        let h = harness();
        let receipt = h
            .auth
            .register("new@example.com", &secret(SECRET), IP)
            .await
            .unwrap();
        assert_eq!(receipt, RegistrationReceipt::UNIFORM);

        let err = h.login("new@example.com", SECRET).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::AccountNotUsable(crate::error::NotUsableReason::Unverified)
        ));
    }

    #[tokio::test]
    async fn request_from_other_origin_is_rejected() {
        let h = harness();
        let id = h.verified_principal("ada@example.com").await;
        let outcome = h.login("ada@example.com", SECRET).await.unwrap();

        let err = h
            .auth
            .authenticate_request(&outcome.tokens.access_token, "198.51.100.20", AGENT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::SessionSecurity(SessionSecurityKind::HijackSuspected)
        ));
        assert_eq!(err.denial().code, "access_denied");
        let events = h.auth.events();
        let hijack = events
            .iter()
            .find(|event| event.kind() == SecurityEventKind::HijackSuspected)
            .unwrap();
        assert_eq!(hijack.principal_id, Some(id));
    }

    #[tokio::test]
    async fn refresh_rotates_and_detects_reuse() {
        let h = harness();
        h.verified_principal("ada@example.com").await;
        let outcome = h.login("ada@example.com", SECRET).await.unwrap();
        let first = outcome.tokens.refresh_token;

        h.clock.advance(Duration::minutes(1));
        let second = h.auth.refresh(&first, IP, AGENT).await.unwrap();
        assert_ne!(second.refresh_token, first);

        let err = h.auth.refresh(&first, IP, AGENT).await.unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenErrorKind::Reused)));
        assert_eq!(count_events(&h.auth, SecurityEventKind::RefreshTokenReuse), 1);

        let err = h.auth.refresh(&second.refresh_token, IP, AGENT).await.unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenErrorKind::Invalid)));
    }

    #[tokio::test]
    async fn refresh_requires_live_session() {
        let h = harness();
        h.verified_principal("ada@example.com").await;
        let outcome = h.login("ada@example.com", SECRET).await.unwrap();

        h.auth
            .sessions()
            .revoke(outcome.session_id, EndReason::AdminRevoked, start())
            .await
            .unwrap();
        let err = h
            .auth
            .refresh(&outcome.tokens.refresh_token, IP, AGENT)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Session(SessionStateError::Revoked)));
    }

    #[tokio::test]
    async fn failed_refresh_leaves_session_activity_untouched() {
        let h = harness();
        h.verified_principal("ada@example.com").await;
        let outcome = h.login("ada@example.com", SECRET).await.unwrap();
        let first = outcome.tokens.refresh_token;

        h.clock.advance(Duration::minutes(1));
        h.auth.refresh(&first, IP, AGENT).await.unwrap();
        let touched = h.auth.sessions().get(outcome.session_id).await.unwrap().last_activity_at;
        assert_eq!(touched, start() + Duration::minutes(1));

        h.clock.advance(Duration::minutes(5));
        let err = h.auth.refresh(&first, IP, AGENT).await.unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenErrorKind::Reused)));
        let session = h.auth.sessions().get(outcome.session_id).await.unwrap();
        assert_eq!(session.last_activity_at, touched);
    }

    #[tokio::test]
    async fn concurrent_refresh_with_one_token_succeeds_once() {
        let h = harness();
        h.verified_principal("ada@example.com").await;
        let outcome = h.login("ada@example.com", SECRET).await.unwrap();
        let token = outcome.tokens.refresh_token;

        h.clock.advance(Duration::minutes(1));
        let (a, b) = tokio::join!(
            h.auth.refresh(&token, IP, AGENT),
            h.auth.refresh(&token, IP, AGENT),
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|result| matches!(result, Err(AuthError::Token(TokenErrorKind::Reused))))
                .count(),
            1
        );
        assert_eq!(count_events(&h.auth, SecurityEventKind::RefreshTokenReuse), 1);
    }

    #[tokio::test]
    async fn sixth_login_evicts_the_oldest_session() {
        let h = harness();
        let id = h.verified_principal("ada@example.com").await;

        let mut sessions = Vec::new();
        for _ in 0..6 {
            sessions.push(h.login("ada@example.com", SECRET).await.unwrap().session_id);
            h.clock.advance(Duration::seconds(1));
        }

        let oldest = h.auth.sessions().get(sessions[0]).await.unwrap();
        assert!(!oldest.is_active);
        assert_eq!(oldest.end_reason, Some(EndReason::ConcurrencyLimit));
        let live = h
            .stores
            .sessions
            .list_active_by_principal(id, h.clock.now())
            .await
            .unwrap();
        assert_eq!(live.len(), 5);
        assert_eq!(count_events(&h.auth, SecurityEventKind::ConcurrentSessionEviction), 1);
    }

    #[tokio::test]
    async fn logout_this_session_keeps_the_others() {
        let h = harness();
        let id = h.verified_principal("ada@example.com").await;
        let first = h.login("ada@example.com", SECRET).await.unwrap();
        let second = h.login("ada@example.com", SECRET).await.unwrap();

        let outcome = h
            .auth
            .logout(&first.tokens.access_token, LogoutScope::ThisSession)
            .await
            .unwrap();
        assert_eq!(outcome.sessions_revoked, 1);
        assert_eq!(outcome.refresh_tokens_revoked, 1);

        assert!(h
            .auth
            .authenticate_request(&second.tokens.access_token, IP, AGENT)
            .await
            .is_ok());
        let live = h
            .stores
            .sessions
            .list_active_by_principal(id, h.clock.now())
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn logout_everywhere_with_expired_access_token() {
        let h = harness();
        h.verified_principal("ada@example.com").await;
        let first = h.login("ada@example.com", SECRET).await.unwrap();
        h.login("ada@example.com", SECRET).await.unwrap();

        h.clock.advance(Duration::minutes(20));
        assert!(matches!(
            h.auth
                .authenticate_request(&first.tokens.access_token, IP, AGENT)
                .await
                .unwrap_err(),
            AuthError::Token(TokenErrorKind::Expired)
        ));
        let outcome = h
            .auth
            .logout(&first.tokens.access_token, LogoutScope::AllSessions)
            .await
            .unwrap();
        assert_eq!(outcome.sessions_revoked, 2);
        assert_eq!(outcome.refresh_tokens_revoked, 2);
    }

    #[tokio::test]
    async fn registration_is_uniform_for_taken_addresses() {
        let h = harness();
        h.verified_principal("ada@example.com").await;

        let taken = h
            .auth
            .register("ada@example.com", &secret(SECRET), IP)
            .await
            .unwrap();
        let fresh = h
            .auth
            .register("grace@example.com", &secret(SECRET), IP)
            .await
            .unwrap();
        assert_eq!(taken, fresh);

        let sent = h.wait_for_notifications(1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient(), "grace@example.com");
    }

    #[tokio::test]
    async fn registration_reports_field_violations() {
        let h = harness();
        let err = h
            .auth
            .register("not-an-email", &secret(SECRET), IP)
            .await
            .unwrap_err();
        let AuthError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert_eq!(fields[0].field, "email");

        let err = h
            .auth
            .register("ada@example.com", &secret("short"), IP)
            .await
            .unwrap_err();
        let AuthError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert!(fields.iter().all(|field| field.field == "password"));
    }

    #[tokio::test]
    async fn verification_link_marks_the_account_verified() {
        let h = harness();
        h.auth
            .register("grace@example.com", &secret(SECRET), IP)
            .await
            .unwrap();
        let sent = h.wait_for_notifications(1).await;
        let Notification::EmailVerification { token, .. } = &sent[0] else {
            panic!("expected verification notification");
        };
        let token = token.expose_secret().to_string();

        h.auth.verify_email(&token).await.unwrap();
        assert!(h.login("grace@example.com", SECRET).await.is_ok());
        assert!(matches!(
            h.auth.verify_email(&token).await.unwrap_err(),
            AuthError::Token(TokenErrorKind::Invalid)
        ));
    }

    #[tokio::test]
    async fn password_reset_replaces_secret_and_ends_sessions() {
        let h = harness();
        let id = h.verified_principal("ada@example.com").await;
        let before = h.login("ada@example.com", SECRET).await.unwrap();

        let unknown = h
            .auth
            .request_password_reset("nobody@example.com", IP)
            .await
            .unwrap();
        let known = h
            .auth
            .request_password_reset("ada@example.com", IP)
            .await
            .unwrap();
        assert_eq!(unknown, known);

        let sent = h.wait_for_notifications(1).await;
        let Notification::PasswordReset { token, .. } = &sent[0] else {
            panic!("expected reset notification");
        };
        let token = token.expose_secret().to_string();

        let new_secret = "Staple-Battery-7-Horse";
        h.auth.reset_password(&token, &secret(new_secret)).await.unwrap();

        let session = h.auth.sessions().get(before.session_id).await.unwrap();
        assert_eq!(session.end_reason, Some(EndReason::PasswordChanged));
        assert!(h.auth.refresh(&before.tokens.refresh_token, IP, AGENT).await.is_err());
        assert!(h.login("ada@example.com", SECRET).await.is_err());
        assert!(h.login("ada@example.com", new_secret).await.is_ok());
        assert!(h.auth.reset_password(&token, &secret(new_secret)).await.is_err());
        assert_eq!(h.principal(id).await.failed_attempts, 0);
    }

    #[tokio::test]
    async fn change_password_keeps_the_calling_session() {
        let h = harness();
        h.verified_principal("ada@example.com").await;
        let current = h.login("ada@example.com", SECRET).await.unwrap();
        let other = h.login("ada@example.com", SECRET).await.unwrap();

        let err = h
            .auth
            .change_password(
                &current.tokens.access_token,
                IP,
                AGENT,
                &secret("Wrong-Horse-9-Battery"),
                &secret("Staple-Battery-7-Horse"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Authentication));

        let err = h
            .auth
            .change_password(&current.tokens.access_token, IP, AGENT, &secret(SECRET), &secret(SECRET))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));

        h.auth
            .change_password(
                &current.tokens.access_token,
                IP,
                AGENT,
                &secret(SECRET),
                &secret("Staple-Battery-7-Horse"),
            )
            .await
            .unwrap();
        assert!(h
            .auth
            .authenticate_request(&current.tokens.access_token, IP, AGENT)
            .await
            .is_ok());
        assert!(h
            .auth
            .authenticate_request(&other.tokens.access_token, IP, AGENT)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn escalation_above_session_privilege_is_refused() {
        let h = harness();
        h.verified_principal("ada@example.com").await;
        let outcome = h.login("ada@example.com", SECRET).await.unwrap();

        assert!(h
            .auth
            .check_privilege(outcome.session_id, PrivilegeLevel::User)
            .await
            .is_ok());
        let err = h
            .auth
            .check_privilege(outcome.session_id, PrivilegeLevel::Admin)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::SessionSecurity(SessionSecurityKind::EscalationDetected)
        ));
        assert_eq!(count_events(&h.auth, SecurityEventKind::PrivilegeEscalation), 1);
    }

    #[tokio::test]
    async fn login_is_rate_limited_per_address() {
        let h = harness_with(|builder| {
            let clock = Arc::new(ManualClock::new(start()));
            let counters = MemoryStores::new(clock).counters;
            builder.with_rate_limiter(Arc::new(CounterRateLimiter::new(
                counters,
                RateLimitConfig::new(Environment::Production),
            )))
        });
        h.verified_principal("ada@example.com").await;

        for _ in 0..5 {
            assert!(h.login("ada@example.com", SECRET).await.is_ok());
        }
        let err = h.login("ada@example.com", SECRET).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::RateLimitExceeded {
                blacklisted: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn purge_removes_expired_sessions_and_tokens() {
        let h = harness();
        h.verified_principal("ada@example.com").await;
        h.login("ada@example.com", SECRET).await.unwrap();

        assert_eq!(h.auth.purge_expired().await.unwrap(), (0, 0));
        h.clock.advance(Duration::days(8));
        let (sessions, tokens) = h.auth.purge_expired().await.unwrap();
        assert_eq!(sessions, 1);
        assert_eq!(tokens, 1);
    }
}
