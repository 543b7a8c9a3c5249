//! Access/refresh token minting, verification and single-use rotation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::claims::{AccessClaims, Expectation, RefreshClaims, TokenType};
use super::codec::{CodecError, TokenSigner, TokenVerifier};
use super::repo::{RefreshTokenRecord, RefreshTokenStore, RotationOutcome};
use crate::error::{AuthError, TokenErrorKind};
use crate::events::{EventRegistry, SecurityEvent, SecurityEventDetail};
use crate::permission::Grant;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenConfig {
    /// Defaults: issuer `warden`, audience `warden-api`, 15 min access
    /// tokens and 7 day refresh tokens.
    #[must_use]
    pub fn new() -> Self {
        Self {
            issuer: "warden".to_string(),
            audience: "warden-api".to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn expectation(&self, token_type: TokenType) -> Expectation<'_> {
        Expectation {
            issuer: &self.issuer,
            audience: &self.audience,
            token_type,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish_non_exhaustive()
    }
}

fn token_error(err: &CodecError) -> AuthError {
    debug!("Token rejected: {err}");
    match err {
        CodecError::Expired => AuthError::Token(TokenErrorKind::Expired),
        _ => AuthError::Token(TokenErrorKind::Invalid),
    }
}

fn signing_error(err: &CodecError) -> AuthError {
    AuthError::Internal(format!("failed to sign token: {err}"))
}

pub struct TokenIssuer {
    config: TokenConfig,
    signer: TokenSigner,
    verifier: TokenVerifier,
    store: Arc<dyn RefreshTokenStore>,
    events: Arc<EventRegistry>,
}

impl TokenIssuer {
    /// The verifier trusts the signer's key; add previous keys with
    /// [`TokenIssuer::with_verifier`] when rotating signing keys.
    #[must_use]
    pub fn new(
        config: TokenConfig,
        signer: TokenSigner,
        store: Arc<dyn RefreshTokenStore>,
        events: Arc<EventRegistry>,
    ) -> Self {
        let verifier = signer.verifier();
        Self {
            config,
            signer,
            verifier,
            store,
            events,
        }
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = verifier.with_key(self.signer.verifying_key());
        self
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Mint an access/refresh pair and persist the refresh identifier.
    ///
    /// # Errors
    /// `Internal` if signing fails, `DependencyUnavailable` if the store fails.
    pub async fn issue(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        grant: &Grant,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        let (record, refresh_token) = self.mint_refresh(principal_id, session_id, device, now)?;
        let (access_token, access_expires_at) = self.mint_access(principal_id, session_id, grant, now)?;
        self.store.create(&record).await?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at: record.expires_at,
        })
    }

    /// # Errors
    /// `Internal` if signing fails.
    pub fn mint_access(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        grant: &Grant,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let expires_at = now + self.config.access_ttl;
        let claims = AccessClaims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            sub: principal_id,
            sid: session_id,
            jti: Uuid::new_v4().to_string(),
            typ: TokenType::Access,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            roles: grant.roles.clone(),
            perms: grant.permissions.to_strings(),
            privilege: grant.privilege,
        };
        let token = self.signer.sign(&claims).map_err(|err| signing_error(&err))?;
        Ok((token, expires_at))
    }

    fn mint_refresh(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(RefreshTokenRecord, String), AuthError> {
        let expires_at = now + self.config.refresh_ttl;
        let jti = Uuid::now_v7().to_string();
        let claims = RefreshClaims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            sub: principal_id,
            sid: session_id,
            jti: jti.clone(),
            typ: TokenType::Refresh,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            device: device.map(str::to_string),
        };
        let token = self.signer.sign(&claims).map_err(|err| signing_error(&err))?;
        let record = RefreshTokenRecord {
            id: jti,
            principal_id,
            session_id,
            issued_at: now,
            expires_at,
            used_at: None,
            revoked_at: None,
            device: claims.device,
        };
        Ok((record, token))
    }

    /// # Errors
    /// `Token(Invalid)` or `Token(Expired)`.
    pub fn verify_access(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, AuthError> {
        self.decode_access(token, Some(now))
    }

    /// Signature and claims checked, expiry ignored. Only for revoking.
    ///
    /// # Errors
    /// `Token(Invalid)`.
    pub fn verify_access_for_logout(&self, token: &str) -> Result<AccessClaims, AuthError> {
        self.decode_access(token, None)
    }

    fn decode_access(&self, token: &str, now: Option<DateTime<Utc>>) -> Result<AccessClaims, AuthError> {
        let claims: AccessClaims = self.verifier.verify(token).map_err(|err| token_error(&err))?;
        self.config
            .expectation(TokenType::Access)
            .check(&claims, now.map(|now| now.timestamp()))
            .map_err(|err| token_error(&err))?;
        Ok(claims)
    }

    /// # Errors
    /// `Token(Invalid)` or `Token(Expired)`.
    pub fn verify_refresh(&self, token: &str, now: DateTime<Utc>) -> Result<RefreshClaims, AuthError> {
        let claims: RefreshClaims = self.verifier.verify(token).map_err(|err| token_error(&err))?;
        self.config
            .expectation(TokenType::Refresh)
            .check(&claims, Some(now.timestamp()))
            .map_err(|err| token_error(&err))?;
        Ok(claims)
    }

    /// Exchange a verified refresh token for a new pair. The old identifier
    /// is consumed atomically with storing the new one. Presenting an
    /// identifier that was already consumed revokes every refresh token of
    /// the session and records a `RefreshTokenReuse` event.
    ///
    /// # Errors
    /// `Token(Reused)`, `Token(Invalid)` for revoked or unknown identifiers,
    /// `Token(Expired)`, `DependencyUnavailable`.
    pub async fn rotate(&self, presented: &RefreshClaims, grant: &Grant, now: DateTime<Utc>) -> Result<TokenPair, AuthError> {
        let (record, refresh_token) =
            self.mint_refresh(presented.sub, presented.sid, presented.device.as_deref(), now)?;
        let (access_token, access_expires_at) = self.mint_access(presented.sub, presented.sid, grant, now)?;

        match self.store.rotate(&presented.jti, &record, now).await? {
            RotationOutcome::Rotated => Ok(TokenPair {
                access_token,
                refresh_token,
                access_expires_at,
                refresh_expires_at: record.expires_at,
            }),
            RotationOutcome::AlreadyUsed => {
                let revoked_tokens = self.store.revoke_for_session(presented.sid, now).await?;
                warn!(
                    principal_id = %presented.sub,
                    session = %presented.sid,
                    revoked_tokens,
                    "Refresh token reuse detected, token family revoked"
                );
                self.events
                    .emit(SecurityEvent::new(
                        Some(presented.sub),
                        now,
                        SecurityEventDetail::RefreshTokenReuse {
                            session: presented.sid.to_string(),
                            revoked_tokens,
                        },
                    ))
                    .await;
                Err(AuthError::Token(TokenErrorKind::Reused))
            }
            RotationOutcome::Expired => Err(AuthError::Token(TokenErrorKind::Expired)),
            RotationOutcome::Revoked | RotationOutcome::NotFound => {
                Err(AuthError::Token(TokenErrorKind::Invalid))
            }
        }
    }

    /// # Errors
    /// `DependencyUnavailable`.
    pub async fn revoke(&self, jti: &str, now: DateTime<Utc>) -> Result<bool, AuthError> {
        Ok(self.store.revoke(jti, now).await?)
    }

    /// # Errors
    /// `DependencyUnavailable`.
    pub async fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64, AuthError> {
        Ok(self.store.revoke_for_session(session_id, now).await?)
    }

    /// # Errors
    /// `DependencyUnavailable`.
    pub async fn revoke_principal(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<u64, AuthError> {
        Ok(self.store.revoke_for_principal(principal_id, now).await?)
    }

    /// # Errors
    /// `DependencyUnavailable`.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        Ok(self.store.delete_expired(now).await?)
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("config", &self.config)
            .field("kid", &self.signer.kid())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::SecurityEventKind;
    use crate::permission::PermissionSet;
    use crate::session::PrivilegeLevel;
    use crate::store::memory::MemoryRefreshTokenStore;

    fn grant() -> Grant {
        Grant {
            roles: vec!["editor".to_string()],
            permissions: PermissionSet::new(["posts:write".parse().unwrap()]),
            privilege: PrivilegeLevel::User,
        }
    }

    fn issuer() -> (TokenIssuer, Arc<MemoryRefreshTokenStore>, Arc<EventRegistry>) {
        let store = Arc::new(MemoryRefreshTokenStore::new());
        let events = Arc::new(EventRegistry::new());
        let issuer = TokenIssuer::new(
            TokenConfig::new(),
            TokenSigner::from_seed(&[3u8; 32]),
            store.clone(),
            events.clone(),
        );
        (issuer, store, events)
    }

    #[tokio::test]
    async fn access_token_carries_the_grant() {
        let (issuer, _, _) = issuer();
        let now = Utc::now();
        let principal = Uuid::new_v4();
        let session = Uuid::new_v4();
        let pair = issuer.issue(principal, session, &grant(), None, now).await.unwrap();

        let claims = issuer.verify_access(&pair.access_token, now).unwrap();
        assert_eq!(claims.sub, principal);
        assert_eq!(claims.sid, session);
        assert_eq!(claims.roles, vec!["editor"]);
        assert_eq!(claims.perms, vec!["posts:write"]);
        assert_eq!(pair.access_expires_at, now + Duration::minutes(15));
        assert_eq!(pair.refresh_expires_at, now + Duration::days(7));
    }

    #[tokio::test]
    async fn access_token_expires() {
        let (issuer, _, _) = issuer();
        let now = Utc::now();
        let pair = issuer
            .issue(Uuid::new_v4(), Uuid::new_v4(), &grant(), None, now)
            .await
            .unwrap();
        let err = issuer
            .verify_access(&pair.access_token, now + Duration::minutes(16))
            .unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenErrorKind::Expired)));
        assert!(issuer.verify_access_for_logout(&pair.access_token).is_ok());
    }

    #[tokio::test]
    async fn token_types_are_not_interchangeable() {
        let (issuer, _, _) = issuer();
        let now = Utc::now();
        let pair = issuer
            .issue(Uuid::new_v4(), Uuid::new_v4(), &grant(), None, now)
            .await
            .unwrap();
        assert!(matches!(
            issuer.verify_access(&pair.refresh_token, now),
            Err(AuthError::Token(TokenErrorKind::Invalid))
        ));
        assert!(matches!(
            issuer.verify_refresh(&pair.access_token, now),
            Err(AuthError::Token(TokenErrorKind::Invalid))
        ));
    }

    #[tokio::test]
    async fn refresh_round_trip_then_reuse_is_detected() {
        let (issuer, store, events) = issuer();
        let now = Utc::now();
        let session = Uuid::new_v4();
        let first = issuer
            .issue(Uuid::new_v4(), session, &grant(), Some("laptop"), now)
            .await
            .unwrap();

        let claims = issuer.verify_refresh(&first.refresh_token, now).unwrap();
        assert_eq!(claims.device.as_deref(), Some("laptop"));
        let second = issuer.rotate(&claims, &grant(), now).await.unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        let err = issuer.rotate(&claims, &grant(), now).await.unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenErrorKind::Reused)));

        let newer = issuer.verify_refresh(&second.refresh_token, now).unwrap();
        let record = store.find_by_identifier(&newer.jti).await.unwrap().unwrap();
        assert!(record.revoked_at.is_some());
        assert!(matches!(
            issuer.rotate(&newer, &grant(), now).await,
            Err(AuthError::Token(TokenErrorKind::Invalid))
        ));

        let kinds: Vec<_> = events.events().iter().map(SecurityEvent::kind).collect();
        assert_eq!(kinds, vec![SecurityEventKind::RefreshTokenReuse]);
    }

    #[tokio::test]
    async fn revoked_session_tokens_cannot_refresh() {
        let (issuer, _, _) = issuer();
        let now = Utc::now();
        let session = Uuid::new_v4();
        let pair = issuer
            .issue(Uuid::new_v4(), session, &grant(), None, now)
            .await
            .unwrap();
        assert_eq!(issuer.revoke_session(session, now).await.unwrap(), 1);
        let claims = issuer.verify_refresh(&pair.refresh_token, now).unwrap();
        assert!(matches!(
            issuer.rotate(&claims, &grant(), now).await,
            Err(AuthError::Token(TokenErrorKind::Invalid))
        ));
    }

    #[tokio::test]
    async fn tokens_from_another_key_are_invalid() {
        let (issuer, _, _) = issuer();
        let (other, _, _) = {
            let store = Arc::new(MemoryRefreshTokenStore::new());
            let events = Arc::new(EventRegistry::new());
            (
                TokenIssuer::new(
                    TokenConfig::new(),
                    TokenSigner::from_seed(&[4u8; 32]),
                    store.clone(),
                    events.clone(),
                ),
                store,
                events,
            )
        };
        let now = Utc::now();
        let pair = other
            .issue(Uuid::new_v4(), Uuid::new_v4(), &grant(), None, now)
            .await
            .unwrap();
        assert!(matches!(
            issuer.verify_access(&pair.access_token, now),
            Err(AuthError::Token(TokenErrorKind::Invalid))
        ));

        let trusting = issuer.with_verifier(TokenVerifier::new().with_key(
            TokenSigner::from_seed(&[4u8; 32]).verifying_key(),
        ));
        assert!(trusting.verify_access(&pair.access_token, now).is_ok());
    }
}
