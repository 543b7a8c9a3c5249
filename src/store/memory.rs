//! Single-process store implementations.
//!
//! Each store keeps its records behind one `std::sync::Mutex` and never
//! holds the lock across an await point, so every operation is atomic with
//! respect to the others. Suitable for tests and single-instance
//! development; multi-instance deployments need [`super::postgres`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::auth::AuthStores;
use crate::clock::Clock;
use crate::error::StoreError;
use crate::notify::{Notification, Notifier};
use crate::permission::{Role, RoleCatalog, RoleStore};
use crate::principal::{NewPrincipal, OneTimePurpose, OneTimeToken, OneTimeTokenStore, Principal, PrincipalStore};
use crate::rate_limit::CounterStore;
use crate::session::{EndReason, Session, SessionStore};
use crate::token::{RefreshTokenRecord, RefreshTokenStore, RotationOutcome};

const MAX_WINDOW_SECONDS: u64 = 366 * 24 * 60 * 60;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unknown(kind: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::Conflict(format!("unknown {kind} {id}"))
}

#[derive(Debug, Default)]
pub struct MemoryPrincipalStore {
    principals: Mutex<HashMap<Uuid, Principal>>,
}

impl MemoryPrincipalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an administrative change to a principal. Returns false when the
    /// principal does not exist.
    pub fn modify(&self, id: Uuid, change: impl FnOnce(&mut Principal)) -> bool {
        match lock(&self.principals).get_mut(&id) {
            Some(principal) => {
                change(principal);
                true
            }
            None => false,
        }
    }

    fn update<R>(&self, id: Uuid, change: impl FnOnce(&mut Principal) -> R) -> Result<R, StoreError> {
        lock(&self.principals)
            .get_mut(&id)
            .map(change)
            .ok_or_else(|| unknown("principal", id))
    }
}

#[async_trait]
impl PrincipalStore for MemoryPrincipalStore {
    async fn find_by_identifier(&self, email: &str) -> Result<Option<Principal>, StoreError> {
        Ok(lock(&self.principals)
            .values()
            .find(|principal| principal.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        Ok(lock(&self.principals).get(&id).cloned())
    }

    async fn create(&self, new: NewPrincipal, now: DateTime<Utc>) -> Result<Option<Principal>, StoreError> {
        let mut principals = lock(&self.principals);
        if principals.values().any(|principal| principal.email == new.email) {
            return Ok(None);
        }
        let principal = Principal {
            id: Uuid::new_v4(),
            email: new.email,
            credential_hash: new.credential_hash,
            is_active: true,
            is_verified: new.is_verified,
            is_superuser: false,
            is_disabled: false,
            failed_attempts: 0,
            locked_until: None,
            role_ids: new.role_ids,
            direct_permissions: Vec::new(),
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };
        principals.insert(principal.id, principal.clone());
        Ok(Some(principal))
    }

    async fn increment_failure_count(&self, id: Uuid, now: DateTime<Utc>) -> Result<u32, StoreError> {
        self.update(id, |principal| {
            if principal.locked_until.is_some_and(|until| until <= now) {
                principal.failed_attempts = 0;
                principal.locked_until = None;
            }
            principal.failed_attempts = principal.failed_attempts.saturating_add(1);
            principal.updated_at = now;
            principal.failed_attempts
        })
    }

    async fn reset_failure_count(&self, id: Uuid) -> Result<(), StoreError> {
        self.update(id, |principal| {
            principal.failed_attempts = 0;
            principal.locked_until = None;
        })
    }

    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, |principal| principal.locked_until = Some(until))
    }

    async fn update_password(&self, id: Uuid, credential_hash: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, |principal| {
            principal.credential_hash = Some(credential_hash.to_string());
            principal.updated_at = now;
        })
    }

    async fn record_login(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, |principal| {
            principal.failed_attempts = 0;
            principal.locked_until = None;
            principal.last_login_at = Some(now);
            principal.updated_at = now;
        })
    }

    async fn mark_verified(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.update(id, |principal| {
            principal.is_verified = true;
            principal.updated_at = now;
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryOneTimeTokenStore {
    tokens: Mutex<HashMap<String, OneTimeToken>>,
}

impl MemoryOneTimeTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OneTimeTokenStore for MemoryOneTimeTokenStore {
    async fn create(&self, token: &OneTimeToken) -> Result<(), StoreError> {
        let mut tokens = lock(&self.tokens);
        if tokens.contains_key(&token.token_hash) {
            return Err(StoreError::Conflict("one-time token hash".to_string()));
        }
        tokens.insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn consume(
        &self,
        token_hash: &str,
        purpose: OneTimePurpose,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut tokens = lock(&self.tokens);
        let Some(token) = tokens.get_mut(token_hash) else {
            return Ok(None);
        };
        if token.purpose != purpose || token.consumed_at.is_some() || token.expires_at <= now {
            return Ok(None);
        }
        token.consumed_at = Some(now);
        Ok(Some(token.principal_id))
    }

    async fn invalidate_for_principal(
        &self,
        principal_id: Uuid,
        purpose: OneTimePurpose,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut invalidated = 0;
        for token in lock(&self.tokens).values_mut() {
            if token.principal_id == principal_id && token.purpose == purpose && token.consumed_at.is_none() {
                token.consumed_at = Some(now);
                invalidated += 1;
            }
        }
        Ok(invalidated)
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn end(session: &mut Session, reason: EndReason, now: DateTime<Utc>) {
        session.is_active = false;
        session.ended_at = Some(now);
        session.end_reason = Some(reason);
    }
}

fn is_live(session: &Session, now: DateTime<Utc>) -> bool {
    session.is_active && session.expires_at >= now
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = lock(&self.sessions);
        if sessions
            .values()
            .any(|existing| existing.token_hash == session.token_hash)
        {
            return Err(StoreError::Conflict("session token hash".to_string()));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        Ok(lock(&self.sessions)
            .values()
            .find(|session| session.token_hash == token_hash)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(lock(&self.sessions).get(&id).cloned())
    }

    async fn list_active_by_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut active: Vec<Session> = lock(&self.sessions)
            .values()
            .filter(|session| session.principal_id == principal_id && is_live(session, now))
            .cloned()
            .collect();
        active.sort_by_key(|session| session.created_at);
        Ok(active)
    }

    async fn mark_revoked(&self, id: Uuid, reason: EndReason, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match lock(&self.sessions).get_mut(&id) {
            Some(session) if session.is_active => {
                Self::end(session, reason, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        keep: Option<Uuid>,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut revoked = 0;
        for session in lock(&self.sessions).values_mut() {
            if session.principal_id == principal_id && session.is_active && Some(session.id) != keep {
                Self::end(session, reason, now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at >= now);
        Ok(u64::try_from(before - sessions.len()).unwrap_or(u64::MAX))
    }

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.get_mut(&id).ok_or_else(|| unknown("session", id))?;
        session.last_activity_at = session.last_activity_at.max(now);
        Ok(())
    }

    async fn update_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut sessions = lock(&self.sessions);
        let session = sessions.get_mut(&id).ok_or_else(|| unknown("session", id))?;
        session.expires_at = expires_at;
        Ok(())
    }

    async fn rotate_token(
        &self,
        id: Uuid,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut sessions = lock(&self.sessions);
        if sessions
            .values()
            .any(|session| session.token_hash == new_hash)
        {
            return Err(StoreError::Conflict("session token hash".to_string()));
        }
        match sessions.get_mut(&id) {
            Some(session) if session.is_active && session.token_hash == old_hash => {
                session.token_hash = new_hash.to_string();
                session.expires_at = expires_at;
                session.last_activity_at = session.last_activity_at.max(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn evict_oldest(
        &self,
        principal_id: Uuid,
        keep: Uuid,
        ceiling: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut sessions = lock(&self.sessions);
        let mut live: Vec<(DateTime<Utc>, Uuid)> = sessions
            .values()
            .filter(|session| session.principal_id == principal_id && is_live(session, now))
            .map(|session| (session.created_at, session.id))
            .collect();
        let excess = live.len().saturating_sub(ceiling);
        live.sort();
        let evicted: Vec<Uuid> = live
            .into_iter()
            .map(|(_, id)| id)
            .filter(|id| *id != keep)
            .take(excess)
            .collect();
        for id in &evicted {
            if let Some(session) = sessions.get_mut(id) {
                Self::end(session, EndReason::ConcurrencyLimit, now);
            }
        }
        Ok(evicted)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRefreshTokenStore {
    records: Mutex<HashMap<String, RefreshTokenRecord>>,
}

impl MemoryRefreshTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn revoke_where(&self, now: DateTime<Utc>, matches: impl Fn(&RefreshTokenRecord) -> bool) -> u64 {
        let mut revoked = 0;
        for record in lock(&self.records).values_mut() {
            if record.revoked_at.is_none() && matches(record) {
                record.revoked_at = Some(now);
                revoked += 1;
            }
        }
        revoked
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn create(&self, record: &RefreshTokenRecord) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        if records.contains_key(&record.id) {
            return Err(StoreError::Conflict("refresh token identifier".to_string()));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_identifier(&self, id: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
        Ok(lock(&self.records).get(id).cloned())
    }

    async fn mark_used(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match lock(&self.records).get_mut(id) {
            Some(record) if record.used_at.is_none() && record.revoked_at.is_none() && record.expires_at > now => {
                record.used_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate(
        &self,
        old_id: &str,
        replacement: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, StoreError> {
        let mut records = lock(&self.records);
        let Some(old) = records.get_mut(old_id) else {
            return Ok(RotationOutcome::NotFound);
        };
        if old.used_at.is_some() {
            return Ok(RotationOutcome::AlreadyUsed);
        }
        if old.revoked_at.is_some() {
            return Ok(RotationOutcome::Revoked);
        }
        if old.expires_at <= now {
            return Ok(RotationOutcome::Expired);
        }
        old.used_at = Some(now);
        records.insert(replacement.id.clone(), replacement.clone());
        Ok(RotationOutcome::Rotated)
    }

    async fn revoke(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.revoke_where(now, |record| record.id == id) > 0)
    }

    async fn revoke_for_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.revoke_where(now, |record| record.session_id == session_id))
    }

    async fn revoke_for_principal(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.revoke_where(now, |record| record.principal_id == principal_id))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok(u64::try_from(before - records.len()).unwrap_or(u64::MAX))
    }
}

/// Roles live here; memberships are written onto the principal records.
#[derive(Debug)]
pub struct MemoryRoleStore {
    roles: Mutex<HashMap<Uuid, Role>>,
    principals: Arc<MemoryPrincipalStore>,
}

impl MemoryRoleStore {
    #[must_use]
    pub fn new(principals: Arc<MemoryPrincipalStore>) -> Self {
        Self {
            roles: Mutex::new(HashMap::new()),
            principals,
        }
    }
}

#[async_trait]
impl RoleStore for MemoryRoleStore {
    async fn catalog(&self) -> Result<RoleCatalog, StoreError> {
        Ok(RoleCatalog::new(lock(&self.roles).values().cloned()))
    }

    async fn save_role(&self, role: &Role) -> Result<(), StoreError> {
        let mut roles = lock(&self.roles);
        if roles
            .values()
            .any(|existing| existing.name == role.name && existing.id != role.id)
        {
            return Err(StoreError::Conflict(format!("role name {}", role.name)));
        }
        roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn assign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        let assigned = self.principals.modify(principal_id, |principal| {
            if !principal.role_ids.contains(&role_id) {
                principal.role_ids.push(role_id);
            }
        });
        if assigned {
            Ok(())
        } else {
            Err(unknown("principal", principal_id))
        }
    }

    async fn unassign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        self.principals
            .modify(principal_id, |principal| principal.role_ids.retain(|id| *id != role_id));
        Ok(())
    }
}

/// Fixed-window counters keyed by string, timed by the injected clock.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore")
            .field("keys", &lock(&self.counters).len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(&self, key: &str, window_seconds: u64) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let window = Duration::seconds(i64::try_from(window_seconds.min(MAX_WINDOW_SECONDS)).unwrap_or(0));
        let mut counters = lock(&self.counters);
        let entry = counters.entry(key.to_string()).or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        Ok(lock(&self.counters)
            .get(key)
            .filter(|(_, ends_at)| *ends_at > now)
            .map_or(0, |(count, _)| *count))
    }
}

/// Notifier that keeps every notification it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> AnyResult<()> {
        lock(&self.sent).push(notification.clone());
        Ok(())
    }
}

/// Every memory store, sharing one clock.
#[derive(Debug, Clone)]
pub struct MemoryStores {
    pub principals: Arc<MemoryPrincipalStore>,
    pub one_time_tokens: Arc<MemoryOneTimeTokenStore>,
    pub sessions: Arc<MemorySessionStore>,
    pub refresh_tokens: Arc<MemoryRefreshTokenStore>,
    pub roles: Arc<MemoryRoleStore>,
    pub counters: Arc<MemoryCounterStore>,
}

impl MemoryStores {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let principals = Arc::new(MemoryPrincipalStore::new());
        Self {
            roles: Arc::new(MemoryRoleStore::new(principals.clone())),
            principals,
            one_time_tokens: Arc::new(MemoryOneTimeTokenStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            refresh_tokens: Arc::new(MemoryRefreshTokenStore::new()),
            counters: Arc::new(MemoryCounterStore::new(clock)),
        }
    }

    #[must_use]
    pub fn auth_stores(&self) -> AuthStores {
        AuthStores {
            principals: self.principals.clone(),
            one_time_tokens: self.one_time_tokens.clone(),
            sessions: self.sessions.clone(),
            refresh_tokens: self.refresh_tokens.clone(),
            roles: self.roles.clone(),
        }
    }
}
