//! Postgres implementations of every store, over one `PgPool`.
//!
//! Every statement runs inside a `db.query` span. Read-modify-write steps
//! (failure counters, session eviction, refresh rotation, rate counters)
//! are single statements or row-locked transactions so concurrent requests
//! on other instances observe them atomically. Schema: `sql/schema.sql`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{warn, Instrument, Span};
use uuid::Uuid;

use crate::auth::AuthStores;
use crate::error::StoreError;
use crate::permission::{Permission, PermissionCode, Role, RoleCatalog, RoleStore};
use crate::principal::{NewPrincipal, OneTimePurpose, OneTimeToken, OneTimeTokenStore, Principal, PrincipalStore};
use crate::rate_limit::CounterStore;
use crate::session::{EndReason, PrivilegeLevel, Session, SessionStore};
use crate::token::{RefreshTokenRecord, RefreshTokenStore, RotationOutcome};
use crate::utils::is_unique_violation;

/// Connect a pool sized for the service.
///
/// # Errors
/// Returns an error if the database cannot be reached.
pub async fn connect(dsn: &SecretString) -> AnyResult<PgPool> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn.expose_secret())
        .await
        .context("Failed to connect to database")
}

fn db_span(operation: &'static str, statement: &'static str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn decode_error(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(format!("{what}: {err}"))
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// One shared handle behind every boundary.
    #[must_use]
    pub fn auth_stores(&self) -> AuthStores {
        let store = Arc::new(self.clone());
        AuthStores {
            principals: store.clone(),
            one_time_tokens: store.clone(),
            sessions: store.clone(),
            refresh_tokens: store.clone(),
            roles: store,
        }
    }

    /// Liveness probe used by the health endpoint.
    ///
    /// # Errors
    /// Returns the driver error when the database does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(())
    }

    async fn find_principal(&self, query: &'static str, bind: PrincipalKey<'_>) -> Result<Option<Principal>, StoreError> {
        let statement = sqlx::query(query);
        let statement = match bind {
            PrincipalKey::Email(email) => statement.bind(email),
            PrincipalKey::Id(id) => statement.bind(id),
        };
        let row = statement
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        row.as_ref().map(principal_from_row).transpose()
    }

    async fn execute_principal_update(
        &self,
        query: &'static str,
        id: Uuid,
        now: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut statement = sqlx::query(query).bind(id);
        if let Some(now) = now {
            statement = statement.bind(now);
        }
        let result = statement
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("unknown principal {id}")));
        }
        Ok(())
    }
}

enum PrincipalKey<'a> {
    Email(&'a str),
    Id(Uuid),
}

const PRINCIPAL_BY_EMAIL: &str = r"
    SELECT p.id, p.email, p.credential_hash, p.is_active, p.is_verified, p.is_superuser,
           p.is_disabled, p.failed_attempts, p.locked_until, p.last_login_at, p.created_at,
           p.updated_at,
           ARRAY(SELECT pr.role_id FROM principal_roles pr WHERE pr.principal_id = p.id) AS role_ids,
           ARRAY(
               SELECT perm.code FROM principal_permissions pp
               JOIN permissions perm ON perm.id = pp.permission_id
               WHERE pp.principal_id = p.id
           ) AS direct_permissions
    FROM principals p
    WHERE p.email = $1
";

const PRINCIPAL_BY_ID: &str = r"
    SELECT p.id, p.email, p.credential_hash, p.is_active, p.is_verified, p.is_superuser,
           p.is_disabled, p.failed_attempts, p.locked_until, p.last_login_at, p.created_at,
           p.updated_at,
           ARRAY(SELECT pr.role_id FROM principal_roles pr WHERE pr.principal_id = p.id) AS role_ids,
           ARRAY(
               SELECT perm.code FROM principal_permissions pp
               JOIN permissions perm ON perm.id = pp.permission_id
               WHERE pp.principal_id = p.id
           ) AS direct_permissions
    FROM principals p
    WHERE p.id = $1
";

fn principal_from_row(row: &PgRow) -> Result<Principal, StoreError> {
    let failed_attempts: i32 = row.try_get("failed_attempts")?;
    let codes: Vec<String> = row.try_get("direct_permissions")?;
    let direct_permissions = codes
        .iter()
        .filter_map(|code| match code.parse::<PermissionCode>() {
            Ok(code) => Some(code),
            Err(err) => {
                warn!(code = %code, "Skipping malformed permission code: {err}");
                None
            }
        })
        .collect();
    Ok(Principal {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        credential_hash: row.try_get("credential_hash")?,
        is_active: row.try_get("is_active")?,
        is_verified: row.try_get("is_verified")?,
        is_superuser: row.try_get("is_superuser")?,
        is_disabled: row.try_get("is_disabled")?,
        failed_attempts: u32::try_from(failed_attempts).map_err(|err| decode_error("failed_attempts", err))?,
        locked_until: row.try_get("locked_until")?,
        role_ids: row.try_get("role_ids")?,
        direct_permissions,
        last_login_at: row.try_get("last_login_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl PrincipalStore for PostgresStore {
    async fn find_by_identifier(&self, email: &str) -> Result<Option<Principal>, StoreError> {
        self.find_principal(PRINCIPAL_BY_EMAIL, PrincipalKey::Email(email)).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        self.find_principal(PRINCIPAL_BY_ID, PrincipalKey::Id(id)).await
    }

    async fn create(&self, new: NewPrincipal, now: DateTime<Utc>) -> Result<Option<Principal>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = r"
            INSERT INTO principals (email, credential_hash, is_verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING id
        ";
        let row = sqlx::query(query)
            .bind(&new.email)
            .bind(new.credential_hash.as_deref())
            .bind(new.is_verified)
            .bind(now)
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await;
        let id: Uuid = match row {
            Ok(row) => row.try_get("id")?,
            Err(err) if is_unique_violation(&err) => {
                let _ = tx.rollback().await;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let query = "INSERT INTO principal_roles (principal_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING";
        for role_id in &new.role_ids {
            sqlx::query(query)
                .bind(id)
                .bind(role_id)
                .execute(&mut *tx)
                .instrument(db_span("INSERT", query))
                .await?;
        }
        tx.commit().await?;

        Ok(Some(Principal {
            id,
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
        }))
    }

    async fn increment_failure_count(&self, id: Uuid, now: DateTime<Utc>) -> Result<u32, StoreError> {
        // SET expressions all read the pre-update row
        let query = r"
            UPDATE principals SET
                failed_attempts = CASE
                    WHEN locked_until IS NOT NULL AND locked_until <= $2 THEN 1
                    ELSE failed_attempts + 1
                END,
                locked_until = CASE
                    WHEN locked_until IS NOT NULL AND locked_until <= $2 THEN NULL
                    ELSE locked_until
                END,
                updated_at = $2
            WHERE id = $1
            RETURNING failed_attempts
        ";
        let row = sqlx::query(query)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("unknown principal {id}")))?;
        let count: i32 = row.try_get("failed_attempts")?;
        u32::try_from(count).map_err(|err| decode_error("failed_attempts", err))
    }

    async fn reset_failure_count(&self, id: Uuid) -> Result<(), StoreError> {
        let query = "UPDATE principals SET failed_attempts = 0, locked_until = NULL WHERE id = $1";
        self.execute_principal_update(query, id, None).await
    }

    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> Result<(), StoreError> {
        let query = "UPDATE principals SET locked_until = $2 WHERE id = $1";
        self.execute_principal_update(query, id, Some(until)).await
    }

    async fn update_password(&self, id: Uuid, credential_hash: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let query = "UPDATE principals SET credential_hash = $2, updated_at = $3 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(credential_hash)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("unknown principal {id}")));
        }
        Ok(())
    }

    async fn record_login(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let query = r"
            UPDATE principals
            SET failed_attempts = 0, locked_until = NULL, last_login_at = $2, updated_at = $2
            WHERE id = $1
        ";
        self.execute_principal_update(query, id, Some(now)).await
    }

    async fn mark_verified(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let query = "UPDATE principals SET is_verified = TRUE, updated_at = $2 WHERE id = $1";
        self.execute_principal_update(query, id, Some(now)).await
    }
}

#[async_trait]
impl OneTimeTokenStore for PostgresStore {
    async fn create(&self, token: &OneTimeToken) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO one_time_tokens (token_hash, principal_id, purpose, expires_at, consumed_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        sqlx::query(query)
            .bind(&token.token_hash)
            .bind(token.principal_id)
            .bind(token.purpose.as_str())
            .bind(token.expires_at)
            .bind(token.consumed_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::Conflict("one-time token hash".to_string())
                } else {
                    err.into()
                }
            })?;
        Ok(())
    }

    async fn consume(
        &self,
        token_hash: &str,
        purpose: OneTimePurpose,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        let query = r"
            UPDATE one_time_tokens
            SET consumed_at = $3
            WHERE token_hash = $1 AND purpose = $2 AND consumed_at IS NULL AND expires_at > $3
            RETURNING principal_id
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .bind(purpose.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        row.map(|row| row.try_get::<Uuid, _>("principal_id"))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn invalidate_for_principal(
        &self,
        principal_id: Uuid,
        purpose: OneTimePurpose,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let query = r"
            UPDATE one_time_tokens
            SET consumed_at = $3
            WHERE principal_id = $1 AND purpose = $2 AND consumed_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(principal_id)
            .bind(purpose.as_str())
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

const SESSION_BY_HASH: &str = r"
    SELECT id, token_hash, principal_id, ip_address, client_signature, privilege, created_at,
           last_activity_at, expires_at, is_active, ended_at, end_reason
    FROM sessions
    WHERE token_hash = $1
";

const SESSION_BY_ID: &str = r"
    SELECT id, token_hash, principal_id, ip_address, client_signature, privilege, created_at,
           last_activity_at, expires_at, is_active, ended_at, end_reason
    FROM sessions
    WHERE id = $1
";

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    let privilege: String = row.try_get("privilege")?;
    let end_reason: Option<String> = row.try_get("end_reason")?;
    Ok(Session {
        id: row.try_get("id")?,
        token_hash: row.try_get("token_hash")?,
        principal_id: row.try_get("principal_id")?,
        ip_address: row.try_get("ip_address")?,
        client_signature: row.try_get("client_signature")?,
        privilege: PrivilegeLevel::from_str(&privilege).map_err(|err| decode_error("privilege", err))?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        expires_at: row.try_get("expires_at")?,
        is_active: row.try_get("is_active")?,
        ended_at: row.try_get("ended_at")?,
        end_reason: end_reason
            .as_deref()
            .map(EndReason::from_str)
            .transpose()
            .map_err(|err| decode_error("end_reason", err))?,
    })
}

fn session_conflict(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict("session token hash".to_string())
    } else {
        err.into()
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO sessions
                (id, token_hash, principal_id, ip_address, client_signature, privilege,
                 created_at, last_activity_at, expires_at, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(&session.token_hash)
            .bind(session.principal_id)
            .bind(&session.ip_address)
            .bind(&session.client_signature)
            .bind(session.privilege.as_str())
            .bind(session.created_at)
            .bind(session.last_activity_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(session_conflict)?;
        Ok(())
    }

    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(SESSION_BY_HASH)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", SESSION_BY_HASH))
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(SESSION_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", SESSION_BY_ID))
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_active_by_principal(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let query = r"
            SELECT id, token_hash, principal_id, ip_address, client_signature, privilege, created_at,
                   last_activity_at, expires_at, is_active, ended_at, end_reason
            FROM sessions
            WHERE principal_id = $1 AND is_active AND expires_at >= $2
            ORDER BY created_at
        ";
        let rows = sqlx::query(query)
            .bind(principal_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn mark_revoked(&self, id: Uuid, reason: EndReason, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let query = r"
            UPDATE sessions SET is_active = FALSE, ended_at = $3, end_reason = $2
            WHERE id = $1 AND is_active
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(reason.as_str())
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        keep: Option<Uuid>,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let query = r"
            UPDATE sessions SET is_active = FALSE, ended_at = $4, end_reason = $3
            WHERE principal_id = $1 AND is_active AND ($2::uuid IS NULL OR id <> $2)
        ";
        let result = sqlx::query(query)
            .bind(principal_id)
            .bind(keep)
            .bind(reason.as_str())
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "DELETE FROM sessions WHERE expires_at < $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let query = "UPDATE sessions SET last_activity_at = GREATEST(last_activity_at, $2) WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn update_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let query = "UPDATE sessions SET expires_at = $2 WHERE id = $1 AND is_active";
        sqlx::query(query)
            .bind(id)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
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
        let query = r"
            UPDATE sessions
            SET token_hash = $3, expires_at = $4, last_activity_at = GREATEST(last_activity_at, $5)
            WHERE id = $1 AND token_hash = $2 AND is_active
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(old_hash)
            .bind(new_hash)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .map_err(session_conflict)?;
        Ok(result.rows_affected() > 0)
    }

    async fn evict_oldest(
        &self,
        principal_id: Uuid,
        keep: Uuid,
        ceiling: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // concurrent admissions for one principal queue on its row
        let query = "SELECT id FROM principals WHERE id = $1 FOR UPDATE";
        sqlx::query(query)
            .bind(principal_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await?;

        let query = r"
            WITH live AS (
                SELECT id, created_at FROM sessions
                WHERE principal_id = $1 AND is_active AND expires_at >= $4
            ),
            victims AS (
                SELECT id FROM live
                WHERE id <> $2
                ORDER BY created_at
                LIMIT GREATEST((SELECT COUNT(*) FROM live) - $3, 0)
            )
            UPDATE sessions s
            SET is_active = FALSE, ended_at = $4, end_reason = $5
            FROM victims v
            WHERE s.id = v.id
            RETURNING s.id
        ";
        let rows = sqlx::query(query)
            .bind(principal_id)
            .bind(keep)
            .bind(i64::try_from(ceiling).unwrap_or(i64::MAX))
            .bind(now)
            .bind(EndReason::ConcurrencyLimit.as_str())
            .fetch_all(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await?;
        tx.commit().await?;

        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id").map_err(StoreError::from))
            .collect()
    }
}

fn refresh_from_row(row: &PgRow) -> Result<RefreshTokenRecord, StoreError> {
    Ok(RefreshTokenRecord {
        id: row.try_get("id")?,
        principal_id: row.try_get("principal_id")?,
        session_id: row.try_get("session_id")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        used_at: row.try_get("used_at")?,
        revoked_at: row.try_get("revoked_at")?,
        device: row.try_get("device")?,
    })
}

async fn insert_refresh<'e, E>(executor: E, record: &RefreshTokenRecord) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let query = r"
        INSERT INTO refresh_tokens
            (id, principal_id, session_id, issued_at, expires_at, used_at, revoked_at, device)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ";
    sqlx::query(query)
        .bind(&record.id)
        .bind(record.principal_id)
        .bind(record.session_id)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .bind(record.used_at)
        .bind(record.revoked_at)
        .bind(record.device.as_deref())
        .execute(executor)
        .instrument(db_span("INSERT", query))
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict("refresh token identifier".to_string())
            } else {
                err.into()
            }
        })?;
    Ok(())
}

#[async_trait]
impl RefreshTokenStore for PostgresStore {
    async fn create(&self, record: &RefreshTokenRecord) -> Result<(), StoreError> {
        insert_refresh(&self.pool, record).await
    }

    async fn find_by_identifier(&self, id: &str) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let query = r"
            SELECT id, principal_id, session_id, issued_at, expires_at, used_at, revoked_at, device
            FROM refresh_tokens
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        row.as_ref().map(refresh_from_row).transpose()
    }

    async fn mark_used(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let query = r"
            UPDATE refresh_tokens SET used_at = $2
            WHERE id = $1 AND used_at IS NULL AND revoked_at IS NULL AND expires_at > $2
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rotate(
        &self,
        old_id: &str,
        replacement: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = r"
            SELECT used_at, revoked_at, expires_at FROM refresh_tokens
            WHERE id = $1
            FOR UPDATE
        ";
        let row = sqlx::query(query)
            .bind(old_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await?;
        let outcome = match row {
            None => RotationOutcome::NotFound,
            Some(row) => {
                let used_at: Option<DateTime<Utc>> = row.try_get("used_at")?;
                let revoked_at: Option<DateTime<Utc>> = row.try_get("revoked_at")?;
                let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
                if used_at.is_some() {
                    RotationOutcome::AlreadyUsed
                } else if revoked_at.is_some() {
                    RotationOutcome::Revoked
                } else if expires_at <= now {
                    RotationOutcome::Expired
                } else {
                    RotationOutcome::Rotated
                }
            }
        };
        if outcome != RotationOutcome::Rotated {
            let _ = tx.rollback().await;
            return Ok(outcome);
        }

        let query = "UPDATE refresh_tokens SET used_at = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(old_id)
            .bind(now)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await?;
        insert_refresh(&mut *tx, replacement).await?;
        tx.commit().await?;
        Ok(RotationOutcome::Rotated)
    }

    async fn revoke(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let query = "UPDATE refresh_tokens SET revoked_at = $2 WHERE id = $1 AND revoked_at IS NULL";
        let result = sqlx::query(query)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_for_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "UPDATE refresh_tokens SET revoked_at = $2 WHERE session_id = $1 AND revoked_at IS NULL";
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_for_principal(&self, principal_id: Uuid, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "UPDATE refresh_tokens SET revoked_at = $2 WHERE principal_id = $1 AND revoked_at IS NULL";
        let result = sqlx::query(query)
            .bind(principal_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "DELETE FROM refresh_tokens WHERE expires_at <= $1";
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RoleStore for PostgresStore {
    async fn catalog(&self) -> Result<RoleCatalog, StoreError> {
        let query = "SELECT id, name, level, parent_id, organization_id FROM roles";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        let mut roles = HashMap::with_capacity(rows.len());
        for row in &rows {
            let role = Role {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                level: row.try_get("level")?,
                parent_id: row.try_get("parent_id")?,
                permissions: Vec::new(),
                organization_id: row.try_get("organization_id")?,
            };
            roles.insert(role.id, role);
        }

        let query = r"
            SELECT rp.role_id, p.id, p.code, p.description, p.is_system
            FROM role_permissions rp
            JOIN permissions p ON p.id = rp.permission_id
        ";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        for row in &rows {
            let role_id: Uuid = row.try_get("role_id")?;
            let code: String = row.try_get("code")?;
            let Ok(parsed) = code.parse::<PermissionCode>() else {
                warn!(code = %code, "Skipping malformed permission code");
                continue;
            };
            if let Some(role) = roles.get_mut(&role_id) {
                role.permissions.push(Permission {
                    id: row.try_get("id")?,
                    code: parsed,
                    description: row.try_get("description")?,
                    is_system: row.try_get("is_system")?,
                });
            }
        }
        Ok(RoleCatalog::new(roles.into_values()))
    }

    async fn save_role(&self, role: &Role) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = r"
            INSERT INTO roles (id, name, level, parent_id, organization_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                level = EXCLUDED.level,
                parent_id = EXCLUDED.parent_id,
                organization_id = EXCLUDED.organization_id
        ";
        sqlx::query(query)
            .bind(role.id)
            .bind(&role.name)
            .bind(role.level)
            .bind(role.parent_id)
            .bind(role.organization_id)
            .execute(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::Conflict(format!("role name {}", role.name))
                } else {
                    err.into()
                }
            })?;

        let query = "DELETE FROM role_permissions WHERE role_id = $1";
        sqlx::query(query)
            .bind(role.id)
            .execute(&mut *tx)
            .instrument(db_span("DELETE", query))
            .await?;

        for permission in &role.permissions {
            let query = r"
                INSERT INTO permissions (id, code, description, is_system)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (code) DO UPDATE SET code = EXCLUDED.code
                RETURNING id
            ";
            let row = sqlx::query(query)
                .bind(permission.id)
                .bind(permission.code.to_string())
                .bind(permission.description.as_deref())
                .bind(permission.is_system)
                .fetch_one(&mut *tx)
                .instrument(db_span("INSERT", query))
                .await?;
            let permission_id: Uuid = row.try_get("id")?;

            let query = r"
                INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2)
                ON CONFLICT DO NOTHING
            ";
            sqlx::query(query)
                .bind(role.id)
                .bind(permission_id)
                .execute(&mut *tx)
                .instrument(db_span("INSERT", query))
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn assign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        let query = "INSERT INTO principal_roles (principal_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING";
        sqlx::query(query)
            .bind(principal_id)
            .bind(role_id)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn unassign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        let query = "DELETE FROM principal_roles WHERE principal_id = $1 AND role_id = $2";
        sqlx::query(query)
            .bind(principal_id)
            .bind(role_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for PostgresStore {
    async fn increment_and_get(&self, key: &str, window_seconds: u64) -> Result<u64, StoreError> {
        let query = r"
            INSERT INTO rate_limit_counters AS c (key, count, window_ends_at)
            VALUES ($1, 1, NOW() + ($2 * INTERVAL '1 second'))
            ON CONFLICT (key) DO UPDATE SET
                count = CASE WHEN c.window_ends_at <= NOW() THEN 1 ELSE c.count + 1 END,
                window_ends_at = CASE
                    WHEN c.window_ends_at <= NOW() THEN EXCLUDED.window_ends_at
                    ELSE c.window_ends_at
                END
            RETURNING count
        ";
        let row = sqlx::query(query)
            .bind(key)
            .bind(i64::try_from(window_seconds).unwrap_or(i64::MAX))
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        let count: i64 = row.try_get("count")?;
        u64::try_from(count).map_err(|err| decode_error("count", err))
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let query = "SELECT count FROM rate_limit_counters WHERE key = $1 AND window_ends_at > NOW()";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        match row {
            Some(row) => {
                let count: i64 = row.try_get("count")?;
                u64::try_from(count).map_err(|err| decode_error("count", err))
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazy_pool_builds_without_a_server() -> anyhow::Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let store = PostgresStore::new(pool);
        assert!(!store.pool().is_closed());
        Ok(())
    }

    #[test]
    fn decode_errors_name_the_column() {
        let err = decode_error("privilege", "unknown privilege level: wizard");
        assert_eq!(err.to_string(), "invalid stored value: privilege: unknown privilege level: wizard");
    }
}
