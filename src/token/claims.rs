//! Access and refresh token claim sets.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::CodecError;
use crate::session::PrivilegeLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub iss: String,
    pub aud: String,
    pub sub: Uuid,
    /// Session the token was minted for.
    pub sid: Uuid,
    pub jti: String,
    pub typ: TokenType,
    pub iat: i64,
    pub exp: i64,
    pub roles: Vec<String>,
    pub perms: Vec<String>,
    #[serde(rename = "priv")]
    pub privilege: PrivilegeLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshClaims {
    pub iss: String,
    pub aud: String,
    pub sub: Uuid,
    pub sid: Uuid,
    pub jti: String,
    pub typ: TokenType,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// The registered claims every token carries.
pub trait RegisteredClaims {
    fn issuer(&self) -> &str;
    fn audience(&self) -> &str;
    fn token_type(&self) -> TokenType;
    fn expires_at(&self) -> i64;
}

impl RegisteredClaims for AccessClaims {
    fn issuer(&self) -> &str {
        &self.iss
    }
    fn audience(&self) -> &str {
        &self.aud
    }
    fn token_type(&self) -> TokenType {
        self.typ
    }
    fn expires_at(&self) -> i64 {
        self.exp
    }
}

impl RegisteredClaims for RefreshClaims {
    fn issuer(&self) -> &str {
        &self.iss
    }
    fn audience(&self) -> &str {
        &self.aud
    }
    fn token_type(&self) -> TokenType {
        self.typ
    }
    fn expires_at(&self) -> i64 {
        self.exp
    }
}

/// What a verifier expects of the registered claims.
#[derive(Debug, Clone, Copy)]
pub struct Expectation<'a> {
    pub issuer: &'a str,
    pub audience: &'a str,
    pub token_type: TokenType,
}

impl Expectation<'_> {
    /// Issuer, audience and type first, expiry last. `now` of `None` skips
    /// the expiry check (used for logout of expired access tokens).
    ///
    /// # Errors
    /// The first claim that does not match.
    pub fn check<C: RegisteredClaims>(&self, claims: &C, now_unix_seconds: Option<i64>) -> Result<(), CodecError> {
        if claims.issuer() != self.issuer {
            return Err(CodecError::InvalidIssuer);
        }
        if claims.audience() != self.audience {
            return Err(CodecError::InvalidAudience);
        }
        if claims.token_type() != self.token_type {
            return Err(CodecError::InvalidType);
        }
        if let Some(now) = now_unix_seconds {
            if claims.expires_at() <= now {
                return Err(CodecError::Expired);
            }
        }
        Ok(())
    }
}
