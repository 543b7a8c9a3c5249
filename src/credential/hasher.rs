//! Argon2id hashing with an optional server-side pepper.
//!
//! Hashing is CPU bound, so both hash and verify run on the blocking pool.

use argon2::{
    password_hash::SaltString, Algorithm, Argon2, Params, PasswordHash, PasswordHasher,
    PasswordVerifier, Version,
};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

use crate::error::AuthError;

/// Secret hashed once at startup and verified whenever the identifier is
/// unknown, so that path costs the same as a wrong secret.
const DUMMY_SECRET: &str = "warden-dummy-secret-for-timing";

#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
    pepper: Option<SecretString>,
    dummy_hash: String,
}

impl CredentialHasher {
    /// Hasher with the Argon2 default cost parameters.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if the pepper is rejected by Argon2.
    pub fn new(pepper: Option<SecretString>) -> Result<Self, AuthError> {
        Self::with_params(Params::default(), pepper)
    }

    /// Minimal cost parameters; only suitable for tests.
    ///
    /// # Errors
    /// Returns `AuthError::Configuration` if the parameters are rejected.
    pub fn low_cost() -> Result<Self, AuthError> {
        let params = Params::new(Params::MIN_M_COST, 1, 1, None)
            .map_err(|err| AuthError::Configuration(format!("invalid Argon2 params: {err}")))?;
        Self::with_params(params, None)
    }

    /// # Errors
    /// Returns `AuthError::Configuration` if Argon2 cannot be initialized.
    pub fn with_params(params: Params, pepper: Option<SecretString>) -> Result<Self, AuthError> {
        let dummy_hash = hash_blocking(&params, pepper.as_ref(), DUMMY_SECRET)
            .map_err(|err| AuthError::Configuration(format!("failed to prepare hasher: {err}")))?;
        Ok(Self {
            params,
            pepper,
            dummy_hash,
        })
    }

    /// Hash a secret into a PHC string.
    ///
    /// # Errors
    /// Returns `AuthError::Internal` if hashing fails.
    pub async fn hash(&self, secret: &SecretString) -> Result<String, AuthError> {
        let params = self.params.clone();
        let pepper = self.pepper.clone();
        let secret = secret.clone();
        tokio::task::spawn_blocking(move || {
            hash_blocking(&params, pepper.as_ref(), secret.expose_secret())
        })
        .await
        .map_err(|err| AuthError::Internal(format!("hashing task failed: {err}")))?
    }

    /// Verify a secret against a stored PHC string.
    ///
    /// # Errors
    /// Returns `AuthError::Internal` if the stored hash cannot be parsed.
    pub async fn verify(&self, secret: &SecretString, stored_hash: &str) -> Result<bool, AuthError> {
        let pepper = self.pepper.clone();
        let secret = secret.clone();
        let stored_hash = stored_hash.to_string();
        tokio::task::spawn_blocking(move || {
            verify_blocking(pepper.as_ref(), secret.expose_secret(), &stored_hash)
        })
        .await
        .map_err(|err| AuthError::Internal(format!("verification task failed: {err}")))?
    }

    /// Burn the same work as a real verification. The result is discarded.
    pub async fn verify_dummy(&self, secret: &SecretString) {
        let _ = self.verify(secret, &self.dummy_hash).await;
    }
}

impl std::fmt::Debug for CredentialHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialHasher")
            .field("m_cost", &self.params.m_cost())
            .field("t_cost", &self.params.t_cost())
            .field("p_cost", &self.params.p_cost())
            .field("pepper", &self.pepper.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

fn argon2<'key>(params: &Params, pepper: Option<&'key SecretString>) -> Result<Argon2<'key>, AuthError> {
    match pepper {
        Some(pepper) => Argon2::new_with_secret(
            pepper.expose_secret().as_bytes(),
            Algorithm::Argon2id,
            Version::V0x13,
            params.clone(),
        )
        .map_err(|_| AuthError::Internal("failed to initialize Argon2id".to_string())),
        None => Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone())),
    }
}

fn hash_blocking(params: &Params, pepper: Option<&SecretString>, secret: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2(params, pepper)?
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|_| AuthError::Internal("failed to hash secret".to_string()))?
        .to_string();
    Ok(hash)
}

fn verify_blocking(pepper: Option<&SecretString>, secret: &str, stored_hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|_| AuthError::Internal("stored credential hash is malformed".to_string()))?;
    // Cost parameters come from the PHC string; only the pepper is ours.
    let argon2 = argon2(&Params::default(), pepper)?;
    Ok(argon2.verify_password(secret.as_bytes(), &parsed).is_ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[tokio::test]
    async fn hash_then_verify() {
        let hasher = CredentialHasher::low_cost().unwrap();
        let hash = hasher.hash(&secret("Correct-Horse-9-Battery")).await.unwrap();
        assert!(hash.starts_with("$argon2id$v=19$"));
        assert!(hasher.verify(&secret("Correct-Horse-9-Battery"), &hash).await.unwrap());
        assert!(!hasher.verify(&secret("wrong"), &hash).await.unwrap());
    }

    #[tokio::test]
    async fn hashes_are_salted() {
        let hasher = CredentialHasher::low_cost().unwrap();
        let first = hasher.hash(&secret("same")).await.unwrap();
        let second = hasher.hash(&secret("same")).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn pepper_is_part_of_the_hash() {
        let params = Params::new(Params::MIN_M_COST, 1, 1, None).unwrap();
        let peppered =
            CredentialHasher::with_params(params.clone(), Some(secret("pepper-one"))).unwrap();
        let other = CredentialHasher::with_params(params, Some(secret("pepper-two"))).unwrap();
        let hash = peppered.hash(&secret("value")).await.unwrap();
        assert!(peppered.verify(&secret("value"), &hash).await.unwrap());
        assert!(!other.verify(&secret("value"), &hash).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_hash_is_an_error() {
        let hasher = CredentialHasher::low_cost().unwrap();
        assert!(hasher.verify(&secret("value"), "not-a-phc").await.is_err());
    }

    #[test]
    fn debug_redacts_pepper() {
        let params = Params::new(Params::MIN_M_COST, 1, 1, None).unwrap();
        let hasher = CredentialHasher::with_params(params, Some(secret("s3cr3t-pepper"))).unwrap();
        let rendered = format!("{hasher:?}");
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("***"));
    }
}
