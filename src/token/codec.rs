//! Compact `header.claims.signature` tokens signed with Ed25519.
//!
//! All three segments are base64url without padding. The header names the
//! algorithm (`EdDSA`) and the key id, so verifiers can hold several keys
//! while signing keys rotate.

use std::collections::HashMap;

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ALG: &str = "EdDSA";
pub const TYP: &str = "JWT";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid signing key")]
    InvalidKey,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("unexpected token type")]
    InvalidType,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: DeserializeOwned>(s: &str) -> Result<T, CodecError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| CodecError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Key id: first 16 hex characters of the SHA-256 of the public key.
#[must_use]
pub fn key_id(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.to_bytes());
    hex::encode(&digest[..8])
}

pub struct TokenSigner {
    kid: String,
    signing_key: SigningKey,
}

impl TokenSigner {
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self {
            kid: key_id(&signing_key.verifying_key()),
            signing_key,
        }
    }

    /// Parse a base64url (unpadded) encoded 32 byte seed.
    ///
    /// # Errors
    /// `CodecError::InvalidKey` if the value does not decode to 32 bytes.
    pub fn from_secret(secret: &SecretString) -> Result<Self, CodecError> {
        let bytes = Base64UrlUnpadded::decode_vec(secret.expose_secret().trim())
            .map_err(|_| CodecError::InvalidKey)?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| CodecError::InvalidKey)?;
        Ok(Self::from_seed(&seed))
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Verifier trusting only this signer's key.
    #[must_use]
    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier::new().with_key(self.verifying_key())
    }

    /// # Errors
    /// Fails if the claims cannot be encoded as JSON.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, CodecError> {
        let header = TokenHeader {
            alg: ALG.to_string(),
            typ: TYP.to_string(),
            kid: self.kid.clone(),
        };
        let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(claims)?);
        let signature = self.signing_key.sign(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_bytes());
        Ok(format!("{signing_input}.{signature_b64}"))
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Set of trusted public keys indexed by key id.
#[derive(Debug, Clone, Default)]
pub struct TokenVerifier {
    keys: HashMap<String, VerifyingKey>,
}

impl TokenVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_key(mut self, verifying_key: VerifyingKey) -> Self {
        self.keys.insert(key_id(&verifying_key), verifying_key);
        self
    }

    /// Check structure, algorithm, key id and signature, then decode the
    /// claims. Claim semantics (issuer, expiry, ...) are the caller's job.
    ///
    /// # Errors
    /// Any structural or signature failure.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, CodecError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(CodecError::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(CodecError::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(CodecError::TokenFormat)?;
        if parts.next().is_some() {
            return Err(CodecError::TokenFormat);
        }

        let header: TokenHeader = b64d_json(header_b64)?;
        if header.alg != ALG {
            return Err(CodecError::UnsupportedAlg(header.alg));
        }
        let verifying_key = self
            .keys
            .get(&header.kid)
            .ok_or_else(|| CodecError::UnknownKid(header.kid.clone()))?;

        let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| CodecError::Base64)?;
        let signature_bytes: [u8; 64] = signature_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::InvalidSignature)?;
        let signature = Signature::from_bytes(&signature_bytes);
        let signing_input = format!("{header_b64}.{claims_b64}");
        verifying_key
            .verify_strict(signing_input.as_bytes(), &signature)
            .map_err(|_| CodecError::InvalidSignature)?;

        b64d_json(claims_b64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn sign_and_verify() -> Result<(), CodecError> {
        let signer = TokenSigner::from_seed(&[7u8; 32]);
        let token = signer.sign(&json!({"sub": "alice"}))?;
        assert_eq!(token.split('.').count(), 3);

        let claims: Value = signer.verifier().verify(&token)?;
        assert_eq!(claims["sub"], "alice");
        Ok(())
    }

    #[test]
    fn header_names_algorithm_and_kid() -> Result<(), CodecError> {
        let signer = TokenSigner::from_seed(&[7u8; 32]);
        let token = signer.sign(&json!({}))?;
        let header_b64 = token.split('.').next().ok_or(CodecError::TokenFormat)?;
        let header: TokenHeader = b64d_json(header_b64)?;
        assert_eq!(header.alg, "EdDSA");
        assert_eq!(header.typ, "JWT");
        assert_eq!(header.kid, signer.kid());
        assert_eq!(header.kid.len(), 16);
        Ok(())
    }

    #[test]
    fn rejects_unknown_kid() -> Result<(), CodecError> {
        let signer = TokenSigner::from_seed(&[7u8; 32]);
        let other = TokenSigner::from_seed(&[9u8; 32]);
        let token = signer.sign(&json!({}))?;
        let result: Result<Value, _> = other.verifier().verify(&token);
        assert!(matches!(result, Err(CodecError::UnknownKid(_))));
        Ok(())
    }

    #[test]
    fn rejects_tampered_claims() -> Result<(), CodecError> {
        let signer = TokenSigner::from_seed(&[7u8; 32]);
        let token = signer.sign(&json!({"sub": "alice"}))?;
        let forged_claims = b64e_json(&json!({"sub": "mallory"}))?;
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged_claims;
        let forged = parts.join(".");
        let result: Result<Value, _> = signer.verifier().verify(&forged);
        assert!(matches!(result, Err(CodecError::InvalidSignature)));
        Ok(())
    }

    #[test]
    fn rejects_other_algorithms_and_garbage() -> Result<(), CodecError> {
        let signer = TokenSigner::from_seed(&[7u8; 32]);
        let header = b64e_json(&json!({"alg": "none", "typ": "JWT", "kid": signer.kid()}))?;
        let claims = b64e_json(&json!({}))?;
        let unsigned = format!("{header}.{claims}.");
        let result: Result<Value, _> = signer.verifier().verify(&unsigned);
        assert!(matches!(result, Err(CodecError::UnsupportedAlg(_))));

        let result: Result<Value, _> = signer.verifier().verify("not-a-token");
        assert!(matches!(result, Err(CodecError::TokenFormat)));
        Ok(())
    }

    #[test]
    fn verifier_accepts_several_keys() -> Result<(), CodecError> {
        let current = TokenSigner::from_seed(&[1u8; 32]);
        let previous = TokenSigner::from_seed(&[2u8; 32]);
        let verifier = TokenVerifier::new()
            .with_key(current.verifying_key())
            .with_key(previous.verifying_key());
        let _: Value = verifier.verify(&current.sign(&json!({}))?)?;
        let _: Value = verifier.verify(&previous.sign(&json!({}))?)?;
        Ok(())
    }

    #[test]
    fn signer_from_secret() -> Result<(), CodecError> {
        let encoded = Base64UrlUnpadded::encode_string(&[7u8; 32]);
        let signer = TokenSigner::from_secret(&SecretString::from(encoded))?;
        assert_eq!(signer.kid(), TokenSigner::from_seed(&[7u8; 32]).kid());

        let short = SecretString::from("c2hvcnQ".to_string());
        assert!(matches!(TokenSigner::from_secret(&short), Err(CodecError::InvalidKey)));
        assert!(!format!("{signer:?}").contains("signing_key"));
        Ok(())
    }
}
