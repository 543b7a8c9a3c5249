//! Principals (accounts), their persistence boundary and credential
//! verification.

mod models;
mod repo;
mod service;

#[cfg(test)]
pub(crate) use models::test_principal;
pub use models::{
    LockoutPolicy, NewPrincipal, OneTimePurpose, OneTimeToken, Principal, PrincipalSummary,
};
pub use repo::{OneTimeTokenStore, PrincipalStore};
pub use service::CredentialVerifier;
