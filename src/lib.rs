//! # Warden (authentication, session security and authorization core)
//!
//! `warden` owns the security-critical decisions of an identity service:
//! password credential verification with account lockout, role-based
//! permission resolution with inheritance, signed access/refresh token
//! issuance with rotation, and server-side session lifecycle management.
//!
//! ## Credentials
//!
//! Secrets are checked against a [`credential::CredentialPolicy`] before they
//! are stored and hashed with Argon2id. Unknown identifiers still run a
//! dummy verification so the response time does not reveal whether an
//! account exists.
//!
//! ## Sessions
//!
//! Sessions are keyed by the SHA-256 of a random token that is handed to the
//! client exactly once. The [`session::SessionGuard`] binds each session to
//! its origin (IP and client signature), rotates identifiers on privilege
//! changes and caps concurrent sessions per principal.
//!
//! ## Authorization
//!
//! Permissions are `resource:action[:scope]` codes granted through roles
//! (with single-parent inheritance) or directly. Wildcards `resource:*`,
//! `*:action`, `*:*` and `system:*` are honoured; superusers bypass checks.
//!
//! ## Orchestration
//!
//! [`auth::AuthService`] composes the above into login, refresh, logout and
//! authorize flows. Any failure after a session or token was created revokes
//! what was created before the error is returned.

pub mod api;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod credential;
pub mod error;
pub mod events;
pub mod notify;
pub mod permission;
pub mod principal;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod token;
pub mod utils;

pub use error::{AuthError, StoreError};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }
}
