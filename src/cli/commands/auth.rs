use anyhow::{anyhow, Result};
use chrono::Duration;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::auth::AuthConfig;
use crate::principal::LockoutPolicy;
use crate::token::TokenConfig;

pub const ARG_TOKEN_SIGNING_KEY: &str = "token-signing-key";
pub const ARG_PASSWORD_PEPPER: &str = "password-pepper";
pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_TOKEN_AUDIENCE: &str = "token-audience";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl-seconds";
pub const ARG_LOCKOUT_THRESHOLD: &str = "lockout-threshold";
pub const ARG_LOCKOUT_MINUTES: &str = "lockout-minutes";
pub const ARG_RESET_TOKEN_TTL: &str = "reset-token-ttl-seconds";
pub const ARG_VERIFICATION_TOKEN_TTL: &str = "verification-token-ttl-seconds";

#[derive(Debug, Clone)]
pub struct Options {
    pub signing_key: SecretString,
    pub pepper: Option<SecretString>,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub lockout_threshold: u32,
    pub lockout_minutes: i64,
    pub reset_ttl_seconds: i64,
    pub verification_ttl_seconds: i64,
}

impl Options {
    /// Parse credential and token arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing key is missing or a duration is not
    /// positive.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let signing_key = matches
            .get_one::<String>(ARG_TOKEN_SIGNING_KEY)
            .filter(|v| !v.trim().is_empty())
            .map(|v| SecretString::from(v.clone()))
            .ok_or_else(|| anyhow!("missing required argument: --{ARG_TOKEN_SIGNING_KEY}"))?;
        let pepper = matches
            .get_one::<String>(ARG_PASSWORD_PEPPER)
            .filter(|v| !v.is_empty())
            .map(|v| SecretString::from(v.clone()));

        let positive = |id: &str| -> Result<i64> {
            let value = matches.get_one::<i64>(id).copied().unwrap_or(0);
            if value > 0 {
                Ok(value)
            } else {
                Err(anyhow!("--{id} must be positive"))
            }
        };

        Ok(Self {
            signing_key,
            pepper,
            issuer: matches
                .get_one::<String>(ARG_TOKEN_ISSUER)
                .cloned()
                .unwrap_or_else(|| "warden".to_string()),
            audience: matches
                .get_one::<String>(ARG_TOKEN_AUDIENCE)
                .cloned()
                .unwrap_or_else(|| "warden-api".to_string()),
            access_ttl_seconds: positive(ARG_ACCESS_TOKEN_TTL)?,
            refresh_ttl_seconds: positive(ARG_REFRESH_TOKEN_TTL)?,
            lockout_threshold: matches.get_one::<u32>(ARG_LOCKOUT_THRESHOLD).copied().unwrap_or(5),
            lockout_minutes: positive(ARG_LOCKOUT_MINUTES)?,
            reset_ttl_seconds: positive(ARG_RESET_TOKEN_TTL)?,
            verification_ttl_seconds: positive(ARG_VERIFICATION_TOKEN_TTL)?,
        })
    }

    #[must_use]
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig::new()
            .with_lockout(
                LockoutPolicy::new()
                    .with_threshold(self.lockout_threshold)
                    .with_duration(Duration::minutes(self.lockout_minutes)),
            )
            .with_reset_token_ttl(Duration::seconds(self.reset_ttl_seconds))
            .with_verification_token_ttl(Duration::seconds(self.verification_ttl_seconds))
    }

    #[must_use]
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig::new()
            .with_issuer(self.issuer.clone())
            .with_audience(self.audience.clone())
            .with_access_ttl(Duration::seconds(self.access_ttl_seconds))
            .with_refresh_ttl(Duration::seconds(self.refresh_ttl_seconds))
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_secret_args(command);
    let command = with_token_args(command);
    with_lockout_args(command)
}

fn with_secret_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_SIGNING_KEY)
                .long(ARG_TOKEN_SIGNING_KEY)
                .help("Ed25519 seed used to sign tokens (base64url, 32 bytes)")
                .env("WARDEN_TOKEN_SIGNING_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_PASSWORD_PEPPER)
                .long(ARG_PASSWORD_PEPPER)
                .help("Secret mixed into every password hash")
                .env("WARDEN_PASSWORD_PEPPER")
                .hide_env_values(true),
        )
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("Issuer claim of minted tokens")
                .env("WARDEN_TOKEN_ISSUER")
                .default_value("warden"),
        )
        .arg(
            Arg::new(ARG_TOKEN_AUDIENCE)
                .long(ARG_TOKEN_AUDIENCE)
                .help("Audience claim of minted tokens")
                .env("WARDEN_TOKEN_AUDIENCE")
                .default_value("warden-api"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token TTL in seconds")
                .env("WARDEN_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token TTL in seconds")
                .env("WARDEN_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_lockout_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOCKOUT_THRESHOLD)
                .long(ARG_LOCKOUT_THRESHOLD)
                .help("Consecutive failures that lock an account")
                .env("WARDEN_LOCKOUT_THRESHOLD")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_MINUTES)
                .long(ARG_LOCKOUT_MINUTES)
                .help("Lock duration in minutes")
                .env("WARDEN_LOCKOUT_MINUTES")
                .default_value("30")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_RESET_TOKEN_TTL)
                .long(ARG_RESET_TOKEN_TTL)
                .help("Password reset token TTL in seconds")
                .env("WARDEN_RESET_TOKEN_TTL_SECONDS")
                .default_value("3600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_VERIFICATION_TOKEN_TTL)
                .long(ARG_VERIFICATION_TOKEN_TTL)
                .help("Email verification token TTL in seconds")
                .env("WARDEN_VERIFICATION_TOKEN_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
}
