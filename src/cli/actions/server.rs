use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::SecretString;
use tracing::{debug, info};

use crate::api;
use crate::auth::AuthService;
use crate::cli::commands::{auth, rate_limit, session};
use crate::credential::CredentialHasher;
use crate::rate_limit::CounterRateLimiter;
use crate::store::postgres::{self, PostgresStore};
use crate::token::TokenSigner;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: SecretString,
    pub cleanup_interval: Duration,
    pub auth: auth::Options,
    pub session: session::Options,
    pub rate_limit: rate_limit::Options,
}

/// Wire the Postgres stores into an [`AuthService`] and serve.
///
/// # Errors
/// Returns an error if the signing key is malformed, the database is
/// unreachable or the server fails.
pub async fn execute(args: Args) -> Result<()> {
    let signer = TokenSigner::from_secret(&args.auth.signing_key).context("Invalid token signing key")?;
    let kid = signer.kid().to_string();
    let hasher = CredentialHasher::new(args.auth.pepper.clone()).context("Failed to build credential hasher")?;

    let pool = postgres::connect(&args.dsn).await?;
    let store = PostgresStore::new(pool);

    let rate_limiter = CounterRateLimiter::new(store.clone(), args.rate_limit.rate_limit_config());
    debug!(
        environment = %args.rate_limit.environment,
        enabled = args.rate_limit.enabled,
        "Rate limiter configured"
    );

    let service = AuthService::builder(store.auth_stores(), signer)
        .with_config(args.auth.auth_config())
        .with_token_config(args.auth.token_config())
        .with_session_config(args.session.session_config())
        .with_hasher(hasher)
        .with_rate_limiter(Arc::new(rate_limiter))
        .build()
        .context("Failed to build authentication service")?;
    info!(kid = %kid, "Authentication service ready");

    let result = api::serve(args.port, store, Arc::new(service), args.cleanup_interval).await;
    crate::cli::telemetry::shutdown_tracer();
    result
}
