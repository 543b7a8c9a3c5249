//! Maps parsed arguments to an [`Action`].

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use secrecy::SecretString;

use crate::cli::actions::{policy, server, Action};
use crate::cli::commands::{
    auth, rate_limit, session, ARG_CATEGORY, ARG_CLEANUP_INTERVAL, ARG_DSN, ARG_PORT, ARG_TIER, CMD_POLICY,
    CMD_SERVER,
};
use crate::rate_limit::{EndpointCategory, Tier};

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some((CMD_SERVER, sub)) => server_action(sub),
        Some((CMD_POLICY, sub)) => Ok(policy_action(sub)),
        Some((other, _)) => Err(anyhow!("unknown command: {other}")),
        None => Err(anyhow!("missing command")),
    }
}

fn server_action(matches: &ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --dsn")?;
    let cleanup_interval = Duration::from_secs(
        matches
            .get_one::<u64>(ARG_CLEANUP_INTERVAL)
            .copied()
            .unwrap_or(300),
    );

    Ok(Action::Server(server::Args {
        port,
        dsn,
        cleanup_interval,
        auth: auth::Options::parse(matches)?,
        session: session::Options::parse(matches)?,
        rate_limit: rate_limit::Options::parse(matches),
    }))
}

fn policy_action(matches: &ArgMatches) -> Action {
    Action::Policy(policy::Args {
        category: matches
            .get_one::<EndpointCategory>(ARG_CATEGORY)
            .copied()
            .unwrap_or(EndpointCategory::Default),
        tier: matches.get_one::<Tier>(ARG_TIER).copied().unwrap_or(Tier::Public),
        rate_limit: rate_limit::Options::parse(matches),
    })
}
