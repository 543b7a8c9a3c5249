pub mod auth;
pub mod logging;
pub mod rate_limit;
pub mod session;

use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        ValueParser,
    },
    Arg, ColorChoice, Command,
};

use crate::rate_limit::{EndpointCategory, Tier};

pub const CMD_SERVER: &str = "server";
pub const CMD_POLICY: &str = "policy";

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const ARG_CLEANUP_INTERVAL: &str = "cleanup-interval-seconds";
pub const ARG_CATEGORY: &str = "category";
pub const ARG_TIER: &str = "tier";

fn validator_category() -> ValueParser {
    ValueParser::from(|value: &str| value.parse::<EndpointCategory>())
}

fn validator_tier() -> ValueParser {
    ValueParser::from(|value: &str| value.parse::<Tier>())
}

fn server_command() -> Command {
    let command = Command::new(CMD_SERVER)
        .about("Serve the health endpoint and purge expired sessions")
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("WARDEN_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .env("WARDEN_DSN")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_CLEANUP_INTERVAL)
                .long(ARG_CLEANUP_INTERVAL)
                .help("Seconds between expired session and refresh token purges")
                .env("WARDEN_CLEANUP_INTERVAL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..)),
        );

    let command = auth::with_args(command);
    let command = session::with_args(command);
    rate_limit::with_args(command)
}

fn policy_command() -> Command {
    let command = Command::new(CMD_POLICY)
        .about("Print the effective rate limit for an endpoint category")
        .arg(
            Arg::new(ARG_CATEGORY)
                .help("login, registration, password_reset, read, write, upload, search or default")
                .required(true)
                .value_parser(validator_category()),
        )
        .arg(
            Arg::new(ARG_TIER)
                .long(ARG_TIER)
                .help("public, basic, premium, enterprise, admin or api-key")
                .default_value("public")
                .value_parser(validator_tier()),
        );
    rate_limit::with_args(command)
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("warden")
        .about("Authentication, session security and authorization core")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(server_command())
        .subcommand(policy_command());

    logging::with_args(command)
}
