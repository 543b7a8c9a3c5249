use clap::{builder::ValueParser, Arg, ArgAction, ArgMatches, Command};

use crate::rate_limit::{Environment, RateLimitConfig};

pub const ARG_ENVIRONMENT: &str = "environment";
pub const ARG_RATE_LIMIT_ENABLED: &str = "rate-limit-enabled";

#[must_use]
pub fn validator_environment() -> ValueParser {
    ValueParser::from(move |name: &str| -> std::result::Result<Environment, String> {
        Ok(Environment::from_name(name))
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub environment: Environment,
    pub enabled: bool,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            environment: matches
                .get_one::<Environment>(ARG_ENVIRONMENT)
                .copied()
                .unwrap_or(Environment::Production),
            enabled: matches.get_one::<bool>(ARG_RATE_LIMIT_ENABLED).copied().unwrap_or(true),
        }
    }

    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.environment).with_enabled(self.enabled)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Deployment environment: development, staging or production")
                .env("WARDEN_ENVIRONMENT")
                .default_value("production")
                .value_parser(validator_environment()),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_ENABLED)
                .long(ARG_RATE_LIMIT_ENABLED)
                .help("Enforce rate limits")
                .env("WARDEN_RATE_LIMIT_ENABLED")
                .default_value("true")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(bool)),
        )
}
