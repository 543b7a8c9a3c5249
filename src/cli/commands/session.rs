use anyhow::{anyhow, Result};
use chrono::Duration;
use clap::{Arg, ArgMatches, Command};

use crate::session::SessionConfig;

pub const ARG_SESSION_HOURS: &str = "session-hours";
pub const ARG_SESSION_MAX_AGE_DAYS: &str = "session-max-age-days";
pub const ARG_SESSION_IDLE_MINUTES: &str = "session-idle-minutes";
pub const ARG_SESSION_CEILING: &str = "session-ceiling";

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub hours: i64,
    pub max_age_days: i64,
    pub idle_minutes: i64,
    pub ceiling: usize,
}

impl Options {
    /// # Errors
    /// Returns an error if the default duration exceeds the maximum age.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let options = Self {
            hours: matches.get_one::<i64>(ARG_SESSION_HOURS).copied().unwrap_or(24),
            max_age_days: matches.get_one::<i64>(ARG_SESSION_MAX_AGE_DAYS).copied().unwrap_or(30),
            idle_minutes: matches.get_one::<i64>(ARG_SESSION_IDLE_MINUTES).copied().unwrap_or(30),
            ceiling: matches.get_one::<usize>(ARG_SESSION_CEILING).copied().unwrap_or(5),
        };
        if Duration::hours(options.hours) > Duration::days(options.max_age_days) {
            return Err(anyhow!(
                "--{ARG_SESSION_HOURS} must not exceed --{ARG_SESSION_MAX_AGE_DAYS}"
            ));
        }
        Ok(options)
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new()
            .with_default_duration(Duration::hours(self.hours))
            .with_max_age(Duration::days(self.max_age_days))
            .with_idle_window(Duration::minutes(self.idle_minutes))
            .with_ceiling(self.ceiling)
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_HOURS)
                .long(ARG_SESSION_HOURS)
                .help("Default session lifetime in hours")
                .env("WARDEN_SESSION_HOURS")
                .default_value("24")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_MAX_AGE_DAYS)
                .long(ARG_SESSION_MAX_AGE_DAYS)
                .help("Absolute session age limit in days, extensions included")
                .env("WARDEN_SESSION_MAX_AGE_DAYS")
                .default_value("30")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_IDLE_MINUTES)
                .long(ARG_SESSION_IDLE_MINUTES)
                .help("Minutes without activity before a session is idle")
                .env("WARDEN_SESSION_IDLE_MINUTES")
                .default_value("30")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_CEILING)
                .long(ARG_SESSION_CEILING)
                .help("Concurrent sessions allowed per principal")
                .env("WARDEN_SESSION_CEILING")
                .default_value("5")
                .value_parser(clap::value_parser!(usize)),
        )
}
