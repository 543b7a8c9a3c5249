use clap::{builder::ValueParser, Arg, Command};

pub const ARG_VERBOSITY: &str = "verbosity";

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("WARDEN_LOG_LEVEL")
            .global(true)
            .action(clap::ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_numbers_are_accepted() {
        temp_env::with_vars([("WARDEN_LOG_LEVEL", Some("debug"))], || {
            let matches = with_args(Command::new("warden")).get_matches_from(vec!["warden"]);
            assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(3));
        });
        temp_env::with_vars([("WARDEN_LOG_LEVEL", Some("4"))], || {
            let matches = with_args(Command::new("warden")).get_matches_from(vec!["warden"]);
            assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(4));
        });
    }

    #[test]
    fn unknown_level_from_env_is_rejected() {
        temp_env::with_vars([("WARDEN_LOG_LEVEL", Some("loud"))], || {
            let result = with_args(Command::new("warden")).try_get_matches_from(vec!["warden"]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn repeated_flag_counts() {
        temp_env::with_vars([("WARDEN_LOG_LEVEL", None::<&str>)], || {
            let matches = with_args(Command::new("warden")).get_matches_from(vec!["warden", "-vvv"]);
            assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(3));
        });
    }
}
