//! Command-line interface handling for the Statz service.
//!
//! Options given here override the matching configuration file settings.

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use std::path::PathBuf;

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Read JSON requests from stdin until EOF or a signal.
    Serve,
    /// Hammer the service with synthetic updates and report throughput.
    Stress { iterations: u64, players: usize },
}

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the database path
    pub database: Option<PathBuf>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    pub command: CliCommand,
}

fn command() -> Command {
    Command::new("statz")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Write-behind player statistics service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("statz.toml"),
        )
        .arg(
            Arg::new("database")
                .short('d')
                .long("database")
                .value_name("FILE")
                .help("SQLite database path"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .subcommand(Command::new("serve").about("Serve newline-delimited JSON requests on stdin (default)"))
        .subcommand(
            Command::new("stress")
                .about("Run a synthetic load test against the configured store")
                .arg(
                    Arg::new("iterations")
                        .short('n')
                        .long("iterations")
                        .value_name("COUNT")
                        .value_parser(value_parser!(u64))
                        .default_value("10000"),
                )
                .arg(
                    Arg::new("players")
                        .short('p')
                        .long("players")
                        .value_name("COUNT")
                        .value_parser(value_parser!(usize))
                        .default_value("38"),
                ),
        )
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::try_parse_from(std::env::args_os()).unwrap_or_else(|e| e.exit())
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = command().try_get_matches_from(args)?;
        Ok(Self::from_matches(&matches))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        let command = match matches.subcommand() {
            Some(("stress", sub)) => CliCommand::Stress {
                iterations: sub.get_one::<u64>("iterations").copied().unwrap_or(10_000),
                players: sub.get_one::<usize>("players").copied().unwrap_or(38),
            },
            _ => CliCommand::Serve,
        };

        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("statz.toml")),
            database: matches.get_one::<String>("database").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let args = CliArgs::try_parse_from(["statz"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("statz.toml"));
        assert_eq!(args.command, CliCommand::Serve);
        assert!(args.database.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides_and_stress() {
        let args = CliArgs::try_parse_from([
            "statz", "-c", "custom.toml", "-d", "data/stats.db", "-l", "debug", "--json-logs", "stress", "-n",
            "500", "--players", "4",
        ])
        .unwrap();

        assert_eq!(args.config_path, PathBuf::from("custom.toml"));
        assert_eq!(args.database, Some(PathBuf::from("data/stats.db")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert_eq!(
            args.command,
            CliCommand::Stress {
                iterations: 500,
                players: 4
            }
        );
    }

    #[test]
    fn test_rejects_bad_iteration_count() {
        assert!(CliArgs::try_parse_from(["statz", "stress", "-n", "many"]).is_err());
    }
}
