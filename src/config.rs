// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Command-line flags, environment overrides and logging setup.
// Author: Lukas Bower

use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use log::LevelFilter;

use crate::srv::SrvDir;

/// Service name used when `-s` is not given.
pub const DEFAULT_SERVICE: &str = "timefs";

/// Command-line flags of the `timefs` binary.
#[derive(Debug, Clone, Parser, PartialEq, Eq)]
#[command(author = "Lukas Bower", version, about = "Clock file server over 9P", long_about = None)]
pub struct Cli {
    /// Name to post the service under.
    #[arg(short = 's', value_name = "NAME", default_value = DEFAULT_SERVICE)]
    pub service: String,

    /// Enable debug logging.
    #[arg(short = 'd', default_value_t = false)]
    pub debug: bool,

    /// Enable verbose logging, including every 9P message.
    #[arg(short = 'D', default_value_t = false)]
    pub verbose: bool,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Service name.
    pub service: String,
    /// Default log filter; `RUST_LOG` still takes precedence.
    pub log_level: LevelFilter,
    /// Rendezvous directory for the posted service.
    pub srv_dir: PathBuf,
}

impl Config {
    /// Combine parsed flags with the environment.
    #[must_use]
    pub fn from_cli(cli: &Cli) -> Self {
        let log_level = if cli.verbose {
            LevelFilter::Trace
        } else if cli.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        };
        Self {
            service: cli.service.clone(),
            log_level,
            srv_dir: SrvDir::from_env().dir().to_path_buf(),
        }
    }
}

/// Install the global logger.
///
/// Calling it again is harmless; only the first call takes effect.
pub fn init_logging(level: LevelFilter) {
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("timefs").chain(args.iter().copied()))
            .expect("valid flags")
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.service, "timefs");
        assert!(!cli.debug);
        assert!(!cli.verbose);
        assert_eq!(Config::from_cli(&cli).log_level, LevelFilter::Warn);
    }

    #[test]
    fn service_name_and_levels() {
        let cli = parse(&["-s", "clock", "-d"]);
        assert_eq!(cli.service, "clock");
        assert_eq!(Config::from_cli(&cli).log_level, LevelFilter::Debug);
        let cli = parse(&["-D"]);
        assert_eq!(Config::from_cli(&cli).log_level, LevelFilter::Trace);
        let cli = parse(&["-d", "-D"]);
        assert_eq!(Config::from_cli(&cli).log_level, LevelFilter::Trace);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let args = ["timefs", "-x"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    #[serial]
    fn srv_dir_follows_environment() {
        std::env::set_var(crate::srv::SRV_DIR_ENV, "/run/timefs-test");
        let config = Config::from_cli(&parse(&[]));
        assert_eq!(config.srv_dir, PathBuf::from("/run/timefs-test"));
        std::env::remove_var(crate::srv::SRV_DIR_ENV);
    }
}
