//! Command line definition for the `mimir` binary

use crate::config::parse_override;
use crate::tracing::{LogLevel, TracingFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Top-level command line.
#[derive(Parser, Debug)]
#[command(name = "mimir")]
#[command(about = "Build-artifact cache daemon and client")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file, instead of `<basedir>/mimir.toml`.
    #[arg(long, global = true, value_name = "FILE", help = "Configuration file")]
    pub config: Option<PathBuf>,

    /// Property overrides.
    #[arg(
        short = 'D',
        global = true,
        value_name = "KEY=VALUE",
        value_parser = parse_override,
        action = clap::ArgAction::Append,
        help = "Override a configuration property (repeatable)"
    )]
    pub properties: Vec<(String, String)>,

    /// Logging verbosity level.
    #[arg(
        short = 'L',
        long,
        global = true,
        env = "MIMIR_LOG",
        value_enum,
        default_value = "warn",
        help = "Set logging level"
    )]
    pub level: LogLevel,

    /// Log output format.
    #[arg(
        long,
        global = true,
        value_enum,
        default_value = "pretty",
        help = "Log output format"
    )]
    pub format: TracingFormat,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the daemon in the foreground.
    #[command(about = "Run the cache daemon in the foreground")]
    Daemon,

    /// Look a key up.
    #[command(about = "Look a key up and print its metadata and checksums")]
    Locate {
        /// Key, e.g. `mimir:file:bucket:path/to/file`
        #[arg(value_name = "KEY")]
        key: String,
    },

    /// Copy a cached object to a path.
    #[command(about = "Materialize a cached object at a path")]
    Transfer {
        /// Key to materialize
        #[arg(value_name = "KEY")]
        key: String,
        /// Destination file
        #[arg(value_name = "DEST")]
        dest: PathBuf,
    },

    /// Store a file.
    #[command(about = "Store a file under a key")]
    Store {
        /// Key to store under
        #[arg(value_name = "KEY")]
        key: String,
        /// File to store
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// List checksum algorithms.
    #[command(about = "List the checksum algorithms of the system node")]
    Checksums,

    /// Populate the cache from a bundle.
    #[command(about = "Populate the cache from a Maven-layout bundle directory")]
    Preseed {
        /// Bundle root
        #[arg(value_name = "BUNDLE")]
        bundle: PathBuf,
        /// Keys to copy
        #[arg(value_name = "KEY", required = true)]
        keys: Vec<String>,
    },

    /// Ask the daemon to exit.
    #[command(about = "Shut the running daemon down")]
    Shutdown,

    /// Report whether a daemon is running.
    #[command(about = "Check whether a daemon answers on the socket")]
    Status,
}

/// Parse the process arguments.
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_and_globals() {
        let cli = Cli::try_parse_from([
            "mimir",
            "locate",
            "mimir:file:b:x",
            "-D",
            "mimir.daemon.workers=2",
            "-Dmimir.basedir=/tmp/m",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Commands::Locate {
                key: "mimir:file:b:x".to_string()
            }
        );
        assert_eq!(cli.properties.len(), 2);
        assert_eq!(cli.properties[1], ("mimir.basedir".to_string(), "/tmp/m".to_string()));
        assert_eq!(cli.format, TracingFormat::Json);
    }

    #[test]
    fn test_bad_override_is_rejected() {
        assert!(Cli::try_parse_from(["mimir", "status", "-D", "novalue"]).is_err());
    }

    #[test]
    fn test_preseed_needs_keys() {
        assert!(Cli::try_parse_from(["mimir", "preseed", "/bundle"]).is_err());
    }
}
