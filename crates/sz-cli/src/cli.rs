//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Idle session finalizer.
///
/// Appends device events to per-device logs and, once a device has been
/// quiet for the session delay, claims its log and forwards the session
/// exactly once.
#[derive(Debug, Parser)]
#[command(name = "sz", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Append an intake batch (JSON) to the device logs.
    Ingest {
        /// Read the batch from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Run one finalization workflow now.
    Tick,

    /// Resume pending workflows, then tick on a fixed interval until Ctrl-C.
    Run,

    /// Resume pending workflows once.
    Recover,

    /// Show pending device logs and unfinished or dropped workflows.
    Status,

    /// Print a sample intake batch.
    Sample {
        /// Number of devices in the batch.
        #[arg(long, default_value_t = 5)]
        devices: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_ingest_file_and_global_config() {
        let cli = Cli::parse_from(["sz", "ingest", "--file", "batch.json", "-c", "sz.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("sz.toml")));
        assert!(matches!(
            cli.command,
            Some(Commands::Ingest { file: Some(ref f) }) if f == &PathBuf::from("batch.json")
        ));
    }

    #[test]
    fn sample_defaults_to_five_devices() {
        let cli = Cli::parse_from(["sz", "sample"]);
        assert!(matches!(cli.command, Some(Commands::Sample { devices: 5 })));
    }
}
