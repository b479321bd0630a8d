//! Command-line interface for carelog.
//!
//! This module provides the CLI structure and command handlers for the
//! `carelog` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, ConsentCommand, DeleteCommand, ListCommand, StatusCommand};

/// carelog - Local-first clinical record store with encrypted sync
///
/// Assessment records live in a local database that works fully offline.
/// A linked device additionally mirrors its records, encrypted on-device,
/// to a private remote location shared by the account's other devices.
#[derive(Debug, Parser)]
#[command(name = "carelog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show store and sync status
    Status(StatusCommand),

    /// List subjects, or one subject's records
    List(ListCommand),

    /// Delete a record (propagates to linked devices)
    Delete(DeleteCommand),

    /// Link this device to a remote account and run an initial sync
    Link,

    /// Unlink this device, removing the remote copy
    Unlink,

    /// Run a full sync now
    Sync,

    /// Manage export consent
    #[command(subcommand)]
    Consent(ConsentCommand),

    /// Submit consented records to the export endpoint
    Export,

    /// View configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "carelog");
    }

    #[test]
    fn test_cli_verify() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity_quiet() {
        let cli = Cli::try_parse_from(["carelog", "-q", "status"]).unwrap();
        assert_eq!(cli.verbosity(), crate::logging::Verbosity::Quiet);
    }

    #[test]
    fn test_verbosity_normal() {
        let cli = Cli::try_parse_from(["carelog", "status"]).unwrap();
        assert_eq!(cli.verbosity(), crate::logging::Verbosity::Normal);
    }

    #[test]
    fn test_verbosity_verbose() {
        let cli = Cli::try_parse_from(["carelog", "-v", "status"]).unwrap();
        assert_eq!(cli.verbosity(), crate::logging::Verbosity::Verbose);
    }

    #[test]
    fn test_verbosity_trace() {
        let cli = Cli::try_parse_from(["carelog", "-vv", "status"]).unwrap();
        assert_eq!(cli.verbosity(), crate::logging::Verbosity::Trace);
    }

    #[test]
    fn test_parse_status_json() {
        let cli = Cli::try_parse_from(["carelog", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Status(StatusCommand { json: true })));
    }

    #[test]
    fn test_parse_list_with_subject() {
        let cli = Cli::try_parse_from(["carelog", "list", "-s", "subject-1"]).unwrap();
        match cli.command {
            Command::List(cmd) => assert_eq!(cmd.subject.as_deref(), Some("subject-1")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete() {
        let cli = Cli::try_parse_from(["carelog", "delete", "abc-123"]).unwrap();
        match cli.command {
            Command::Delete(cmd) => assert_eq!(cmd.record_id, "abc-123"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_consent_grant() {
        let cli = Cli::try_parse_from(["carelog", "consent", "grant"]).unwrap();
        assert!(matches!(cli.command, Command::Consent(ConsentCommand::Grant)));
    }

    #[test]
    fn test_parse_sync() {
        let cli = Cli::try_parse_from(["carelog", "sync"]).unwrap();
        assert!(matches!(cli.command, Command::Sync));
    }

    #[test]
    fn test_parse_with_config() {
        let cli = Cli::try_parse_from(["carelog", "-c", "/custom/config.toml", "status"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
    }
}
