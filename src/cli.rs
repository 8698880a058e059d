//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Tool Gate - authenticate, authorize and audit tool calls
#[derive(Parser, Debug)]
#[command(name = "tool-gate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOOL_GATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "TOOL_GATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOOL_GATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Verify a credential and print the resulting principal
    Whoami {
        /// Bearer credential (with or without the `Bearer ` prefix)
        #[arg(long, env = "TOOL_GATE_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Run the full authorization for one tool call and print the decision
    Check {
        /// Bearer credential (with or without the `Bearer ` prefix)
        #[arg(long, env = "TOOL_GATE_TOKEN", hide_env_values = true)]
        token: String,

        /// Tool name
        #[arg(long)]
        tool: String,

        /// Tool parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Request a commit instead of a dry run
        #[arg(long)]
        commit: bool,

        /// Confirmation value accompanying a commit
        #[arg(long)]
        confirmation: Option<String>,
    },

    /// Policy rule commands
    #[command(subcommand)]
    Policy(PolicyCommand),

    /// Key set commands
    #[command(subcommand)]
    Keys(KeysCommand),
}

/// Policy subcommands
#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    /// Validate a policy file, or the configured rules when no file is given
    Validate {
        /// Path to policy file (YAML or JSON)
        file: Option<PathBuf>,
    },

    /// List the configured rules
    List,
}

/// Key set subcommands
#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// Load the key set and print the cache state
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_parses_flags() {
        let cli = Cli::parse_from([
            "tool-gate",
            "--config",
            "gate.yaml",
            "check",
            "--token",
            "abc",
            "--tool",
            "create_site",
            "--commit",
            "--confirmation",
            "CONFIRM",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("gate.yaml")));
        match cli.command {
            Command::Check {
                tool,
                commit,
                confirmation,
                params,
                ..
            } => {
                assert_eq!(tool, "create_site");
                assert!(commit);
                assert_eq!(confirmation.as_deref(), Some("CONFIRM"));
                assert_eq!(params, "{}");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn policy_validate_file_is_optional() {
        let cli = Cli::parse_from(["tool-gate", "policy", "validate"]);
        assert!(matches!(
            cli.command,
            Command::Policy(PolicyCommand::Validate { file: None })
        ));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
