//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// MCP Hub - session-multiplexed MCP gateway
#[derive(Parser, Debug)]
#[command(name = "mcp-hub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_HUB_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_HUB_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_HUB_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_HUB_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_HUB_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP gateway (default)
    Serve,

    /// Serve a single session over stdin/stdout
    Stdio,

    /// Manage a named API key file
    #[command(subcommand)]
    Keys(KeysCommand),
}

/// Key file subcommands
#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// List key names with masked secrets
    List {
        /// Key file (JSON object of name -> key)
        #[arg(short, long, env = "MCP_HUB_KEY_FILE")]
        file: PathBuf,
    },

    /// Generate a key under a new name
    Add {
        /// Name to attribute requests to
        name: String,

        /// Key file (JSON object of name -> key)
        #[arg(short, long, env = "MCP_HUB_KEY_FILE")]
        file: PathBuf,
    },

    /// Print one key in full
    Show {
        /// Key name
        name: String,

        /// Key file (JSON object of name -> key)
        #[arg(short, long, env = "MCP_HUB_KEY_FILE")]
        file: PathBuf,
    },

    /// Delete a key
    Remove {
        /// Key name
        name: String,

        /// Key file (JSON object of name -> key)
        #[arg(short, long, env = "MCP_HUB_KEY_FILE")]
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["mcp-hub"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_overrides_and_keys() {
        let cli = Cli::try_parse_from([
            "mcp-hub", "--port", "8080", "keys", "add", "alice", "--file", "/tmp/keys.json",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(8080));
        match cli.command {
            Some(Command::Keys(KeysCommand::Add { name, file })) => {
                assert_eq!(name, "alice");
                assert_eq!(file, PathBuf::from("/tmp/keys.json"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
