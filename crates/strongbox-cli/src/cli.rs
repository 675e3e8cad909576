use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Operator CLI over the configured secret store.
#[derive(Parser, Debug)]
#[command(
    name = "strongbox",
    about = "Encrypted, replicated storage for Vault unseal keys and root tokens",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, env = "STRONGBOX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print a stored value to stdout as raw bytes.
    Get { key: String },
    /// Store a value; reads stdin when no value is given.
    Set { key: String, value: Option<String> },
    /// Remove a key. Removing a missing key succeeds.
    Delete { key: String },
    /// List stored keys, optionally restricted to a prefix.
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Write, read back and delete a scratch key.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a starter config file if one does not exist.
    Init,
}
