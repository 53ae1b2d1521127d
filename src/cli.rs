//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Microsoft Teams tab SSO relay - validates Entra ID tokens and mints local web sessions
#[derive(Parser, Debug)]
#[command(name = "msteams-tab-auth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MSTEAMS_TAB_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MSTEAMS_TAB_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MSTEAMS_TAB_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MSTEAMS_TAB_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MSTEAMS_TAB_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the SSO server (default)
    Serve,

    /// Validate a token against the configured JWKS and settings
    CheckToken {
        /// The JWT to check
        #[arg(required = true)]
        token: String,
    },

    /// Fetch the configured JWKS once and list its key ids
    Jwks,
}
