//! Error types for the Teams tab SSO relay

use std::io;

use thiserror::Error;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors
///
/// Request-scoped authentication failures live in
/// [`crate::sso::handler::AuthError`]; this enum covers startup, configuration
/// and tooling failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for the CLI.
    ///
    /// Configuration problems exit with `78` (`EX_CONFIG`), everything else
    /// with `1`.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Yaml(_) => 78,
            _ => 1,
        }
    }
}
