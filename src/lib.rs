//! Microsoft Teams tab SSO relay
//!
//! Exchanges the SSO token a Teams tab obtains from Entra ID for a session on
//! the local site.
//!
//! # Features
//!
//! - **Key Resolver**: auto-refreshing JWKS cache with refresh-on-miss for key rotation
//! - **Token Validator**: asymmetric algorithm allow-list, required temporal claims,
//!   audience and tenant checks
//! - **Authentication Handler**: identity linking, session cookies, deep-link redirects
//! - **Operations**: hot config reload, structured audit events, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod config_reload;
pub mod error;
pub mod host;
pub mod server;
pub mod sso;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("tracing: {e}")))
}
