//! Teams tab single sign-on.
//!
//! Turns a Teams SSO token into a local web session:
//!
//! 1. [`jwks::KeyResolver`] keeps the identity provider's signing keys.
//! 2. [`validator::validate_token`] verifies a token into [`claims::VerifiedClaims`].
//! 3. [`handler::Authenticator`] maps the claims to a local user, records the
//!    [`link_store::IdentityLink`], issues the session cookies and picks the
//!    [`redirect`] target.

pub mod audit;
pub mod claims;
pub mod handler;
pub mod jwks;
pub mod link_store;
pub mod redirect;
pub mod session;
pub mod validator;

use std::sync::Arc;

use crate::config_reload::LiveConfig;
use handler::{AuthSettings, Authenticator};

pub use claims::VerifiedClaims;
pub use handler::{AuthError, AuthOutcome, AuthRequest, sso_routes};
pub use jwks::{KeyLookupError, KeyResolver, ResolveKey};
pub use validator::{TokenError, ValidateTokenParams, validate_token};

/// Shared state for the SSO routes.
pub struct SsoService {
    authenticator: Authenticator,
    config: Arc<LiveConfig>,
}

impl SsoService {
    /// Create the service around an authenticator and the live config.
    #[must_use]
    pub fn new(authenticator: Authenticator, config: Arc<LiveConfig>) -> Self {
        Self {
            authenticator,
            config,
        }
    }

    /// The authenticator.
    #[must_use]
    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Settings snapshot for one request.
    #[must_use]
    pub fn settings(&self) -> AuthSettings {
        AuthSettings::from_config(&self.config.get())
    }
}
