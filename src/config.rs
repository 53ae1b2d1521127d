//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Microsoft identity platform signing keys (multi-tenant discovery document).
pub const MICROSOFT_ONLINE_JWKS_URL: &str =
    "https://login.microsoftonline.com/common/discovery/v2.0/keys";

/// Plugin id the tab app is registered under on the host.
pub const DEFAULT_PLUGIN_ID: &str = "com.mattermost.plugin-msteams-devsecops";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Local site settings (URL, cookies, session length)
    pub site: SiteConfig,
    /// Teams tab app registration
    pub tab_app: TabAppConfig,
    /// Token validation settings
    pub sso: SsoConfig,
    /// Optional YAML fixture seeding the in-memory host directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings describing the local site the tab embeds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SiteConfig {
    /// Public URL of the local server, e.g. `https://chat.example.com/team-chat`.
    ///
    /// Its host forms the expected token audience and its path is the cookie
    /// subpath.
    pub site_url: String,
    /// Scope cookies to the site host so subdomains share the session
    pub allow_cookies_for_subdomains: bool,
    /// Web session length in hours (used by `session_expiry: session_length`)
    pub session_length_web_hours: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            allow_cookies_for_subdomains: false,
            session_length_web_hours: 720,
        }
    }
}

/// Teams tab app registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TabAppConfig {
    /// Plugin id used in redirect paths
    pub plugin_id: String,
    /// Entra ID tenant the tab app is registered in
    pub tenant_id: String,
    /// Application (client) id of the tab app registration
    pub app_client_id: String,
    /// Client secret (supports `${VAR}` expansion)
    pub app_client_secret: String,
    /// Teams app id (manifest id)
    pub app_id: String,
}

impl Default for TabAppConfig {
    fn default() -> Self {
        Self {
            plugin_id: DEFAULT_PLUGIN_ID.to_string(),
            tenant_id: String::new(),
            app_client_id: String::new(),
            app_client_secret: String::new(),
            app_id: String::new(),
        }
    }
}

/// How a minted session's expiry is chosen
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionExpiry {
    /// Expire together with the validated token (`exp` claim)
    #[default]
    Token,
    /// Expire after `site.session_length_web_hours`
    SessionLength,
}

/// Token validation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SsoConfig {
    /// Disable audience/tenant enforcement and accept an empty token.
    ///
    /// Local development only.
    pub skip_token_validation: bool,
    /// JWKS document with the identity provider's signing keys
    pub jwks_url: String,
    /// Scheduled JWKS refresh interval
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
    /// Minimum spacing between refreshes forced by an unknown `kid`
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_on_miss_interval: Duration,
    /// Timeout for a single JWKS fetch
    #[serde(with = "humantime_serde")]
    pub jwks_fetch_timeout: Duration,
    /// Tolerated clock skew for `iat`, `nbf` and `exp`
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// Session expiry strategy
    pub session_expiry: SessionExpiry,
    /// Tenants accepted in addition to `tab_app.tenant_id`.
    /// `"*"` is only honoured while `skip_token_validation` is on.
    #[serde(default)]
    pub expected_tenant_ids: Vec<String>,
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            skip_token_validation: false,
            jwks_url: MICROSOFT_ONLINE_JWKS_URL.to_string(),
            jwks_refresh_interval: Duration::from_secs(3600),
            jwks_refresh_on_miss_interval: Duration::from_secs(300),
            jwks_fetch_timeout: Duration::from_secs(10),
            clock_skew: Duration::ZERO,
            session_expiry: SessionExpiry::Token,
            expected_tenant_ids: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MSTEAMS_TAB_ prefix)
        figment = figment.merge(Env::prefixed("MSTEAMS_TAB_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must land before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Normalise and check the settings the SSO flow cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first missing setting.
    pub fn validate(&mut self) -> Result<()> {
        self.tab_app.tenant_id = self.tab_app.tenant_id.trim().to_string();
        self.tab_app.app_client_id = self.tab_app.app_client_id.trim().to_string();
        self.tab_app.app_client_secret = self.tab_app.app_client_secret.trim().to_string();
        self.site.site_url = self.site.site_url.trim().to_string();

        if self.tab_app.tenant_id.is_empty() {
            return Err(Error::Config("tenant ID should not be empty".into()));
        }
        if self.tab_app.app_client_id.is_empty() {
            return Err(Error::Config("client ID should not be empty".into()));
        }
        if self.tab_app.app_client_secret.is_empty() {
            return Err(Error::Config("client secret should not be empty".into()));
        }
        if self.site.site_url.is_empty() {
            return Err(Error::Config("site URL should not be empty".into()));
        }
        if self.sso.skip_token_validation {
            tracing::warn!("Token validation is in skip mode; never enable this in production");
        }
        Ok(())
    }

    /// Tenant ids a token's `tid` may match.
    #[must_use]
    pub fn expected_tenant_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(1 + self.sso.expected_tenant_ids.len());
        if !self.tab_app.tenant_id.is_empty() {
            ids.push(self.tab_app.tenant_id.clone());
        }
        for id in &self.sso.expected_tenant_ids {
            let id = id.trim();
            if !id.is_empty() && !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in the registration and site settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("env pattern: {e}")))?;

        for value in [
            &mut self.tab_app.tenant_id,
            &mut self.tab_app.app_client_id,
            &mut self.tab_app.app_client_secret,
            &mut self.site.site_url,
        ] {
            *value = Self::expand_string(&re, value);
        }
        Ok(())
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Human-readable `Duration` serde (`"30s"`, `"5m"`, `"1h"`, `"250ms"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Why a duration string was rejected.
    #[derive(Debug, thiserror::Error)]
    pub enum ParseDurationError {
        /// Not a whole number with a known unit.
        #[error("invalid duration: {0}")]
        Invalid(#[from] std::num::ParseIntError),

        /// The value does not fit in seconds as `u64`.
        #[error("duration {0:?} is too large")]
        Overflow(String),
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"1h"` or bare seconds.
    pub fn parse(s: &str) -> Result<Duration, ParseDurationError> {
        let s = s.trim();
        // "ms" must be checked before "s"
        let (digits, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
            return Ok(Duration::from_millis(ms.parse::<u64>()?));
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        let secs = digits
            .parse::<u64>()?
            .checked_mul(unit_secs)
            .ok_or_else(|| ParseDurationError::Overflow(s.to_string()))?;
        Ok(Duration::from_secs(secs))
    }
}
