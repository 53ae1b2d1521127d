//! Session expiry selection and the session cookie set.
//!
//! Three cookies are issued together and share `Max-Age` and `Expires`:
//!
//! | Cookie        | HttpOnly | Secure | SameSite |
//! |---------------|----------|--------|----------|
//! | `MMAUTHTOKEN` | yes      | yes    | None     |
//! | `MMUSERID`    | no       | yes    | None     |
//! | `MMCSRF`      | no       | yes    | (unset)  |

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use url::Url;

use crate::config::SessionExpiry;
use crate::host::Session;

/// Session token cookie.
pub const SESSION_COOKIE: &str = "MMAUTHTOKEN";
/// User id cookie.
pub const USER_ID_COOKIE: &str = "MMUSERID";
/// CSRF token cookie.
pub const CSRF_COOKIE: &str = "MMCSRF";

/// Where session cookies apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieScope {
    /// `Path` attribute: the site URL's path, `/` when it has none.
    pub path: String,
    /// `Domain` attribute, set only when subdomains share the session.
    pub domain: Option<String>,
}

impl CookieScope {
    /// Derive the scope from the site URL.
    ///
    /// An unparsable URL yields `/` with no domain.
    #[must_use]
    pub fn from_site_url(site_url: &str, allow_subdomains: bool) -> Self {
        let Ok(url) = Url::parse(site_url) else {
            return Self {
                path: "/".to_string(),
                domain: None,
            };
        };
        let trimmed = url.path().trim_end_matches('/');
        let path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        let domain = if allow_subdomains {
            url.host_str().map(str::to_string)
        } else {
            None
        };
        Self { path, domain }
    }
}

/// When a new session ends, and the matching cookie `Max-Age`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
    /// Seconds until expiry, never negative.
    pub max_age: i64,
}

impl SessionWindow {
    /// Compute the window for `mode`.
    ///
    /// `Token` ends with the token's `exp`; `SessionLength` ends
    /// `session_length` after `now`.
    #[must_use]
    pub fn compute(
        mode: SessionExpiry,
        token_exp: i64,
        session_length: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        match mode {
            SessionExpiry::Token => {
                let expires_at = Utc.timestamp_opt(token_exp, 0).single().unwrap_or(now);
                Self {
                    expires_at,
                    max_age: (expires_at - now).num_seconds().max(0),
                }
            }
            SessionExpiry::SessionLength => {
                let length = chrono::Duration::from_std(session_length)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                Self {
                    expires_at: now + length,
                    max_age: length.num_seconds().max(0),
                }
            }
        }
    }
}

/// `Set-Cookie` values for a freshly minted session, in emission order.
#[must_use]
pub fn session_cookies(session: &Session, window: &SessionWindow, scope: &CookieScope) -> [String; 3] {
    let common = common_attributes(window, scope);
    [
        format!(
            "{SESSION_COOKIE}={}{common}; Secure; HttpOnly; SameSite=None",
            session.token
        ),
        format!("{USER_ID_COOKIE}={}{common}; Secure; SameSite=None", session.user_id),
        format!("{CSRF_COOKIE}={}{common}; Secure", session.csrf_token),
    ]
}

fn common_attributes(window: &SessionWindow, scope: &CookieScope) -> String {
    let mut attrs = format!(
        "; Path={}; Max-Age={}; Expires={}",
        scope.path,
        window.max_age,
        window.expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    );
    if let Some(domain) = &scope.domain {
        attrs.push_str("; Domain=");
        attrs.push_str(domain);
    }
    attrs
}
