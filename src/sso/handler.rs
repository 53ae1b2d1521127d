//! Authentication handler for the Teams tab.
//!
//! # Endpoint
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/iframe/authenticate` | Validate a Teams SSO token and start a web session |
//!
//! Query parameters: `token` (JWT), `sub_entity_id` (optional routing hint),
//! `app_id` (optional Teams app id). The token travels in the query string
//! because the tab reaches this endpoint by full-page navigation.
//!
//! # Outcomes
//!
//! | Situation | Response |
//! |-----------|----------|
//! | Local session already linked | `303` to the resolved target, no cookies |
//! | Empty token in skip mode | `303` to `/`, no cookies |
//! | Token rejected | `401` / `500` with `{"error": ...}` |
//! | Missing `oid` or username claim | `400` |
//! | No matching or archived local user | `303` to `/`, no cookies |
//! | Lookup, link or session failure | `500` |
//! | Success | `303` to the resolved target with three session cookies |

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::{
    SsoService,
    audit::{self, AuditEvent},
    claims::VerifiedClaims,
    jwks::ResolveKey,
    link_store::{IdentityLink, IdentityLinkStore, LinkStoreError},
    redirect::{self, HOME},
    session::{CookieScope, SessionWindow, session_cookies},
    validator::{TokenError, ValidateTokenParams, validate_token},
};
use crate::config::{Config, SessionExpiry};
use crate::host::{ContentDirectory, HostError, SessionService, UserDirectory};

/// Header the host sets when the caller already has a local session.
pub const USER_ID_HEADER: &str = "Mattermost-User-ID";

// ── Settings snapshot ─────────────────────────────────────────────────────

/// Immutable settings for one authentication request.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Public URL of the site.
    pub site_url: String,
    /// Tab app client id.
    pub client_id: String,
    /// Accepted tenants.
    pub expected_tenant_ids: Vec<String>,
    /// Development bypass.
    pub skip_validation: bool,
    /// Tolerated clock skew.
    pub clock_skew: Duration,
    /// Plugin id for redirect paths.
    pub plugin_id: String,
    /// Session expiry strategy.
    pub session_expiry: SessionExpiry,
    /// Session length for [`SessionExpiry::SessionLength`].
    pub session_length: Duration,
    /// Cookie path and domain.
    pub cookie_scope: CookieScope,
}

impl AuthSettings {
    /// Snapshot the settings from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            site_url: config.site.site_url.clone(),
            client_id: config.tab_app.app_client_id.clone(),
            expected_tenant_ids: config.expected_tenant_ids(),
            skip_validation: config.sso.skip_token_validation,
            clock_skew: config.sso.clock_skew,
            plugin_id: config.tab_app.plugin_id.clone(),
            session_expiry: config.sso.session_expiry,
            session_length: Duration::from_secs(
                config.site.session_length_web_hours.saturating_mul(3600),
            ),
            cookie_scope: CookieScope::from_site_url(
                &config.site.site_url,
                config.site.allow_cookies_for_subdomains,
            ),
        }
    }
}

// ── Request / outcome types ───────────────────────────────────────────────

/// Query string of `GET /iframe/authenticate`.
#[derive(Debug, Default, Deserialize)]
pub struct AuthenticateQuery {
    /// Teams SSO token.
    #[serde(default)]
    pub token: String,
    /// Routing hint.
    #[serde(default)]
    pub sub_entity_id: Option<String>,
    /// Teams app id.
    #[serde(default)]
    pub app_id: Option<String>,
}

/// One authentication attempt.
#[derive(Debug, Default, Clone)]
pub struct AuthRequest {
    /// Local user id when the caller already has a session.
    pub session_user_id: Option<String>,
    /// Raw token, possibly empty.
    pub token: String,
    /// Routing hint.
    pub sub_entity_id: Option<String>,
    /// Teams app id.
    pub app_id: Option<String>,
}

/// Successful end of an attempt. Both variants are `303` redirects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Redirect without touching cookies.
    Redirect {
        /// Target path.
        location: String,
    },
    /// Redirect carrying a new session.
    SessionIssued {
        /// Target path.
        location: String,
        /// Local user the session belongs to.
        user_id: String,
        /// `Set-Cookie` values.
        cookies: [String; 3],
    },
}

impl AuthOutcome {
    /// Redirect target.
    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::Redirect { location } | Self::SessionIssued { location, .. } => location,
        }
    }

    /// Cookies to set, empty for a plain redirect.
    #[must_use]
    pub fn cookies(&self) -> &[String] {
        match self {
            Self::Redirect { .. } => &[],
            Self::SessionIssued { cookies, .. } => cookies,
        }
    }

    fn home() -> Self {
        Self::Redirect {
            location: HOME.to_string(),
        }
    }
}

impl IntoResponse for AuthOutcome {
    fn into_response(self) -> Response {
        let location = self.location().to_string();
        let cookies: Vec<_> = self
            .cookies()
            .iter()
            .map(|c| (SET_COOKIE, c.clone()))
            .collect();
        (AppendHeaders(cookies), Redirect::to(&location)).into_response()
    }
}

/// Why an attempt failed.
///
/// `Display` carries internal detail for logs; responses only carry
/// [`AuthError::public_message`].
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token was rejected.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Validated token without an `oid`.
    #[error("missing or empty claim for oid")]
    MissingSubjectId,

    /// Validated token without `unique_name` or `preferred_username`.
    #[error("missing or empty claim for unique_name or preferred_username")]
    MissingUsername,

    /// The user directory failed.
    #[error("user lookup failed: {0}")]
    UpstreamLookupFailure(#[source] HostError),

    /// The identity link store failed.
    #[error("identity link persistence failed: {0}")]
    PersistenceFailure(#[source] LinkStoreError),

    /// The session service failed.
    #[error("session creation failed: {0}")]
    SessionCreationFailure(#[source] HostError),
}

impl AuthError {
    /// HTTP status to answer with.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Token(e) => e.status_code(),
            Self::MissingSubjectId | Self::MissingUsername => StatusCode::BAD_REQUEST,
            Self::UpstreamLookupFailure(_)
            | Self::PersistenceFailure(_)
            | Self::SessionCreationFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Generic message safe to return to the caller.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Token(e) => e.public_message(),
            Self::MissingSubjectId => "Missing or empty claim for oid",
            Self::MissingUsername => "Missing or empty claim for unique_name or preferred_username",
            Self::UpstreamLookupFailure(_)
            | Self::PersistenceFailure(_)
            | Self::SessionCreationFailure(_) => "Internal server error",
        }
    }

    /// Coarse failure category, logged and audited alongside the status.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(e) => e.kind(),
            Self::MissingSubjectId | Self::MissingUsername => "claims",
            Self::UpstreamLookupFailure(_) => "upstream",
            Self::PersistenceFailure(_) => "persistence",
            Self::SessionCreationFailure(_) => "session",
        }
    }

    fn audit_event(&self) -> AuditEvent {
        AuditEvent::rejected(self.status_code().as_u16(), self.kind(), self.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();
        if status.is_server_error() {
            error!(status = status.as_u16(), kind, error = %self, "Authentication failed");
        } else {
            warn!(status = status.as_u16(), kind, error = %self, "Authentication rejected");
        }
        audit::emit(&self.audit_event());
        (status, Json(json!({"error": self.public_message()}))).into_response()
    }
}

// ── State machine ─────────────────────────────────────────────────────────

/// Runs authentication attempts against the host collaborators.
///
/// Holds no mutable state of its own.
pub struct Authenticator {
    key_resolver: Option<Arc<dyn ResolveKey>>,
    links: Arc<dyn IdentityLinkStore>,
    users: Arc<dyn UserDirectory>,
    sessions: Arc<dyn SessionService>,
    content: Arc<dyn ContentDirectory>,
}

impl Authenticator {
    /// Wire an authenticator. `key_resolver` is `None` when no key source is
    /// configured; every token then fails as a server error.
    #[must_use]
    pub fn new(
        key_resolver: Option<Arc<dyn ResolveKey>>,
        links: Arc<dyn IdentityLinkStore>,
        users: Arc<dyn UserDirectory>,
        sessions: Arc<dyn SessionService>,
        content: Arc<dyn ContentDirectory>,
    ) -> Self {
        Self {
            key_resolver,
            links,
            users,
            sessions,
            content,
        }
    }

    /// Run one attempt.
    pub async fn authenticate(
        &self,
        settings: &AuthSettings,
        request: &AuthRequest,
    ) -> Result<AuthOutcome, AuthError> {
        if let Some(user_id) = request.session_user_id.as_deref().filter(|id| !id.is_empty()) {
            let linked = self
                .links
                .link_exists(user_id)
                .await
                .map_err(AuthError::PersistenceFailure)?;
            if linked {
                info!(user_id = %user_id, "Skipping authentication, user already linked");
                audit::emit(&AuditEvent::already_linked(user_id));
                let location = self
                    .redirect_target(settings, user_id, request.sub_entity_id.as_deref())
                    .await;
                return Ok(AuthOutcome::Redirect { location });
            }
            info!(user_id = %user_id, "Local session without identity link, validating token");
        }

        let params = ValidateTokenParams {
            token: &request.token,
            key_resolver: self.key_resolver.as_deref(),
            expected_tenant_ids: &settings.expected_tenant_ids,
            skip_validation: settings.skip_validation,
            site_url: &settings.site_url,
            client_id: &settings.client_id,
            clock_skew: settings.clock_skew,
        };

        let Some(claims) = validate_token(&params).await? else {
            warn!("Skip mode: empty token passed through without a local user");
            audit::emit(&AuditEvent::anonymous_pass());
            return Ok(AuthOutcome::home());
        };

        let subject_id = claims.subject_id().ok_or(AuthError::MissingSubjectId)?;
        let username = claims.username().ok_or(AuthError::MissingUsername)?;

        let user = match self.users.get_user_by_email(username).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(oid = %subject_id, tid = %claims.tid(), "No local user matches the token username");
                audit::emit(&AuditEvent::user_not_found(&claims));
                return Ok(AuthOutcome::home());
            }
            Err(e) => return Err(AuthError::UpstreamLookupFailure(e)),
        };

        if user.is_archived() {
            warn!(user_id = %user.id, oid = %subject_id, "Local user is archived");
            audit::emit(&AuditEvent::user_archived(&user.id, &claims));
            return Ok(AuthOutcome::home());
        }

        let link = IdentityLink {
            user_id: user.id.clone(),
            subject_id: subject_id.to_string(),
            sso_username: username.to_string(),
        };
        self.links
            .store_link(&link)
            .await
            .map_err(AuthError::PersistenceFailure)?;
        audit::emit(&AuditEvent::link_stored(&user.id, &claims));

        self.record_app_id(&claims, request.app_id.as_deref()).await?;

        let now = Utc::now();
        let window = SessionWindow::compute(
            settings.session_expiry,
            claims.exp(),
            settings.session_length,
            now,
        );
        let session = self
            .sessions
            .create_session(&user.id, window.expires_at)
            .await
            .map_err(AuthError::SessionCreationFailure)?;

        let cookies = session_cookies(&session, &window, &settings.cookie_scope);
        info!(user_id = %user.id, expires_at = %window.expires_at, "Session issued");
        audit::emit(&AuditEvent::session_issued(&user.id, &claims, window.expires_at));

        let location = self
            .redirect_target(settings, &user.id, request.sub_entity_id.as_deref())
            .await;

        Ok(AuthOutcome::SessionIssued {
            location,
            user_id: user.id,
            cookies,
        })
    }

    async fn record_app_id(
        &self,
        claims: &VerifiedClaims,
        app_id: Option<&str>,
    ) -> Result<(), AuthError> {
        let Some(app_id) = app_id.filter(|id| !id.is_empty()) else {
            warn!(tid = %claims.tid(), "App ID was not sent with the authentication request");
            return Ok(());
        };
        self.links
            .store_app_id(&claims.tenant_id(), app_id)
            .await
            .map_err(AuthError::PersistenceFailure)
    }

    async fn redirect_target(
        &self,
        settings: &AuthSettings,
        user_id: &str,
        sub_entity_id: Option<&str>,
    ) -> String {
        redirect::resolve_redirect(self.content.as_ref(), &settings.plugin_id, user_id, sub_entity_id)
            .await
    }
}

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the SSO routes.
///
/// The authenticate endpoint sits outside any auth middleware: it is the
/// authentication step.
pub fn sso_routes(service: Arc<SsoService>) -> Router {
    Router::new()
        .route("/iframe/authenticate", get(authenticate))
        .with_state(service)
}

/// `GET /iframe/authenticate`
async fn authenticate(
    State(service): State<Arc<SsoService>>,
    headers: HeaderMap,
    Query(query): Query<AuthenticateQuery>,
) -> Response {
    let request = AuthRequest {
        session_user_id: headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        token: query.token,
        sub_entity_id: query.sub_entity_id,
        app_id: query.app_id,
    };

    let settings = service.settings();
    match service.authenticator().authenticate(&settings, &request).await {
        Ok(outcome) => outcome.into_response(),
        Err(e) => e.into_response(),
    }
}
