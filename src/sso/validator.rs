//! Bearer token validation.
//!
//! # Verification flow
//!
//! Checks run in order and stop at the first failure:
//!
//! 1. Empty token: rejected, or accepted without claims in skip mode.
//! 2. No key resolver, or a resolver with no keys loaded: validation
//!    unavailable.
//! 3. Header algorithm against the asymmetric allow-list, `kid` lookup,
//!    signature verification.
//! 4. `iat` present and not in the future.
//! 5. `exp` present and not passed.
//! 6. `nbf` present and not in the future.
//! 7. Audience equals `api://<site-host>/<client-id>` (not in skip mode).
//! 8. `tid` present and a well-formed GUID.
//! 9. `tid` among the expected tenants, or `"*"` listed while in skip mode.
//!
//! The library's own temporal and audience checks are disabled; every claim
//! above is checked here so that absence is rejected, not only malformation.

use std::collections::HashSet;
use std::time::Duration;

use axum::http::StatusCode;
use jsonwebtoken::{Algorithm, Validation};
use serde_json::{Map, Value};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use super::claims::{ClaimMap, VerifiedClaims};
use super::jwks::{KeyLookupError, ResolveKey};

/// Accepted signing algorithms. HMAC and `none` are never accepted.
pub const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::EdDSA,
];

/// Tenant sentinel accepted only in skip mode.
pub const ANY_TENANT: &str = "*";

/// Why a token was rejected.
///
/// `Display` carries internal detail and is for logs only. Callers see
/// [`TokenError::public_message`].
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No token in the request.
    #[error("token is empty")]
    MissingToken,

    /// No key resolver configured, or no signing key loaded.
    #[error("token validation unavailable: {0}")]
    ValidatorUnavailable(&'static str),

    /// The configured site URL has no usable host.
    #[error("site URL {site_url:?} cannot produce an audience: {reason}")]
    SiteUrlMisconfigured {
        /// Configured value.
        site_url: String,
        /// Parse failure.
        reason: String,
    },

    /// Header, algorithm, key lookup or signature failure.
    #[error("signature verification failed: {0}")]
    MalformedOrUnverifiableSignature(String),

    /// A temporal claim is out of range.
    #[error("{claim} out of range (value {value}, now {now})")]
    ExpiredOrNotYetValid {
        /// `iat`, `nbf` or `exp`.
        claim: &'static str,
        /// Claim value.
        value: i64,
        /// Validation time.
        now: i64,
    },

    /// Audience does not name this site and client.
    #[error("audience {actual:?} does not contain {expected}")]
    AudienceMismatch {
        /// Expected audience.
        expected: String,
        /// Audiences in the token.
        actual: Vec<String>,
    },

    /// A required claim is absent or has the wrong type.
    #[error("required claim {0} is missing")]
    MissingRequiredClaim(&'static str),

    /// `tid` is not a GUID.
    #[error("tid is not a valid GUID")]
    InvalidTenantId,

    /// `tid` not among the expected tenants.
    #[error("tenant {0} is not expected")]
    TenantMismatch(Uuid),
}

impl TokenError {
    /// HTTP status to answer with.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidatorUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Generic message safe to return to the caller.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingToken => "Missing token",
            Self::ValidatorUnavailable(_) => "Failed to initialize token validation",
            Self::SiteUrlMisconfigured { .. } => {
                "Failed to authenticate due to server misconfiguration. Contact your system administrator."
            }
            Self::MalformedOrUnverifiableSignature(_)
            | Self::ExpiredOrNotYetValid { .. }
            | Self::AudienceMismatch { .. } => "Failed to parse token",
            Self::MissingRequiredClaim(_) | Self::InvalidTenantId | Self::TenantMismatch(_) => {
                "Unexpected claims"
            }
        }
    }

    /// Coarse category for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::ValidatorUnavailable(_) | Self::SiteUrlMisconfigured { .. } => "server",
            Self::MalformedOrUnverifiableSignature(_) => "signature",
            Self::ExpiredOrNotYetValid { .. } => "temporal",
            Self::AudienceMismatch { .. } => "audience",
            Self::MissingRequiredClaim(_) | Self::InvalidTenantId => "claims",
            Self::TenantMismatch(_) => "tenant",
        }
    }
}

/// Inputs to [`validate_token`].
#[derive(Clone, Copy)]
pub struct ValidateTokenParams<'a> {
    /// Raw bearer token.
    pub token: &'a str,
    /// Signing key lookup.
    pub key_resolver: Option<&'a dyn ResolveKey>,
    /// Tenants a token may belong to.
    pub expected_tenant_ids: &'a [String],
    /// Development bypass.
    pub skip_validation: bool,
    /// Public URL of this site.
    pub site_url: &'a str,
    /// Application (client) id of the tab app.
    pub client_id: &'a str,
    /// Tolerated clock skew.
    pub clock_skew: Duration,
}

/// Validate `params.token` at the current time.
///
/// Returns `Ok(None)` only for an empty token in skip mode.
pub async fn validate_token(
    params: &ValidateTokenParams<'_>,
) -> Result<Option<VerifiedClaims>, TokenError> {
    validate_token_at(params, chrono::Utc::now().timestamp()).await
}

/// Validate `params.token` as of `now` (Unix seconds).
pub async fn validate_token_at(
    params: &ValidateTokenParams<'_>,
    now: i64,
) -> Result<Option<VerifiedClaims>, TokenError> {
    if params.token.is_empty() {
        if params.skip_validation {
            warn!("Empty token accepted in skip mode");
            return Ok(None);
        }
        return Err(TokenError::MissingToken);
    }

    let resolver = params
        .key_resolver
        .ok_or(TokenError::ValidatorUnavailable("no key resolver configured"))?;

    let claims = verify_signature(params.token, resolver).await?;
    let leeway = i64::try_from(params.clock_skew.as_secs()).unwrap_or(i64::MAX);

    let iat = claims
        .numeric_date("iat")
        .ok_or(TokenError::MissingRequiredClaim("iat"))?;
    if iat > now.saturating_add(leeway) {
        return Err(TokenError::ExpiredOrNotYetValid { claim: "iat", value: iat, now });
    }

    let exp = claims
        .numeric_date("exp")
        .ok_or(TokenError::MissingRequiredClaim("exp"))?;
    if now >= exp.saturating_add(leeway) {
        return Err(TokenError::ExpiredOrNotYetValid { claim: "exp", value: exp, now });
    }

    let nbf = claims
        .numeric_date("nbf")
        .ok_or(TokenError::MissingRequiredClaim("nbf"))?;
    if nbf > now.saturating_add(leeway) {
        return Err(TokenError::ExpiredOrNotYetValid { claim: "nbf", value: nbf, now });
    }

    if !params.skip_validation {
        let expected = expected_audience(params.site_url, params.client_id)?;
        let actual = claims.audience();
        if !actual.iter().any(|aud| aud == &expected) {
            return Err(TokenError::AudienceMismatch { expected, actual });
        }
    }

    let tid = claims
        .string("tid")
        .ok_or(TokenError::MissingRequiredClaim("tid"))?;
    let tid = parse_guid(tid).ok_or(TokenError::InvalidTenantId)?;

    check_tenant(tid, params.expected_tenant_ids, params.skip_validation)?;

    info!(tid = %tid, "Token validated");
    Ok(Some(VerifiedClaims::from_checked(&claims, tid, iat, nbf, exp)))
}

/// Decode the header, enforce the allow-list, resolve the key and verify.
async fn verify_signature(token: &str, resolver: &dyn ResolveKey) -> Result<ClaimMap, TokenError> {
    let header = jsonwebtoken::decode_header(token)
        .map_err(|e| TokenError::MalformedOrUnverifiableSignature(format!("header: {e}")))?;

    if !ALLOWED_ALGORITHMS.contains(&header.alg) {
        return Err(TokenError::MalformedOrUnverifiableSignature(format!(
            "algorithm {:?} not allowed",
            header.alg
        )));
    }

    let kid = header.kid.as_deref().ok_or_else(|| {
        TokenError::MalformedOrUnverifiableSignature("header has no kid".to_string())
    })?;

    let key = resolver.resolve(kid).await.map_err(|e| match e {
        KeyLookupError::NoKeysLoaded => TokenError::ValidatorUnavailable("no signing keys loaded"),
        KeyLookupError::UnknownKid(_) => TokenError::MalformedOrUnverifiableSignature(e.to_string()),
    })?;

    let mut validation = Validation::new(header.alg);
    validation.algorithms = vec![header.alg];
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();
    validation.leeway = 0;

    let data = jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation)
        .map_err(|e| TokenError::MalformedOrUnverifiableSignature(e.to_string()))?;

    Ok(ClaimMap::new(data.claims))
}

/// `api://<host[:port]>/<client-id>` for the configured site.
pub fn expected_audience(site_url: &str, client_id: &str) -> Result<String, TokenError> {
    let misconfigured = |reason: String| TokenError::SiteUrlMisconfigured {
        site_url: site_url.to_string(),
        reason,
    };

    let url = Url::parse(site_url).map_err(|e| misconfigured(e.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| misconfigured("no host".to_string()))?;

    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(format!("api://{authority}/{client_id}"))
}

/// Hyphenated 36-character GUID only.
fn parse_guid(value: &str) -> Option<Uuid> {
    if value.len() != 36 {
        return None;
    }
    Uuid::parse_str(value).ok()
}

fn check_tenant(tid: Uuid, expected: &[String], skip_validation: bool) -> Result<(), TokenError> {
    let matched = expected
        .iter()
        .filter_map(|id| Uuid::parse_str(id.trim()).ok())
        .any(|id| id == tid);
    if matched {
        return Ok(());
    }

    if skip_validation && expected.iter().any(|id| id == ANY_TENANT) {
        warn!(tid = %tid, "Accepting token from any tenant (skip mode wildcard)");
        return Ok(());
    }

    Err(TokenError::TenantMismatch(tid))
}
