//! Claim access for tokens in flight and the typed result of validation.

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Decoded but not yet accepted claims.
///
/// Only the validator sees this; it never leaves the `sso` module.
#[derive(Debug)]
pub(crate) struct ClaimMap(Map<String, Value>);

impl ClaimMap {
    pub(crate) fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// A NumericDate claim as whole seconds. Fractional values are truncated.
    pub(crate) fn numeric_date(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            Value::Number(n) => n.as_i64().or_else(|| {
                #[allow(clippy::cast_possible_truncation)]
                n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)
            }),
            _ => None,
        }
    }

    /// A string claim, `None` when absent or not a string.
    pub(crate) fn string(&self, name: &str) -> Option<&str> {
        self.0.get(name)?.as_str()
    }

    /// The `aud` claim as a list. A single string becomes a one-element list.
    pub(crate) fn audience(&self) -> Vec<String> {
        match self.0.get("aud") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn non_empty(&self, name: &str) -> Option<String> {
        self.string(name)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Claims of a token that passed every validation step.
///
/// Only [`crate::sso::validator::validate_token`] constructs this, so the
/// fields are read-only outside the crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedClaims {
    oid: Option<String>,
    unique_name: Option<String>,
    preferred_username: Option<String>,
    name: Option<String>,
    tid: Uuid,
    iat: i64,
    nbf: i64,
    exp: i64,
    aud: Vec<String>,
}

impl VerifiedClaims {
    pub(crate) fn from_checked(claims: &ClaimMap, tid: Uuid, iat: i64, nbf: i64, exp: i64) -> Self {
        Self {
            oid: claims.non_empty("oid"),
            unique_name: claims.non_empty("unique_name"),
            preferred_username: claims.non_empty("preferred_username"),
            name: claims.non_empty("name"),
            tid,
            iat,
            nbf,
            exp,
            aud: claims.audience(),
        }
    }

    /// External subject id, when present and non-empty.
    #[must_use]
    pub fn subject_id(&self) -> Option<&str> {
        self.oid.as_deref()
    }

    /// External username: `unique_name`, falling back to `preferred_username`.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.unique_name
            .as_deref()
            .or(self.preferred_username.as_deref())
    }

    /// Tenant id in its canonical hyphenated lowercase form.
    #[must_use]
    pub fn tenant_id(&self) -> String {
        self.tid.hyphenated().to_string()
    }

    /// Tenant id.
    #[must_use]
    pub fn tid(&self) -> Uuid {
        self.tid
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Issued at, Unix seconds.
    #[must_use]
    pub fn iat(&self) -> i64 {
        self.iat
    }

    /// Not before, Unix seconds.
    #[must_use]
    pub fn nbf(&self) -> i64 {
        self.nbf
    }

    /// Expiration, Unix seconds.
    #[must_use]
    pub fn exp(&self) -> i64 {
        self.exp
    }

    /// Audiences the token was issued for.
    #[must_use]
    pub fn aud(&self) -> &[String] {
        &self.aud
    }
}
