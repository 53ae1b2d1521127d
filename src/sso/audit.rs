//! Audit logging for the tab SSO flow.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `sso.rejected` | The request ended with an error response |
//! | `sso.already_linked` | A linked local session skipped validation |
//! | `sso.anonymous_pass` | Skip mode let an empty token through |
//! | `sso.user_not_found` | No local user matches the external username |
//! | `sso.user_archived` | The matching local user is archived |
//! | `sso.link_stored` | An identity link was written |
//! | `sso.session_issued` | A session and its cookies were issued |
//!
//! Raw tokens and external usernames never appear in events.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::claims::VerifiedClaims;

/// Structured audit event emitted at each terminal step of authentication.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"sso.session_issued"`).
    pub event: &'static str,
    /// Local user id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// External subject id (`oid`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// Tenant of the validated token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Response status for `sso.rejected`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Failure category for `sso.rejected` (`signature`, `tenant`, `server`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    /// Internal reason for denial events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Session expiry for `sso.session_issued`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuditEvent {
    fn bare(event: &'static str) -> Self {
        Self {
            event,
            user_id: None,
            subject_id: None,
            tenant_id: None,
            status: None,
            kind: None,
            reason: None,
            expires_at: None,
        }
    }

    fn for_claims(event: &'static str, claims: &VerifiedClaims) -> Self {
        Self {
            subject_id: claims.subject_id().map(str::to_string),
            tenant_id: Some(claims.tenant_id()),
            ..Self::bare(event)
        }
    }

    /// Construct a `sso.rejected` event.
    #[must_use]
    pub fn rejected(status: u16, kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            kind: Some(kind),
            reason: Some(reason.into()),
            ..Self::bare("sso.rejected")
        }
    }

    /// Construct a `sso.already_linked` event.
    #[must_use]
    pub fn already_linked(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::bare("sso.already_linked")
        }
    }

    /// Construct a `sso.anonymous_pass` event.
    #[must_use]
    pub fn anonymous_pass() -> Self {
        Self::bare("sso.anonymous_pass")
    }

    /// Construct a `sso.user_not_found` event.
    #[must_use]
    pub fn user_not_found(claims: &VerifiedClaims) -> Self {
        Self::for_claims("sso.user_not_found", claims)
    }

    /// Construct a `sso.user_archived` event.
    #[must_use]
    pub fn user_archived(user_id: &str, claims: &VerifiedClaims) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::for_claims("sso.user_archived", claims)
        }
    }

    /// Construct a `sso.link_stored` event.
    #[must_use]
    pub fn link_stored(user_id: &str, claims: &VerifiedClaims) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::for_claims("sso.link_stored", claims)
        }
    }

    /// Construct a `sso.session_issued` event.
    #[must_use]
    pub fn session_issued(user_id: &str, claims: &VerifiedClaims, expires_at: DateTime<Utc>) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            expires_at: Some(expires_at),
            ..Self::for_claims("sso.session_issued", claims)
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// The event is serialized as a JSON blob in the `audit` field:
///
/// ```text
/// INFO msteams_tab_auth::sso::audit event="sso.session_issued" audit={"event":"sso.session_issued",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(event = event.event, audit = %json, "sso audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
