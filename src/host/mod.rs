//! Collaborators provided by the hosting server.
//!
//! The SSO flow consumes users, sessions and content through these traits
//! and never owns their storage. [`memory::InMemoryHost`] implements all of
//! them for local development and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::InMemoryHost;

/// Failure reported by a host collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    /// The requested record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record type.
        kind: &'static str,
        /// Requested id.
        id: String,
    },

    /// The host could not be reached or failed internally.
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

/// A local account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Local user id.
    pub id: String,
    /// Login name.
    pub username: String,
    /// Email address, matched against the external username.
    pub email: String,
    /// Set when the account was archived.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// Archived accounts cannot sign in.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A web session minted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session token.
    pub token: String,
    /// Owner.
    pub user_id: String,
    /// CSRF token bound to the session.
    pub csrf_token: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

/// A post, as far as redirect resolution needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Post id.
    pub id: String,
    /// Channel the post lives in.
    pub channel_id: String,
}

/// A channel. Direct and group messages have no team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id.
    pub id: String,
    /// Owning team, if any.
    #[serde(default)]
    pub team_id: Option<String>,
}

/// A team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Team id.
    pub id: String,
    /// URL name used in permalinks.
    pub name: String,
}

/// User lookup.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Find a user by email, case-insensitively. `Ok(None)` when unknown.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, HostError>;
}

/// Session issuance.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create a session for `user_id` that expires at `expires_at`.
    async fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Session, HostError>;
}

/// Posts, channels and teams.
#[async_trait]
pub trait ContentDirectory: Send + Sync {
    /// Fetch a post.
    async fn get_post(&self, post_id: &str) -> Result<Post, HostError>;
    /// Fetch a channel.
    async fn get_channel(&self, channel_id: &str) -> Result<Channel, HostError>;
    /// Fetch a team.
    async fn get_team(&self, team_id: &str) -> Result<Team, HostError>;
    /// Teams the user belongs to, in membership order.
    async fn get_teams_for_user(&self, user_id: &str) -> Result<Vec<Team>, HostError>;
}
