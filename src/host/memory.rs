//! In-memory host backed by `DashMap`s.
//!
//! Seeded from a YAML directory fixture:
//!
//! ```yaml
//! users:
//!   - { id: u1, username: alice, email: alice@contoso.com }
//! teams:
//!   - { id: t1, name: engineering }
//! channels:
//!   - { id: c1, team_id: t1 }
//! posts:
//!   - { id: p1, channel_id: c1 }
//! team_members:
//!   u1: [t1]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::{
    Channel, ContentDirectory, HostError, Post, Session, SessionService, Team, User, UserDirectory,
};

/// Directory contents loaded from YAML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryFixture {
    /// Local accounts.
    pub users: Vec<User>,
    /// Teams.
    pub teams: Vec<Team>,
    /// Channels.
    pub channels: Vec<Channel>,
    /// Posts.
    pub posts: Vec<Post>,
    /// User id to team ids, in membership order.
    pub team_members: HashMap<String, Vec<String>>,
}

/// Host collaborators held in memory.
#[derive(Default)]
pub struct InMemoryHost {
    users: DashMap<String, User>,
    sessions: DashMap<String, Session>,
    teams: DashMap<String, Team>,
    channels: DashMap<String, Channel>,
    posts: DashMap<String, Post>,
    team_members: DashMap<String, Vec<String>>,
    user_lookup_down: AtomicBool,
    session_service_down: AtomicBool,
}

impl InMemoryHost {
    /// Create an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host seeded from `fixture`.
    #[must_use]
    pub fn from_fixture(fixture: DirectoryFixture) -> Self {
        let host = Self::new();
        for user in fixture.users {
            host.add_user(user);
        }
        for team in fixture.teams {
            host.add_team(team);
        }
        for channel in fixture.channels {
            host.add_channel(channel);
        }
        for post in fixture.posts {
            host.add_post(post);
        }
        for (user_id, team_ids) in fixture.team_members {
            host.team_members.insert(user_id, team_ids);
        }
        host
    }

    /// Load a YAML fixture file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let fixture: DirectoryFixture = serde_yaml::from_str(&raw)?;
        debug!(
            path = %path.display(),
            users = fixture.users.len(),
            teams = fixture.teams.len(),
            "Loaded directory fixture"
        );
        Ok(Self::from_fixture(fixture))
    }

    /// Insert or replace a user.
    pub fn add_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Mark a user archived.
    pub fn archive_user(&self, user_id: &str) {
        if let Some(mut user) = self.users.get_mut(user_id) {
            user.deleted_at = Some(Utc::now());
        }
    }

    /// Insert or replace a team.
    pub fn add_team(&self, team: Team) {
        self.teams.insert(team.id.clone(), team);
    }

    /// Insert or replace a channel.
    pub fn add_channel(&self, channel: Channel) {
        self.channels.insert(channel.id.clone(), channel);
    }

    /// Insert or replace a post.
    pub fn add_post(&self, post: Post) {
        self.posts.insert(post.id.clone(), post);
    }

    /// Append a team membership.
    pub fn add_team_member(&self, user_id: &str, team_id: &str) {
        self.team_members
            .entry(user_id.to_string())
            .or_default()
            .push(team_id.to_string());
    }

    /// Simulate the user directory being unreachable.
    pub fn set_user_lookup_unavailable(&self, down: bool) {
        self.user_lookup_down.store(down, Ordering::SeqCst);
    }

    /// Simulate the session service being unreachable.
    pub fn set_session_service_unavailable(&self, down: bool) {
        self.session_service_down.store(down, Ordering::SeqCst);
    }

    /// Sessions issued to `user_id`.
    #[must_use]
    pub fn sessions_for(&self, user_id: &str) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Total sessions issued.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl UserDirectory for InMemoryHost {
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, HostError> {
        if self.user_lookup_down.load(Ordering::SeqCst) {
            return Err(HostError::Unavailable("user directory".to_string()));
        }
        Ok(self
            .users
            .iter()
            .find(|e| e.value().email.eq_ignore_ascii_case(email))
            .map(|e| e.value().clone()))
    }
}

#[async_trait]
impl SessionService for InMemoryHost {
    async fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Session, HostError> {
        if self.session_service_down.load(Ordering::SeqCst) {
            return Err(HostError::Unavailable("session service".to_string()));
        }
        if !self.users.contains_key(user_id) {
            return Err(HostError::NotFound {
                kind: "user",
                id: user_id.to_string(),
            });
        }
        let session = Session {
            token: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            csrf_token: Uuid::new_v4().simple().to_string(),
            expires_at,
        };
        self.sessions.insert(session.token.clone(), session.clone());
        Ok(session)
    }
}

#[async_trait]
impl ContentDirectory for InMemoryHost {
    async fn get_post(&self, post_id: &str) -> Result<Post, HostError> {
        self.posts
            .get(post_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| HostError::NotFound {
                kind: "post",
                id: post_id.to_string(),
            })
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, HostError> {
        self.channels
            .get(channel_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| HostError::NotFound {
                kind: "channel",
                id: channel_id.to_string(),
            })
    }

    async fn get_team(&self, team_id: &str) -> Result<Team, HostError> {
        self.teams
            .get(team_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| HostError::NotFound {
                kind: "team",
                id: team_id.to_string(),
            })
    }

    async fn get_teams_for_user(&self, user_id: &str) -> Result<Vec<Team>, HostError> {
        let Some(team_ids) = self.team_members.get(user_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        Ok(team_ids
            .iter()
            .filter_map(|id| self.teams.get(id).map(|e| e.value().clone()))
            .collect())
    }
}
