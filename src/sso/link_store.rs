//! Identity link persistence.
//!
//! The [`IdentityLinkStore`] trait abstracts over key-value backends. Records
//! are JSON values under two key families:
//!
//! - `user:<local user id>` → [`IdentityLink`]
//! - `appid_<tenant id>` → Teams app id last seen for that tenant
//!
//! Links never expire. Only their absence sends a user through validation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Association between a local account and the external identity that
/// authenticated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLink {
    /// Local user id.
    pub user_id: String,
    /// External subject id (`oid`).
    pub subject_id: String,
    /// External username the link was made with.
    pub sso_username: String,
}

/// Error variants for link persistence.
#[derive(Debug, thiserror::Error)]
pub enum LinkStoreError {
    /// The backend rejected or failed the operation.
    #[error("link store backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("link store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Trait abstracting the identity link backend.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// request tasks.
#[async_trait::async_trait]
pub trait IdentityLinkStore: Send + Sync + 'static {
    /// Look up the link for a local user.
    async fn get_link(&self, user_id: &str) -> Result<Option<IdentityLink>, LinkStoreError>;

    /// Insert or replace the link for `link.user_id`.
    async fn store_link(&self, link: &IdentityLink) -> Result<(), LinkStoreError>;

    /// `true` when a link exists for the local user.
    async fn link_exists(&self, user_id: &str) -> Result<bool, LinkStoreError>;

    /// Remember the Teams app id used by `tenant_id`.
    async fn store_app_id(&self, tenant_id: &str, app_id: &str) -> Result<(), LinkStoreError>;

    /// Teams app id recorded for `tenant_id`.
    async fn get_app_id(&self, tenant_id: &str) -> Result<Option<String>, LinkStoreError>;
}

fn link_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

fn app_id_key(tenant_id: &str) -> String {
    format!("appid_{tenant_id}")
}

/// In-memory key-value store backed by a `DashMap` of JSON values.
#[derive(Default)]
pub struct InMemoryIdentityLinkStore {
    kv: DashMap<String, Vec<u8>>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryIdentityLinkStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate the backend failing every operation.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LinkStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LinkStoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    fn put<T: Serialize>(&self, key: String, value: &T) -> Result<(), LinkStoreError> {
        self.check_available()?;
        let bytes = serde_json::to_vec(value)?;
        self.kv.insert(key, bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fetch<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, LinkStoreError> {
        self.check_available()?;
        let Some(bytes) = self.kv.get(key).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait::async_trait]
impl IdentityLinkStore for InMemoryIdentityLinkStore {
    async fn get_link(&self, user_id: &str) -> Result<Option<IdentityLink>, LinkStoreError> {
        self.fetch(&link_key(user_id))
    }

    async fn store_link(&self, link: &IdentityLink) -> Result<(), LinkStoreError> {
        self.put(link_key(&link.user_id), link)?;
        debug!(user_id = %link.user_id, "Stored identity link");
        Ok(())
    }

    async fn link_exists(&self, user_id: &str) -> Result<bool, LinkStoreError> {
        self.check_available()?;
        Ok(self.kv.contains_key(&link_key(user_id)))
    }

    async fn store_app_id(&self, tenant_id: &str, app_id: &str) -> Result<(), LinkStoreError> {
        self.put(app_id_key(tenant_id), &app_id)
    }

    async fn get_app_id(&self, tenant_id: &str) -> Result<Option<String>, LinkStoreError> {
        self.fetch(&app_id_key(tenant_id))
    }
}
