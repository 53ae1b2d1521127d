//! Config hot-reload.
//!
//! This module watches `config.yaml` for changes, validates the new file and
//! swaps it into the running [`LiveConfig`]. Requests pick the new values up
//! on their next settings snapshot.
//!
//! # Limitations
//!
//! Some sections are bound at startup and cannot change in place:
//!
//! - `server.host` / `server.port` / `server.shutdown_timeout` (TCP listener)
//! - `sso.jwks_url` and the JWKS timing settings (key resolver task)
//! - `directory` (host fixture)
//!
//! When one of these changes a `WARNING` is logged, the old value is kept,
//! and the rest of the new file is applied. The process must be restarted to
//! pick them up.
//!
//! # Example
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//! use tokio::sync::broadcast;
//! use msteams_tab_auth::{config::Config, config_reload::{ConfigWatcher, LiveConfig}};
//!
//! # tokio_test::block_on(async {
//! let (shutdown_tx, _) = broadcast::channel(1);
//! let live = Arc::new(LiveConfig::new(Config::default()));
//!
//! let _watcher = ConfigWatcher::start(
//!     PathBuf::from("config.yaml"),
//!     live,
//!     shutdown_tx.subscribe(),
//! );
//! # });
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, SsoConfig};
use crate::{Error, Result};

/// Sections that differ between two [`Config`] snapshots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigPatch {
    /// `server` changed (restart required).
    pub server_changed: bool,
    /// JWKS endpoint or timing changed (restart required).
    pub jwks_changed: bool,
    /// `directory` changed (restart required).
    pub directory_changed: bool,
    /// `site` changed.
    pub site_changed: bool,
    /// `tab_app` changed.
    pub tab_app_changed: bool,
    /// Validation settings in `sso` changed.
    pub validation_changed: bool,
}

impl ConfigPatch {
    /// Nothing differs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.requires_restart()
            && !self.site_changed
            && !self.tab_app_changed
            && !self.validation_changed
    }

    /// A startup-bound section differs.
    #[must_use]
    pub fn requires_restart(&self) -> bool {
        self.server_changed || self.jwks_changed || self.directory_changed
    }

    /// One-line description for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.site_changed {
            parts.push("site settings changed");
        }
        if self.tab_app_changed {
            parts.push("tab app registration changed");
        }
        if self.validation_changed {
            parts.push("token validation settings changed");
        }
        if self.server_changed {
            parts.push("server settings changed (restart required)");
        }
        if self.jwks_changed {
            parts.push("JWKS settings changed (restart required)");
        }
        if self.directory_changed {
            parts.push("directory fixture changed (restart required)");
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// The configuration requests read from.
///
/// Each request clones the current `Arc<Config>` once and works from that
/// snapshot. A reload replaces the `Arc`; snapshots already handed out are
/// unaffected.
pub struct LiveConfig {
    current: RwLock<Arc<Config>>,
}

impl LiveConfig {
    /// Wrap the startup configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.current.read())
    }

    /// Replace the snapshot seen by subsequent requests.
    pub fn set(&self, config: Config) {
        let next = Arc::new(config);
        *self.current.write() = next;
    }
}

// ============================================================================
// Diffing
// ============================================================================

/// Compute which sections differ between two config snapshots.
#[must_use]
pub fn compute_diff(old: &Config, new: &Config) -> ConfigPatch {
    ConfigPatch {
        server_changed: old.server != new.server,
        jwks_changed: jwks_settings_changed(&old.sso, &new.sso),
        directory_changed: old.directory != new.directory,
        site_changed: old.site != new.site,
        tab_app_changed: old.tab_app != new.tab_app,
        validation_changed: old.sso.skip_token_validation != new.sso.skip_token_validation
            || old.sso.clock_skew != new.sso.clock_skew
            || old.sso.session_expiry != new.sso.session_expiry
            || old.sso.expected_tenant_ids != new.sso.expected_tenant_ids,
    }
}

fn jwks_settings_changed(old: &SsoConfig, new: &SsoConfig) -> bool {
    old.jwks_url != new.jwks_url
        || old.jwks_refresh_interval != new.jwks_refresh_interval
        || old.jwks_refresh_on_miss_interval != new.jwks_refresh_on_miss_interval
        || old.jwks_fetch_timeout != new.jwks_fetch_timeout
}

/// Carry startup-bound sections over from `old` so they stay in effect.
fn retain_startup_bound(old: &Config, new: &mut Config) {
    new.server = old.server.clone();
    new.directory.clone_from(&old.directory);
    new.sso.jwks_url.clone_from(&old.sso.jwks_url);
    new.sso.jwks_refresh_interval = old.sso.jwks_refresh_interval;
    new.sso.jwks_refresh_on_miss_interval = old.sso.jwks_refresh_on_miss_interval;
    new.sso.jwks_fetch_timeout = old.sso.jwks_fetch_timeout;
}

// ============================================================================
// File watcher
// ============================================================================

/// Reloads the config file when it changes on disk.
///
/// Dropping the watcher stops file notifications; the reload task exits on
/// the shutdown broadcast.
pub struct ConfigWatcher {
    _fs_watcher: Mutex<RecommendedWatcher>,
}

/// Quiet period after the last file event before a reload runs.
const SETTLE: Duration = Duration::from_millis(500);

impl ConfigWatcher {
    /// Watch `config_path` and reload it after each burst of writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file system watcher cannot be installed.
    pub fn start(
        config_path: PathBuf,
        live_config: Arc<LiveConfig>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (changed_tx, changed_rx) = mpsc::channel(32);

        // Editors often replace the file, so watch its directory
        let dir = match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let target = config_path.clone();
        let mut fs_watcher = RecommendedWatcher::new(
            move |event: notify::Result<Event>| {
                if let Ok(event) = event
                    && touches(&event, &target)
                {
                    let _ = changed_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("config watcher: {e}")))?;
        fs_watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("watch {}: {e}", dir.display())))?;

        debug!(path = %config_path.display(), "Watching config file");
        tokio::spawn(reload_on_change(config_path, live_config, changed_rx, shutdown_rx));

        Ok(Self {
            _fs_watcher: Mutex::new(fs_watcher),
        })
    }
}

/// Debounce change notifications and reload once the file has settled.
async fn reload_on_change(
    config_path: PathBuf,
    live_config: Arc<LiveConfig>,
    mut changed_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        let settle = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Config watcher stopped");
                return;
            }
            changed = changed_rx.recv() => {
                if changed.is_none() {
                    return;
                }
                deadline = Some(Instant::now() + SETTLE);
            }
            () = settle => {
                deadline = None;
                if let Err(e) = reload_once(&config_path, &live_config) {
                    warn!(error = %e, "Config reload rejected; keeping current config");
                }
            }
        }
    }
}

/// Create or modify event naming the config file.
///
/// Only the file name is compared: the parent directory is the watch root and
/// `notify` may report it in a different form than the configured path.
fn touches(event: &Event, config_path: &Path) -> bool {
    let Some(name) = config_path.file_name() else {
        return false;
    };
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p.file_name() == Some(name))
}

/// Load and validate `config_path`, then make it the live config.
///
/// An invalid file leaves the live config as it was.
///
/// # Errors
///
/// Returns an error if the file cannot be loaded or fails validation.
pub fn reload_once(config_path: &Path, live_config: &LiveConfig) -> Result<ConfigPatch> {
    let mut next = Config::load(Some(config_path))?;
    next.validate()?;

    let current = live_config.get();
    let patch = compute_diff(&current, &next);
    if patch.is_empty() {
        debug!(path = %config_path.display(), "Config file unchanged");
        return Ok(patch);
    }

    if patch.requires_restart() {
        warn!(
            changes = %patch.summary(),
            "Config changes need a restart; startup values stay in effect for those sections"
        );
        retain_startup_bound(&current, &mut next);
    }

    live_config.set(next);
    info!(changes = %patch.summary(), "Config reloaded");
    Ok(patch)
}

// ============================================================================
// Tests
// ============================================================================
