//! HTTP server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::config_reload::{ConfigWatcher, LiveConfig};
use crate::host::InMemoryHost;
use crate::sso::handler::Authenticator;
use crate::sso::jwks::{KeyResolver, ResolveKey};
use crate::sso::link_store::{IdentityLinkStore, InMemoryIdentityLinkStore};
use crate::sso::{SsoService, sso_routes};
use crate::{Error, Result};

/// Build the application router.
///
/// `key_resolver` feeds the health report; pass `None` when tokens are not
/// verified against a key source.
pub fn create_router(sso: Arc<SsoService>, key_resolver: Option<Arc<KeyResolver>>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(key_resolver)
        .merge(sso_routes(sso))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// `GET /health`
///
/// `503` while no signing key is loaded, since every token would be rejected.
async fn health_handler(State(key_resolver): State<Option<Arc<KeyResolver>>>) -> impl IntoResponse {
    let signing_keys = key_resolver.as_ref().map_or(0, |r| r.key_count());
    if signing_keys > 0 {
        (
            StatusCode::OK,
            Json(json!({"status": "ok", "signing_keys": signing_keys})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "signing_keys": 0})),
        )
    }
}

/// Teams tab SSO server
pub struct TabAuthServer {
    /// Live configuration
    config: Arc<LiveConfig>,
    /// File to watch for hot reload
    config_path: Option<PathBuf>,
    /// Signing keys
    key_resolver: Arc<KeyResolver>,
    /// Host collaborators
    host: Arc<InMemoryHost>,
    /// Identity links
    links: Arc<dyn IdentityLinkStore>,
}

impl TabAuthServer {
    /// Create the server: load the directory fixture and start the key resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory fixture cannot be read.
    pub async fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let host = match &config.directory {
            Some(path) => InMemoryHost::load(path)?,
            None => {
                warn!("No directory fixture configured; every user lookup will miss");
                InMemoryHost::new()
            }
        };

        let key_resolver = KeyResolver::from_config(&config.sso).await;

        Ok(Self {
            config: Arc::new(LiveConfig::new(config)),
            config_path,
            key_resolver: Arc::new(key_resolver),
            host: Arc::new(host),
            links: Arc::new(InMemoryIdentityLinkStore::new()),
        })
    }

    /// Build the router over this server's collaborators.
    #[must_use]
    pub fn router(&self) -> Router {
        let resolver: Arc<dyn ResolveKey> = self.key_resolver.clone();
        let authenticator = Authenticator::new(
            Some(resolver),
            Arc::clone(&self.links),
            self.host.clone(),
            self.host.clone(),
            self.host.clone(),
        );
        let sso = Arc::new(SsoService::new(authenticator, Arc::clone(&self.config)));
        create_router(sso, Some(Arc::clone(&self.key_resolver)))
    }

    /// Serve until Ctrl-C / SIGTERM, then stop the key resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let config = self.config.get();
        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let _watcher = match &self.config_path {
            Some(path) => match ConfigWatcher::start(
                path.clone(),
                Arc::clone(&self.config),
                shutdown_tx.subscribe(),
            ) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "Config hot reload disabled");
                    None
                }
            },
            None => None,
        };

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("MSTEAMS TAB AUTH v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = %config.server.port, "Listening");
        info!(
            signing_keys = self.key_resolver.key_count(),
            jwks_url = %config.sso.jwks_url,
            "Key resolver running"
        );
        info!(users = self.host.user_count(), "Directory loaded");
        if config.sso.skip_token_validation {
            warn!("TOKEN VALIDATION in skip mode - audience and tenant checks are off");
        }
        info!("  GET http://{}:{}/iframe/authenticate", config.server.host, config.server.port);
        info!("============================================================");

        let mut drain_rx = shutdown_tx.subscribe();
        let shutdown_timeout = config.server.shutdown_timeout;
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .into_future();

        tokio::select! {
            result = serve => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                let _ = drain_rx.recv().await;
                tokio::time::sleep(shutdown_timeout).await;
            } => {
                warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out; dropping open connections");
            }
        }

        info!("Stopping key resolver...");
        self.key_resolver.shutdown().await;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
