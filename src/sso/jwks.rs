//! Signing key resolution backed by a remote JWKS document.
//!
//! # Refresh model
//!
//! - One fetch at construction. A failed fetch is logged and the resolver
//!   starts with an empty key set; every lookup then fails with
//!   [`KeyLookupError::NoKeysLoaded`] until a refresh succeeds.
//! - A background task refetches on a fixed interval.
//! - A lookup for an unknown `kid` forces a refresh, at most once per
//!   `refresh_on_miss_interval`. A key rotated in by the identity provider is
//!   therefore resolvable on the first lookup after rotation, unless another
//!   forced refresh happened within that window, in which case it becomes
//!   resolvable after the next scheduled refresh at the latest.
//!
//! Readers clone an `Arc` of the current snapshot. A refresh builds a complete
//! new map and swaps it in, so a lookup sees either the old or the new set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SsoConfig;

/// Error variants for JWKS retrieval.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// Network, HTTP status or body decoding failure.
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),

    /// The document parsed but held no key usable for signature verification.
    #[error("JWKS document contains no usable signing keys")]
    NoUsableKeys,
}

/// Why a key lookup produced no key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyLookupError {
    /// Keys are loaded but none has this id.
    #[error("no signing key for kid {0}")]
    UnknownKid(String),

    /// No key is loaded at all, so no token can be verified.
    #[error("no signing keys loaded")]
    NoKeysLoaded,
}

/// Lookup of a verification key by its key id.
#[async_trait]
pub trait ResolveKey: Send + Sync {
    /// Return the key for `kid`.
    async fn resolve(&self, kid: &str) -> Result<DecodingKey, KeyLookupError>;
}

/// Where a JWKS document comes from.
#[async_trait]
pub trait JwksSource: Send + Sync + 'static {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<JwkSet, JwksError>;

    /// Human readable origin, for logs.
    fn describe(&self) -> String;
}

/// JWKS fetched over HTTP(S).
pub struct HttpJwksSource {
    url: String,
    http: reqwest::Client,
}

impl HttpJwksSource {
    /// Create a source for `url` with a per-request `timeout`.
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<JwkSet, JwksError> {
        debug!(jwks_url = %self.url, "Fetching JWKS");
        let jwks = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<JwkSet>()
            .await?;
        Ok(jwks)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Refresh timing for a [`KeyResolver`].
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// Scheduled refresh interval.
    pub interval: Duration,
    /// Minimum spacing between refreshes forced by an unknown `kid`.
    pub on_miss_interval: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            on_miss_interval: Duration::from_secs(300),
        }
    }
}

impl From<&SsoConfig> for RefreshPolicy {
    fn from(config: &SsoConfig) -> Self {
        Self {
            interval: config.jwks_refresh_interval,
            on_miss_interval: config.jwks_refresh_on_miss_interval,
        }
    }
}

type KeySnapshot = Arc<HashMap<String, DecodingKey>>;

struct Shared {
    source: Arc<dyn JwksSource>,
    keys: RwLock<KeySnapshot>,
    last_forced_refresh: Mutex<Option<Instant>>,
    on_miss_interval: Duration,
}

impl Shared {
    fn snapshot(&self) -> KeySnapshot {
        Arc::clone(&self.keys.read())
    }

    /// Fetch and swap in a new snapshot. The previous one is kept on failure.
    async fn refresh(&self) -> Result<usize, JwksError> {
        let jwks = self.source.fetch().await?;
        let keys = decoding_keys(&jwks);
        if keys.is_empty() {
            return Err(JwksError::NoUsableKeys);
        }
        let count = keys.len();
        *self.keys.write() = Arc::new(keys);
        debug!(jwks_url = %self.source.describe(), keys = count, "JWKS refreshed");
        Ok(count)
    }

    /// Claim the forced-refresh slot. The lock is released before any I/O.
    fn try_claim_forced_refresh(&self) -> bool {
        let mut last = self.last_forced_refresh.lock();
        match *last {
            Some(at) if at.elapsed() < self.on_miss_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

/// Live, auto-refreshing set of signing keys.
///
/// Call [`KeyResolver::shutdown`] to stop the background task and wait for
/// it. Dropping the resolver cancels and aborts the task.
pub struct KeyResolver {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeyResolver {
    /// Fetch the initial key set and start the background refresh task.
    ///
    /// Never fails: an unreachable key source leaves the resolver empty and
    /// is logged at error level.
    pub async fn start(source: Arc<dyn JwksSource>, policy: RefreshPolicy) -> Self {
        let shared = Arc::new(Shared {
            source,
            keys: RwLock::new(Arc::new(HashMap::new())),
            last_forced_refresh: Mutex::new(None),
            on_miss_interval: policy.on_miss_interval,
        });

        match shared.refresh().await {
            Ok(count) => {
                info!(jwks_url = %shared.source.describe(), keys = count, "Signing keys loaded");
            }
            Err(e) => {
                error!(
                    jwks_url = %shared.source.describe(),
                    error = %e,
                    "Initial JWKS fetch failed; token validation unavailable until a refresh succeeds"
                );
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(
            Arc::clone(&shared),
            cancel.clone(),
            policy.interval,
        ));

        Self {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Convenience constructor for an HTTP JWKS endpoint.
    pub async fn from_config(config: &SsoConfig) -> Self {
        let source = HttpJwksSource::new(config.jwks_url.clone(), config.jwks_fetch_timeout);
        Self::start(Arc::new(source), RefreshPolicy::from(config)).await
    }

    /// Number of keys in the current snapshot.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.shared.snapshot().len()
    }

    /// Sorted key ids in the current snapshot.
    #[must_use]
    pub fn key_ids(&self) -> Vec<String> {
        let mut kids: Vec<String> = self.shared.snapshot().keys().cloned().collect();
        kids.sort();
        kids
    }

    /// `true` when no key is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key_count() == 0
    }

    /// Refresh now, ignoring the on-miss rate limit.
    pub async fn refresh_now(&self) -> Result<usize, JwksError> {
        self.shared.refresh().await
    }

    /// Stop the background task and wait until it has exited.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "JWKS refresh task ended abnormally");
                }
            }
        }
        debug!("Key resolver stopped");
    }

    /// `true` once the background task has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.task.lock().as_ref().is_none_or(JoinHandle::is_finished)
    }
}

#[async_trait]
impl ResolveKey for KeyResolver {
    async fn resolve(&self, kid: &str) -> Result<DecodingKey, KeyLookupError> {
        if let Some(key) = self.shared.snapshot().get(kid) {
            return Ok(key.clone());
        }

        if self.shared.try_claim_forced_refresh() {
            debug!(kid = %kid, "Unknown kid; refreshing JWKS");
            if let Err(e) = self.shared.refresh().await {
                warn!(kid = %kid, error = %e, "JWKS refresh on unknown kid failed");
            }
        } else {
            debug!(kid = %kid, "Unknown kid; forced refresh rate-limited");
        }

        let snapshot = self.shared.snapshot();
        match snapshot.get(kid) {
            Some(key) => Ok(key.clone()),
            None if snapshot.is_empty() => Err(KeyLookupError::NoKeysLoaded),
            None => Err(KeyLookupError::UnknownKid(kid.to_string())),
        }
    }
}

impl Drop for KeyResolver {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn refresh_loop(shared: Arc<Shared>, cancel: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = shared.refresh() => {
                if let Err(e) = result {
                    warn!(jwks_url = %shared.source.describe(), error = %e, "Scheduled JWKS refresh failed");
                }
            }
        }
    }
}

/// Convert every asymmetric JWK with a `kid` into a decoding key.
fn decoding_keys(jwks: &JwkSet) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::with_capacity(jwks.keys.len());
    for jwk in &jwks.keys {
        let Some(kid) = jwk.common.key_id.as_deref() else {
            debug!("Skipping JWK without kid");
            continue;
        };
        if matches!(jwk.algorithm, AlgorithmParameters::OctetKey(_)) {
            debug!(kid = %kid, "Skipping symmetric JWK");
            continue;
        }
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid.to_string(), key);
            }
            Err(e) => debug!(kid = %kid, error = %e, "Skipping unusable JWK"),
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PRIMARY_X: &str = "4c0VQWPNEQbQlCkFfaFzwLK2MxL21pB_E21cgUi8Efg";
    const ROTATED_X: &str = "d9-SoK6ukMPPEzkpwN89IyzUcK5ZDYUM8nkR0KBBsz8";

    fn okp_set(keys: &[(&str, &str)]) -> JwkSet {
        let keys: Vec<serde_json::Value> = keys
            .iter()
            .map(|(kid, x)| {
                serde_json::json!({"kty": "OKP", "crv": "Ed25519", "kid": kid, "x": x})
            })
            .collect();
        serde_json::from_value(serde_json::json!({ "keys": keys })).unwrap()
    }

    /// Source whose document can be swapped and whose fetches are counted.
    struct ScriptedSource {
        current: Mutex<Option<JwkSet>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(initial: Option<JwkSet>) -> Arc<Self> {
            Arc::new(Self {
                current: Mutex::new(initial),
                fetches: AtomicUsize::new(0),
            })
        }

        fn publish(&self, set: JwkSet) {
            *self.current.lock() = Some(set);
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JwksSource for ScriptedSource {
        async fn fetch(&self) -> Result<JwkSet, JwksError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.current.lock().clone().ok_or(JwksError::NoUsableKeys)
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn slow_policy() -> RefreshPolicy {
        RefreshPolicy {
            interval: Duration::from_secs(3600),
            on_miss_interval: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn initial_fetch_loads_keys() {
        // GIVEN: a source with one key
        let source = ScriptedSource::new(Some(okp_set(&[("k1", PRIMARY_X)])));

        // WHEN: the resolver starts
        let resolver = KeyResolver::start(source.clone(), slow_policy()).await;

        // THEN: the key resolves without another fetch
        assert!(resolver.resolve("k1").await.is_ok());
        assert_eq!(source.fetches(), 1);
        assert_eq!(resolver.key_ids(), vec!["k1".to_string()]);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn failed_initial_fetch_still_constructs_empty_resolver() {
        // GIVEN: an unreachable source
        let source = ScriptedSource::new(None);

        // WHEN
        let resolver = KeyResolver::start(source, slow_policy()).await;

        // THEN: constructed, empty, lookups report the missing key set
        assert!(resolver.is_empty());
        assert_eq!(
            resolver.resolve("k1").await.err(),
            Some(KeyLookupError::NoKeysLoaded)
        );
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_kid_forces_refresh_and_picks_up_rotation() {
        // GIVEN: resolver loaded with the primary key
        let source = ScriptedSource::new(Some(okp_set(&[("k1", PRIMARY_X)])));
        let resolver = KeyResolver::start(source.clone(), slow_policy()).await;

        // WHEN: the provider rotates in k2 and a token signed with k2 arrives
        source.publish(okp_set(&[("k1", PRIMARY_X), ("k2", ROTATED_X)]));
        let key = resolver.resolve("k2").await;

        // THEN: the forced refresh made it resolvable
        assert!(key.is_ok());
        assert_eq!(source.fetches(), 2);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn forced_refresh_is_rate_limited() {
        // GIVEN
        let source = ScriptedSource::new(Some(okp_set(&[("k1", PRIMARY_X)])));
        let resolver = KeyResolver::start(source.clone(), slow_policy()).await;

        // WHEN: two lookups for a kid that never appears
        for _ in 0..2 {
            assert_eq!(
                resolver.resolve("ghost").await.err(),
                Some(KeyLookupError::UnknownKid("ghost".to_string()))
            );
        }

        // THEN: only one forced refresh went out
        assert_eq!(source.fetches(), 2);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn empty_resolver_recovers_on_next_lookup() {
        // GIVEN: nothing loaded at startup
        let source = ScriptedSource::new(None);
        let resolver = KeyResolver::start(source.clone(), slow_policy()).await;

        // WHEN: the source comes back before the first token arrives
        source.publish(okp_set(&[("k1", PRIMARY_X)]));

        // THEN: the lookup's forced refresh loads the key
        assert!(resolver.resolve("k1").await.is_ok());
        assert_eq!(source.fetches(), 2);

        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn rate_limited_empty_resolver_still_reports_no_keys() {
        // GIVEN: an empty resolver whose forced refresh already ran
        let source = ScriptedSource::new(None);
        let resolver = KeyResolver::start(source.clone(), slow_policy()).await;
        assert!(resolver.resolve("k1").await.is_err());

        // WHEN: a second lookup lands inside the rate-limit window
        let err = resolver.resolve("k1").await.err();

        // THEN: still the empty-set error, not an unknown kid
        assert_eq!(err, Some(KeyLookupError::NoKeysLoaded));
        assert_eq!(source.fetches(), 2);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn empty_document_keeps_previous_snapshot() {
        // GIVEN: loaded resolver
        let source = ScriptedSource::new(Some(okp_set(&[("k1", PRIMARY_X)])));
        let resolver = KeyResolver::start(source.clone(), slow_policy()).await;

        // WHEN: the source starts serving an empty set
        source.publish(okp_set(&[]));
        let result = resolver.refresh_now().await;

        // THEN: refresh errors and old keys survive
        assert!(matches!(result, Err(JwksError::NoUsableKeys)));
        assert!(resolver.resolve("k1").await.is_ok());
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn symmetric_and_kidless_keys_are_skipped() {
        let set: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [
                {"kty": "oct", "kid": "hmac", "k": "c2VjcmV0"},
                {"kty": "OKP", "crv": "Ed25519", "x": PRIMARY_X},
                {"kty": "OKP", "crv": "Ed25519", "kid": "k1", "x": PRIMARY_X}
            ]
        }))
        .unwrap();

        let keys = decoding_keys(&set);

        assert_eq!(keys.len(), 1);
        assert!(keys.contains_key("k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_refresh_runs_on_interval() {
        // GIVEN: short refresh interval
        let source = ScriptedSource::new(Some(okp_set(&[("k1", PRIMARY_X)])));
        let policy = RefreshPolicy {
            interval: Duration::from_secs(60),
            on_miss_interval: Duration::from_secs(300),
        };
        let resolver = KeyResolver::start(source.clone(), policy).await;

        // WHEN: time passes beyond one interval
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        // THEN: a scheduled fetch happened
        assert!(source.fetches() >= 2);
        resolver.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_background_task() {
        // GIVEN
        let source = ScriptedSource::new(Some(okp_set(&[("k1", PRIMARY_X)])));
        let resolver = KeyResolver::start(source, slow_policy()).await;
        assert!(!resolver.is_stopped());

        // WHEN
        resolver.shutdown().await;

        // THEN: no background work survives
        assert!(resolver.is_stopped());
    }
}
