//! Shared fixtures for integration tests: signing keys, a local JWKS
//! endpoint and a fully wired router over in-memory collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, Response},
    routing::get,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use msteams_tab_auth::config::Config;
use msteams_tab_auth::config_reload::LiveConfig;
use msteams_tab_auth::host::{Channel, InMemoryHost, Post, Team, User};
use msteams_tab_auth::server::create_router;
use msteams_tab_auth::sso::handler::{Authenticator, USER_ID_HEADER};
use msteams_tab_auth::sso::jwks::{HttpJwksSource, KeyResolver, RefreshPolicy, ResolveKey};
use msteams_tab_auth::sso::link_store::InMemoryIdentityLinkStore;
use msteams_tab_auth::sso::SsoService;

pub const TENANT: &str = "72f988bf-86f1-41af-91ab-2d7cd011db47";
pub const OTHER_TENANT: &str = "9188040d-6c67-4c5b-b112-36a304b66dad";
pub const SITE_URL: &str = "https://chat.example.com";
pub const CLIENT_ID: &str = "0b3c3c6e-tab-app";
pub const AUDIENCE: &str = "api://chat.example.com/0b3c3c6e-tab-app";
pub const OID: &str = "00000000-0000-0000-0000-0000000000aa";
pub const ALICE_EMAIL: &str = "alice@contoso.com";
pub const ALICE_ID: &str = "u-alice";

const PRIMARY_PEM: &[u8] = include_bytes!("../fixtures/ed25519_primary.pem");
const ROTATED_PEM: &[u8] = include_bytes!("../fixtures/ed25519_rotated.pem");
const RSA_PEM: &[u8] = include_bytes!("../fixtures/rsa_signing.pem");

const PRIMARY_X: &str = "4c0VQWPNEQbQlCkFfaFzwLK2MxL21pB_E21cgUi8Efg";
const ROTATED_X: &str = "d9-SoK6ukMPPEzkpwN89IyzUcK5ZDYUM8nkR0KBBsz8";
const RSA_N: &str = "nCjmExgESASyWmxlXu62Pe1yx9US6QcE37_8A3tEHN_imvriVHb1VqnIzGUq0-YYxuD-oGA3pBZ3FFScQA1RfHX3SForapLwhRx7jUJWvDbQQX7NzTsUGaR49bFKQDqUSVuBvRBDaQfdeurPz5qG2mDDuMBhPAF9l11moEmaOuGuWiV6slBh7sGsfBWC_49AHt8sBGICtLYru8cc7p47R8_ML8QbT-GrX5Y5_xqL6V0K7jVrfasdnY0CWLriE31iosIx9gO5YFuDi7ZOQr9bagYbqfL0gCokOKVRaJXvxebpZZt9Ch_1CMotwmsKnxf7rE0cazWflRvafMWb73m9yw";

// ============================================================================
// Signing keys
// ============================================================================

/// Key pairs available to tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningKey {
    /// Ed25519, kid `primary`.
    Primary,
    /// Ed25519, kid `rotated`.
    Rotated,
    /// RSA 2048, kid `rsa`.
    Rsa,
}

impl SigningKey {
    pub fn kid(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Rotated => "rotated",
            Self::Rsa => "rsa",
        }
    }

    pub fn jwk(self) -> Value {
        match self {
            Self::Primary | Self::Rotated => {
                let x = if self == Self::Primary { PRIMARY_X } else { ROTATED_X };
                json!({
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "use": "sig",
                    "alg": "EdDSA",
                    "kid": self.kid(),
                    "x": x
                })
            }
            Self::Rsa => json!({
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": self.kid(),
                "n": RSA_N,
                "e": "AQAB"
            }),
        }
    }

    /// Sign `claims` with this key and its `kid`.
    pub fn sign(self, claims: &Value) -> String {
        self.sign_as(claims, self.kid())
    }

    /// Sign `claims` with this key but advertise `kid` in the header.
    pub fn sign_as(self, claims: &Value, kid: &str) -> String {
        let (alg, key) = match self {
            Self::Primary => (Algorithm::EdDSA, EncodingKey::from_ed_pem(PRIMARY_PEM)),
            Self::Rotated => (Algorithm::EdDSA, EncodingKey::from_ed_pem(ROTATED_PEM)),
            Self::Rsa => (Algorithm::RS256, EncodingKey::from_rsa_pem(RSA_PEM)),
        };
        let mut header = Header::new(alg);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &key.expect("fixture key")).expect("sign token")
    }
}

/// A JWKS document publishing `keys`.
pub fn jwks(keys: &[SigningKey]) -> Value {
    json!({ "keys": keys.iter().map(|k| k.jwk()).collect::<Vec<_>>() })
}

// ============================================================================
// Claims
// ============================================================================

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Claims Teams issues for `alice@contoso.com` in the home tenant.
pub fn valid_claims() -> Value {
    let now = now();
    json!({
        "aud": AUDIENCE,
        "iss": format!("https://login.microsoftonline.com/{TENANT}/v2.0"),
        "iat": now - 60,
        "nbf": now - 60,
        "exp": now + 3600,
        "tid": TENANT,
        "oid": OID,
        "name": "Alice",
        "unique_name": ALICE_EMAIL,
        "preferred_username": ALICE_EMAIL
    })
}

/// `valid_claims` with `overrides` merged in. A `null` override removes the claim.
pub fn claims_with(overrides: Value) -> Value {
    let mut claims = valid_claims();
    if let (Some(base), Some(extra)) = (claims.as_object_mut(), overrides.as_object()) {
        for (name, value) in extra {
            if value.is_null() {
                base.remove(name);
            } else {
                base.insert(name.clone(), value.clone());
            }
        }
    }
    claims
}

// ============================================================================
// Local JWKS endpoint
// ============================================================================

/// JWKS served from `127.0.0.1` with a swappable document.
pub struct JwksServer {
    pub url: String,
    document: Arc<RwLock<Value>>,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct JwksState {
    document: Arc<RwLock<Value>>,
    hits: Arc<AtomicUsize>,
}

async fn serve_jwks(State(state): State<JwksState>) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    Json(state.document.read().clone())
}

impl JwksServer {
    pub async fn start(document: Value) -> Self {
        let document = Arc::new(RwLock::new(document));
        let hits = Arc::new(AtomicUsize::new(0));
        let state = JwksState {
            document: Arc::clone(&document),
            hits: Arc::clone(&hits),
        };
        let app = Router::new()
            .route("/discovery/v2.0/keys", get(serve_jwks))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind jwks");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            url: format!("http://{addr}/discovery/v2.0/keys"),
            document,
            hits,
            task,
        }
    }

    /// Replace the published document.
    pub fn publish(&self, document: Value) {
        *self.document.write() = document;
    }

    /// Number of fetches served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for JwksServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a resolver against `server`. Refresh-on-miss is never rate-limited.
pub async fn resolver_for(server: &JwksServer) -> Arc<KeyResolver> {
    let source = HttpJwksSource::new(server.url.clone(), Duration::from_secs(5));
    let policy = RefreshPolicy {
        interval: Duration::from_secs(3600),
        on_miss_interval: Duration::ZERO,
    };
    Arc::new(KeyResolver::start(Arc::new(source), policy).await)
}

// ============================================================================
// Wired application
// ============================================================================

/// Configuration for the home tenant and tab app.
pub fn base_config(jwks_url: &str) -> Config {
    let mut config = Config::default();
    config.site.site_url = SITE_URL.to_string();
    config.tab_app.tenant_id = TENANT.to_string();
    config.tab_app.app_client_id = CLIENT_ID.to_string();
    config.tab_app.app_client_secret = "secret".to_string();
    config.sso.jwks_url = jwks_url.to_string();
    config
}

/// Host with alice, an archived bob, one team with a channel and a post.
pub fn seeded_host() -> InMemoryHost {
    let host = InMemoryHost::new();
    host.add_user(User {
        id: ALICE_ID.to_string(),
        username: "alice".to_string(),
        email: ALICE_EMAIL.to_string(),
        deleted_at: None,
    });
    host.add_user(User {
        id: "u-bob".to_string(),
        username: "bob".to_string(),
        email: "bob@contoso.com".to_string(),
        deleted_at: Some(chrono::Utc::now()),
    });
    host.add_team(Team {
        id: "t1".to_string(),
        name: "engineering".to_string(),
    });
    host.add_channel(Channel {
        id: "c1".to_string(),
        team_id: Some("t1".to_string()),
    });
    host.add_post(Post {
        id: "p1".to_string(),
        channel_id: "c1".to_string(),
    });
    host.add_team_member(ALICE_ID, "t1");
    host
}

/// Router plus handles on every collaborator.
pub struct TestApp {
    pub router: Router,
    pub host: Arc<InMemoryHost>,
    pub links: Arc<InMemoryIdentityLinkStore>,
    pub resolver: Arc<KeyResolver>,
    pub jwks: JwksServer,
    pub config: Arc<LiveConfig>,
}

impl TestApp {
    /// App publishing the primary and RSA keys.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// App with a config tweak applied before wiring.
    pub async fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        Self::start_publishing(jwks(&[SigningKey::Primary, SigningKey::Rsa]), tweak).await
    }

    /// App whose JWKS endpoint initially serves `document`.
    pub async fn start_publishing(document: Value, tweak: impl FnOnce(&mut Config)) -> Self {
        let jwks = JwksServer::start(document).await;
        let resolver = resolver_for(&jwks).await;

        let mut config = base_config(&jwks.url);
        tweak(&mut config);
        let config = Arc::new(LiveConfig::new(config));

        let host = Arc::new(seeded_host());
        let links = Arc::new(InMemoryIdentityLinkStore::new());
        let key_resolver: Arc<dyn ResolveKey> = resolver.clone();
        let authenticator = Authenticator::new(
            Some(key_resolver),
            links.clone(),
            host.clone(),
            host.clone(),
            host.clone(),
        );
        let sso = Arc::new(SsoService::new(authenticator, Arc::clone(&config)));
        let router = create_router(sso, Some(Arc::clone(&resolver)));

        Self {
            router,
            host,
            links,
            resolver,
            jwks,
            config,
        }
    }

    /// `GET /iframe/authenticate` with the given query and optional session header.
    pub async fn authenticate(&self, query: &str, session_user_id: Option<&str>) -> Response<Body> {
        let mut request = Request::builder().uri(format!("/iframe/authenticate?{query}"));
        if let Some(user_id) = session_user_id {
            request = request.header(USER_ID_HEADER, user_id);
        }
        self.send(request.body(Body::empty()).expect("request"))
            .await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible router")
    }
}

/// Response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

/// All `Set-Cookie` values on `response`.
pub fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

/// `Location` header of `response`.
pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
