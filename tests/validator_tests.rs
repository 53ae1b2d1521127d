//! Token validation against keys served over HTTP.

mod common;

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::json;

use common::{
    CLIENT_ID, JwksServer, OTHER_TENANT, SITE_URL, SigningKey, TENANT, claims_with, jwks,
    resolver_for, valid_claims,
};
use msteams_tab_auth::sso::{
    KeyResolver, ResolveKey, TokenError, ValidateTokenParams, VerifiedClaims, validate_token,
};

struct Fixture {
    _jwks: JwksServer,
    resolver: std::sync::Arc<KeyResolver>,
}

async fn fixture() -> Fixture {
    let server = JwksServer::start(jwks(&[SigningKey::Primary, SigningKey::Rsa])).await;
    let resolver = resolver_for(&server).await;
    Fixture {
        _jwks: server,
        resolver,
    }
}

fn tenants(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| (*s).to_string()).collect()
}

async fn check(
    fx: &Fixture,
    token: &str,
    expected_tenant_ids: &[String],
    skip_validation: bool,
) -> Result<Option<VerifiedClaims>, TokenError> {
    let params = ValidateTokenParams {
        token,
        key_resolver: Some(fx.resolver.as_ref() as &dyn ResolveKey),
        expected_tenant_ids,
        skip_validation,
        site_url: SITE_URL,
        client_id: CLIENT_ID,
        clock_skew: Duration::ZERO,
    };
    validate_token(&params).await
}

#[tokio::test]
async fn rs256_token_is_accepted() {
    // GIVEN: the RSA key is published next to the Ed25519 one
    let fx = fixture().await;
    let token = SigningKey::Rsa.sign(&valid_claims());

    // WHEN
    let claims = check(&fx, &token, &tenants(&[TENANT]), false)
        .await
        .unwrap()
        .unwrap();

    // THEN
    assert_eq!(claims.subject_id(), Some(common::OID));
    assert_eq!(claims.tenant_id(), TENANT);
}

#[tokio::test]
async fn symmetric_algorithms_are_never_accepted() {
    let fx = fixture().await;

    for alg in [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512] {
        // GIVEN: perfect claims, a known kid, an HMAC signature
        let mut header = Header::new(alg);
        header.kid = Some("primary".to_string());
        let token = encode(&header, &valid_claims(), &EncodingKey::from_secret(b"k")).unwrap();

        // WHEN
        let err = check(&fx, &token, &tenants(&[TENANT]), false)
            .await
            .unwrap_err();

        // THEN
        assert!(
            matches!(err, TokenError::MalformedOrUnverifiableSignature(_)),
            "{alg:?} accepted as {err:?}"
        );
        assert_eq!(err.public_message(), "Failed to parse token");
    }
}

#[tokio::test]
async fn unsigned_token_is_rejected() {
    let fx = fixture().await;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","kid":"primary"}"#);
    let payload = URL_SAFE_NO_PAD.encode(valid_claims().to_string());
    let token = format!("{header}.{payload}.");

    let err = check(&fx, &token, &tenants(&[TENANT]), false)
        .await
        .unwrap_err();

    assert!(matches!(err, TokenError::MalformedOrUnverifiableSignature(_)));
}

#[tokio::test]
async fn signature_from_wrong_key_is_rejected() {
    // GIVEN: signed by the unpublished key while claiming to be "primary"
    let fx = fixture().await;
    let token = SigningKey::Rotated.sign_as(&valid_claims(), "primary");

    let err = check(&fx, &token, &tenants(&[TENANT]), false)
        .await
        .unwrap_err();

    assert!(matches!(err, TokenError::MalformedOrUnverifiableSignature(_)));
}

#[tokio::test]
async fn each_temporal_claim_is_required() {
    let fx = fixture().await;

    for claim in ["iat", "exp", "nbf"] {
        let token = SigningKey::Primary.sign(&claims_with(json!({ claim: null })));

        let err = check(&fx, &token, &tenants(&[TENANT]), false)
            .await
            .unwrap_err();

        assert!(
            matches!(err, TokenError::MissingRequiredClaim(name) if name == claim),
            "{claim}: {err:?}"
        );
        assert_eq!(err.public_message(), "Unexpected claims");
    }
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let fx = fixture().await;
    let past = common::now() - 10;
    let token = SigningKey::Primary.sign(&claims_with(json!({ "exp": past })));

    let err = check(&fx, &token, &tenants(&[TENANT]), false)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TokenError::ExpiredOrNotYetValid { claim: "exp", .. }
    ));
}

#[tokio::test]
async fn tid_must_be_a_guid() {
    let fx = fixture().await;

    let token = SigningKey::Primary.sign(&claims_with(json!({ "tid": "contoso" })));
    let err = check(&fx, &token, &tenants(&[TENANT]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::InvalidTenantId));

    let token = SigningKey::Primary.sign(&claims_with(json!({ "tid": null })));
    let err = check(&fx, &token, &tenants(&[TENANT]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::MissingRequiredClaim("tid")));
}

#[tokio::test]
async fn tenant_list_changes_take_effect_per_call() {
    // GIVEN: one token for the home tenant
    let fx = fixture().await;
    let token = SigningKey::Primary.sign(&valid_claims());

    // WHEN / THEN: accepted, rejected once removed, accepted again once restored
    assert!(check(&fx, &token, &tenants(&[TENANT]), false).await.is_ok());

    let err = check(&fx, &token, &tenants(&[OTHER_TENANT]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::TenantMismatch(_)));

    assert!(
        check(&fx, &token, &tenants(&[OTHER_TENANT, TENANT]), false)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn wildcard_tenant_only_applies_in_skip_mode() {
    let fx = fixture().await;
    let token = SigningKey::Primary.sign(&claims_with(json!({ "tid": OTHER_TENANT })));

    let err = check(&fx, &token, &tenants(&["*"]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::TenantMismatch(_)));

    let claims = check(&fx, &token, &tenants(&["*"]), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claims.tenant_id(), OTHER_TENANT);
}

#[tokio::test]
async fn skip_mode_still_verifies_signature() {
    let fx = fixture().await;
    let token = SigningKey::Rotated.sign_as(&valid_claims(), "primary");

    let err = check(&fx, &token, &tenants(&["*"]), true)
        .await
        .unwrap_err();

    assert!(matches!(err, TokenError::MalformedOrUnverifiableSignature(_)));
}

#[tokio::test]
async fn skip_mode_ignores_audience() {
    let fx = fixture().await;
    let token = SigningKey::Primary.sign(&claims_with(json!({ "aud": "api://elsewhere/x" })));

    let err = check(&fx, &token, &tenants(&[TENANT]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::AudienceMismatch { .. }));

    assert!(check(&fx, &token, &tenants(&[TENANT]), true).await.is_ok());
}
