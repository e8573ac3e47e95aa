use std::time::Duration;

use cdc_auth::{JwtAuthenticator, JwtConfig};
use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

const SECRET: &str = "portal-test-secret";

fn authenticator(issuer: Option<&str>) -> JwtAuthenticator {
    JwtAuthenticator::new(JwtConfig {
        secret: SECRET.to_string(),
        issuer: issuer.map(str::to_string),
        audience: None,
        leeway: Duration::from_secs(0),
        principal_id_claim: "sub".to_string(),
        tenant_claim: "email".to_string(),
    })
    .expect("auth init should succeed")
}

fn headers_for(claims: &serde_json::Value, secret: &str, alg: Algorithm) -> HeaderMap {
    let token = encode(
        &Header::new(alg),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encode should succeed");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token)
            .parse()
            .expect("authorization header must parse"),
    );
    headers
}

#[test]
fn authenticate_extracts_tenant_from_valid_hs256_jwt() {
    let claims = serde_json::json!({
        "sub": "user-42",
        "email": "buyer@example.com",
        "iss": "cdc-portal",
        "exp": 2000000000,
        "iat": 1000000000,
    });

    let principal = authenticator(Some("cdc-portal"))
        .authenticate(&headers_for(&claims, SECRET, Algorithm::HS256))
        .expect("authenticate should succeed");

    assert_eq!(principal.principal_id, "user-42");
    assert_eq!(principal.tenant_id, "buyer@example.com");
}

#[test]
fn principal_falls_back_to_tenant_when_subject_missing() {
    let claims = serde_json::json!({"email": "buyer@example.com", "exp": 2000000000});
    let principal = authenticator(None)
        .authenticate(&headers_for(&claims, SECRET, Algorithm::HS256))
        .expect("authenticate should succeed");
    assert_eq!(principal.principal_id, "buyer@example.com");
}

#[test]
fn authenticate_rejects_bad_tokens() {
    let auth = authenticator(Some("cdc-portal"));
    let good = serde_json::json!({"sub": "u", "email": "e@example.com", "iss": "cdc-portal", "exp": 2000000000});

    let wrong_secret = auth
        .authenticate(&headers_for(&good, "other-secret", Algorithm::HS256))
        .unwrap_err();
    assert_eq!(wrong_secret.code, "ERR_AUTH_INVALID");

    let expired = serde_json::json!({"sub": "u", "email": "e@example.com", "iss": "cdc-portal", "exp": 1000});
    let err = auth
        .authenticate(&headers_for(&expired, SECRET, Algorithm::HS256))
        .unwrap_err();
    assert_eq!(err.code, "ERR_AUTH_INVALID");

    let wrong_issuer = serde_json::json!({"sub": "u", "email": "e@example.com", "iss": "elsewhere", "exp": 2000000000});
    assert!(
        auth.authenticate(&headers_for(&wrong_issuer, SECRET, Algorithm::HS256))
            .is_err()
    );

    let no_tenant = serde_json::json!({"sub": "u", "iss": "cdc-portal", "exp": 2000000000});
    let err = auth
        .authenticate(&headers_for(&no_tenant, SECRET, Algorithm::HS256))
        .unwrap_err();
    assert!(err.message.contains("email"));

    let wrong_alg = auth
        .authenticate(&headers_for(&good, SECRET, Algorithm::HS512))
        .unwrap_err();
    assert_eq!(wrong_alg.code, "ERR_AUTH_INVALID");
}

#[test]
fn authenticate_requires_authorization_header() {
    let err = authenticator(None)
        .authenticate(&HeaderMap::new())
        .unwrap_err();
    assert_eq!(err.code, "ERR_AUTH_REQUIRED");
}
