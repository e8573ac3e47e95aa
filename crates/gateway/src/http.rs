use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cdc_auth::{JwtAuthenticator, Principal};
use cdc_contracts::{Cursor, LedgerScope, SourceTag};
use cdc_ledger::{BindingLookup, BindingStore};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::binding_cache::BindingCache;
use crate::config::{AuthMode, GatewayConfig, StartupError};
use crate::executor::{Executor, SourceOutcome, all_queried_failed, degraded_sources};
use crate::rate_limit::RateLimiter;
use crate::resolver::{BindingResolver, ResolveError};
use crate::source::{PgSourceClient, SourceClient};

mod bindings;
mod lists;
mod orders;

pub const REQUEST_ID_HEADER: &str = "x-cdc-request-id";
pub const TENANT_HEADER: &str = "x-cdc-tenant-id";
pub const LOCAL_AUTH_SECRET_HEADER: &str = "x-cdc-local-auth-secret";
pub const DEGRADED_SOURCES_HEADER: &str = "x-cdc-degraded-sources";

const RATE_LIMIT_MAX_TENANTS: usize = 16_384;

/// Upstream handles the router is built on. Production opens Postgres-backed
/// clients; tests inject in-memory ones.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn BindingLookup>,
    pub source_a: Arc<dyn SourceClient>,
    pub source_b: Arc<dyn SourceClient>,
}

impl Backends {
    pub async fn open(config: &GatewayConfig) -> Result<Self, StartupError> {
        let store = BindingStore::connect_and_migrate(&config.db_url, config.binding_timeout())
            .await
            .map_err(|err| StartupError {
                code: "ERR_BINDING_STORE_UNAVAILABLE",
                message: format!("failed to initialize binding store: {}", err),
            })?;

        let open_source = |tag: SourceTag, db_url: &str| {
            PgSourceClient::open(
                tag,
                db_url,
                config.source_max_connections,
                config.source_query_timeout(),
            )
            .map_err(|err| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!("failed to open source {}: {}", tag, err),
            })
        };
        let source_a = open_source(SourceTag::A, &config.source_a_db_url)?;
        let source_b = open_source(SourceTag::B, &config.source_b_db_url)?;

        Ok(Self {
            store: Arc::new(store),
            source_a: Arc::new(source_a),
            source_b: Arc::new(source_b),
        })
    }

    pub async fn close(&self) {
        self.source_a.close().await;
        self.source_b.close().await;
        self.store.close().await;
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    jwt: Option<JwtAuthenticator>,
    resolver: BindingResolver,
    executor: Executor,
    rate_limiter: RateLimiter,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl AppState {
    pub fn new(config: GatewayConfig, backends: &Backends) -> Result<Self, StartupError> {
        let jwt = if config.auth_mode == AuthMode::Jwt {
            let jwt_config = config.jwt.clone().ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "jwt auth mode requires jwt config".to_string(),
            })?;
            Some(
                JwtAuthenticator::new(jwt_config).map_err(|err| StartupError {
                    code: err.code,
                    message: err.message,
                })?,
            )
        } else {
            None
        };

        let resolver = BindingResolver::new(
            backends.store.clone(),
            BindingCache::new(
                config.binding_cache_max_entries,
                Duration::from_millis(config.binding_cache_ttl_ms),
            ),
            config.binding_timeout(),
        );
        let executor = Executor::new(
            backends.source_a.clone(),
            backends.source_b.clone(),
            config.source_query_timeout(),
            config.over_fetch_margin,
        );
        let rate_limiter = RateLimiter::new(
            Duration::from_secs(config.rate_limit_window_secs.max(1)),
            config.rate_limit_requests_per_window,
            RATE_LIMIT_MAX_TENANTS,
        );

        Ok(Self {
            config,
            jwt,
            resolver,
            executor,
            rate_limiter,
        })
    }
}

pub fn router(config: GatewayConfig, backends: &Backends) -> Result<Router, StartupError> {
    let state = AppState::new(config, backends)?;

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/orders", get(lists::orders))
        .route("/dispatches", get(lists::dispatches))
        .route("/approvals", get(lists::approvals))
        .route("/otif", get(lists::otif))
        .route("/dashboard", get(lists::dashboard))
        .route("/orders/{job_id}/processes", get(orders::processes))
        .route("/orders/{job_id}/deliveries", get(orders::deliveries))
        .route("/bindings/refresh", post(bindings::refresh))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let (store_ready, a_ready, b_ready) = tokio::join!(
        state.resolver.ping(),
        state.executor.ping(SourceTag::A),
        state.executor.ping(SourceTag::B),
    );

    let mut checks = BTreeMap::new();
    checks.insert("binding_store", store_ready);
    checks.insert("source_a", a_ready);
    checks.insert("source_b", b_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) = extract_principal(&state, &headers)
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// A successful body plus the sources that could not contribute to it.
struct Served<T> {
    body: T,
    degraded: Vec<SourceTag>,
}

/// Runs a handler body inside the request span, records HTTP metrics and
/// stamps the request id and degraded-source headers.
async fn serve<T, F>(route: &'static str, method: &'static str, headers: &HeaderMap, work: F) -> Response
where
    T: Serialize,
    F: Future<Output = Result<Served<T>, ApiError>>,
{
    let started = Instant::now();
    let request_id = extract_request_id(headers);
    let span = tracing::info_span!(
        "gateway.request",
        route,
        method,
        request_id = %request_id,
        tenant_id = tracing::field::Empty,
        degraded = tracing::field::Empty,
        rows = tracing::field::Empty,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let result = work.instrument(span.clone()).await;

    let mut response = match result {
        Ok(served) => {
            let mut response = Json(served.body).into_response();
            if !served.degraded.is_empty() {
                let value = served
                    .degraded
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                if let Ok(value) = HeaderValue::from_str(&value) {
                    response.headers_mut().insert(DEGRADED_SOURCES_HEADER, value);
                }
            }
            response
        }
        Err(err) => err.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status();
    span.record("status", status.as_u16());
    span.record("latency_ms", started.elapsed().as_millis() as u64);
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
    response
}

/// Authenticates the caller and applies the per-tenant rate limit.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let principal = extract_principal(state, headers)?;
    tracing::Span::current().record("tenant_id", principal.tenant_id.as_str());

    if !state.rate_limiter.allow(&principal.tenant_id) {
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "rate limit exceeded",
            true,
        ));
    }
    Ok(principal)
}

async fn resolve_scope(state: &AppState, principal: &Principal) -> Result<LedgerScope, ApiError> {
    state
        .resolver
        .resolve(&principal.tenant_id)
        .await
        .map_err(|err| match err {
            ResolveError::NotBound => json_error(
                StatusCode::BAD_REQUEST,
                "ERR_TENANT_NOT_BOUND",
                "no ledger binding for tenant; refresh bindings first",
                false,
            ),
            ResolveError::Unavailable(err) => {
                tracing::warn!(error = %err, "gateway.binding_lookup_failed");
                json_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "ERR_BINDING_UNAVAILABLE",
                    "ledger binding store unavailable",
                    true,
                )
            }
        })
}

/// Fails the request when every queried source failed; otherwise records
/// the partial result and returns the degraded sources.
fn settle<T>(route: &'static str, outcomes: &[SourceOutcome<T>]) -> Result<Vec<SourceTag>, ApiError> {
    if all_queried_failed(outcomes) {
        return Err(json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_SOURCE_UNAVAILABLE",
            "no source answered the query",
            true,
        ));
    }

    let degraded = degraded_sources(outcomes);
    for source in &degraded {
        crate::metrics::observe_partial_result(route, source.as_str());
    }
    if !degraded.is_empty() {
        let joined = degraded.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",");
        tracing::Span::current().record("degraded", joined.as_str());
    }
    Ok(degraded)
}

/// Splits per-source results into `(a, b)`, defaulting sources that were
/// not requested.
fn split_by_source<T: Default>(outcomes: Vec<SourceOutcome<T>>) -> (T, T) {
    let mut a = T::default();
    let mut b = T::default();
    for outcome in outcomes {
        match outcome.source {
            SourceTag::A => a = outcome.rows,
            SourceTag::B => b = outcome.rows,
        }
    }
    (a, b)
}

fn note_fallback(kind: &'static str, raw: &str) {
    let shown = raw.chars().take(64).collect::<String>();
    tracing::warn!(kind, raw = %shown, "gateway.input_fallback");
    crate::metrics::inc_input_fallback(kind);
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|v| !v.is_empty())
}

/// Page size clamped to `[1, max]`; unparseable input falls back to the
/// view's default.
fn page_limit(raw: Option<&str>, default: usize, max: usize) -> usize {
    let max = max.max(1);
    let Some(raw) = non_empty(raw) else {
        return default.clamp(1, max);
    };
    match raw.parse::<usize>() {
        Ok(limit) => limit.clamp(1, max),
        Err(_) => {
            note_fallback("limit", raw);
            default.clamp(1, max)
        }
    }
}

fn decode_cursor(raw: Option<&str>) -> Option<Cursor> {
    let raw = non_empty(raw)?;
    let decoded = cdc_merge::cursor::decode(raw);
    if decoded.is_none() {
        note_fallback("cursor", raw);
    }
    decoded
}

/// `source` pins one upstream; anything unrecognised reads as both.
fn source_selection(raw: Option<&str>) -> &'static [SourceTag] {
    let Some(raw) = non_empty(raw) else {
        return &SourceTag::ALL;
    };
    match SourceTag::parse(raw) {
        Some(SourceTag::A) => &[SourceTag::A],
        Some(SourceTag::B) => &[SourceTag::B],
        None if raw.eq_ignore_ascii_case("all") || raw.eq_ignore_ascii_case("both") => {
            &SourceTag::ALL
        }
        None => {
            note_fallback("source", raw);
            &SourceTag::ALL
        }
    }
}

fn extract_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    match state.config.auth_mode {
        AuthMode::Local => {
            validate_local_auth_shared_secret(
                headers,
                state.config.local_auth_shared_secret.as_deref(),
            )?;
            let tenant_id = extract_tenant_id(headers)?;
            Ok(Principal {
                principal_id: tenant_id.clone(),
                tenant_id,
            })
        }
        AuthMode::Jwt => {
            let Some(auth) = state.jwt.as_ref() else {
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ERR_INTERNAL",
                    "jwt authenticator is not initialized",
                    false,
                ));
            };

            auth.authenticate(headers)
                .map_err(|err| json_error(StatusCode::UNAUTHORIZED, err.code, err.message, false))
        }
    }
}

fn validate_local_auth_shared_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = headers
        .get(LOCAL_AUTH_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing local auth secret",
                false,
            )
        })?;

    if provided_secret != expected_secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "invalid local auth secret",
            false,
        ));
    }

    Ok(())
}

fn extract_tenant_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing x-cdc-tenant-id header",
                false,
            )
        })
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

fn invalid_params(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", message, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use cdc_ledger::{LedgerBinding, MemoryBindingStore};
    use std::collections::{BTreeSet, HashMap};

    pub(super) struct Harness {
        pub state: AppState,
        pub store: MemoryBindingStore,
        pub source_a: MemorySource,
        pub source_b: MemorySource,
    }

    pub(super) fn config(extra: &[(&str, &str)]) -> GatewayConfig {
        let mut kv = HashMap::from([
            ("CDC_DB_URL".to_string(), "postgres://bindings".to_string()),
            ("CDC_SOURCE_A_DB_URL".to_string(), "postgres://a".to_string()),
            ("CDC_SOURCE_B_DB_URL".to_string(), "postgres://b".to_string()),
        ]);
        for (k, v) in extra {
            kv.insert(k.to_string(), v.to_string());
        }
        GatewayConfig::from_kv(&kv).expect("test config should parse")
    }

    pub(super) fn harness(source_a: MemorySource, source_b: MemorySource) -> Harness {
        let store = MemoryBindingStore::with_bindings([LedgerBinding {
            tenant_id: "buyer@example.com".to_string(),
            scope: LedgerScope {
                source_a: BTreeSet::from([1]),
                source_b: BTreeSet::from([2]),
            },
            ..LedgerBinding::default()
        }]);
        let backends = Backends {
            store: Arc::new(store.clone()),
            source_a: Arc::new(source_a.clone()),
            source_b: Arc::new(source_b.clone()),
        };
        let state = AppState::new(config(&[]), &backends).expect("state should build");
        Harness {
            state,
            store,
            source_a,
            source_b,
        }
    }

    pub(super) fn tenant_headers(tenant: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_str(tenant).unwrap());
        headers
    }

    pub(super) async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&bytes).expect("body should be json")
    }

    #[test]
    fn page_limit_clamps_and_falls_back() {
        assert_eq!(page_limit(None, 25, 200), 25);
        assert_eq!(page_limit(Some("10"), 25, 200), 10);
        assert_eq!(page_limit(Some("0"), 25, 200), 1);
        assert_eq!(page_limit(Some("5000"), 25, 200), 200);
        assert_eq!(page_limit(Some("-3"), 25, 200), 25);
        assert_eq!(page_limit(Some("ten"), 50, 20), 20);
    }

    #[test]
    fn source_selection_pins_or_falls_back_to_both() {
        assert_eq!(source_selection(Some("a")), &[SourceTag::A]);
        assert_eq!(source_selection(Some("DB2")), &[SourceTag::B]);
        assert_eq!(source_selection(Some("all")), &SourceTag::ALL);
        assert_eq!(source_selection(Some("zzz")), &SourceTag::ALL);
        assert_eq!(source_selection(None), &SourceTag::ALL);
    }

    #[test]
    fn malformed_cursor_is_ignored() {
        assert_eq!(decode_cursor(Some("not-base64!!")), None);
        assert_eq!(decode_cursor(Some("   ")), None);
        assert_eq!(decode_cursor(None), None);
    }

    #[test]
    fn request_ids_are_sanitized_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc<>123"));
        assert_eq!(extract_request_id(&headers), "abc123");

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("<>"));
        assert!(extract_request_id(&headers).parse::<Ulid>().is_ok());
    }

    #[test]
    fn local_auth_requires_tenant_header_and_secret() {
        let h = harness(MemorySource::new(SourceTag::A), MemorySource::new(SourceTag::B));
        let err = extract_principal(&h.state, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
        assert_eq!(err.1.code, "ERR_AUTH_REQUIRED");

        let principal = extract_principal(&h.state, &tenant_headers("buyer@example.com"))
            .expect("tenant header should authenticate");
        assert_eq!(principal.tenant_id, "buyer@example.com");

        let mut state = h.state.clone();
        state.config.local_auth_shared_secret = Some("s3cret".to_string());
        let mut headers = tenant_headers("buyer@example.com");
        assert_eq!(
            extract_principal(&state, &headers).unwrap_err().1.code,
            "ERR_AUTH_REQUIRED"
        );
        headers.insert(LOCAL_AUTH_SECRET_HEADER, HeaderValue::from_static("wrong"));
        assert_eq!(
            extract_principal(&state, &headers).unwrap_err().1.code,
            "ERR_AUTH_INVALID"
        );
        headers.insert(LOCAL_AUTH_SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(extract_principal(&state, &headers).is_ok());
    }

    #[tokio::test]
    async fn readyz_reports_each_dependency() {
        let h = harness(MemorySource::new(SourceTag::A), MemorySource::new(SourceTag::B));
        h.source_b.set_failing(true);

        let response = readyz(State(h.state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["checks"]["binding_store"], true);
        assert_eq!(body["checks"]["source_a"], true);
        assert_eq!(body["checks"]["source_b"], false);

        h.source_b.set_failing(false);
        h.store.set_unavailable(true);
        let body = body_json(readyz(State(h.state)).await.into_response()).await;
        assert_eq!(body["checks"]["binding_store"], false);
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess_requests() {
        let h = harness(MemorySource::new(SourceTag::A), MemorySource::new(SourceTag::B));
        let mut state = h.state.clone();
        state.rate_limiter = RateLimiter::new(Duration::from_secs(60), 1, 16);
        let headers = tenant_headers("buyer@example.com");

        assert!(authorize(&state, &headers).is_ok());
        let err = authorize(&state, &headers).unwrap_err();
        assert_eq!(err.0, StatusCode::TOO_MANY_REQUESTS);
        assert!(err.1.retryable);
    }
}
