use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::Router;
use cdc_contracts::{LedgerScope, Payload, SourceTag};
use cdc_gateway::config::GatewayConfig;
use cdc_gateway::http::{Backends, router};
use cdc_gateway::source::MemorySource;
use cdc_ledger::{BindingLookup, BindingStore, LedgerBinding, MemoryBindingStore};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const TENANT: &str = "buyer@example.com";

fn test_db_url() -> Option<String> {
    std::env::var("CDC_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn gateway_config() -> GatewayConfig {
    GatewayConfig::from_kv(&HashMap::from([
        ("CDC_BIND_ADDR".to_string(), "127.0.0.1:0".to_string()),
        ("CDC_DB_URL".to_string(), "postgres://unused".to_string()),
        ("CDC_SOURCE_A_DB_URL".to_string(), "postgres://unused-a".to_string()),
        ("CDC_SOURCE_B_DB_URL".to_string(), "postgres://unused-b".to_string()),
        ("CDC_SOURCE_QUERY_TIMEOUT_MS".to_string(), "500".to_string()),
    ]))
    .expect("gateway config should be valid")
}

fn base_time() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp() - now.timestamp() % 60, 0).unwrap_or(now)
}

fn order_row(at: DateTime<Utc>, id: i64, ledger: i32, source: &str) -> Payload {
    let mut row = Payload::new();
    row.insert("_cursorDate".to_string(), json!(at.to_rfc3339()));
    row.insert("_cursorId".to_string(), json!(id));
    row.insert("JobBookingID".to_string(), json!(id));
    row.insert("LedgerID".to_string(), json!(ledger));
    row.insert("Source".to_string(), json!(source));
    row
}

/// Seven rows on A and five on B, interleaved in time, with one exact
/// timestamp shared across sources.
fn seeded_sources() -> (MemorySource, MemorySource) {
    let base = base_time();
    let a_rows = (0..7)
        .map(|i| order_row(base - TimeDelta::hours(2 * i), 100 + i, 1, "a"))
        .collect::<Vec<_>>();
    let mut b_rows = (0..4)
        .map(|i| order_row(base - TimeDelta::hours(2 * i + 1), 200 + i, 2, "b"))
        .collect::<Vec<_>>();
    b_rows.push(order_row(base - TimeDelta::hours(4), 250, 2, "b"));

    let mut kpi = Payload::new();
    kpi.insert("RangeDays".to_string(), json!(30));
    kpi.insert("CurrOrderValue".to_string(), json!(90));
    kpi.insert("PrevOrderValue".to_string(), json!(60));

    let mut kpi_b = kpi.clone();
    kpi_b.insert("CurrOrderValue".to_string(), json!(60));
    kpi_b.insert("PrevOrderValue".to_string(), json!(40));

    let a = MemorySource::new(SourceTag::A)
        .with_rows("portal_orders_list", a_rows)
        .with_result_sets("portal_dashboard", vec![vec![kpi]]);
    let b = MemorySource::new(SourceTag::B)
        .with_rows("portal_orders_list", b_rows)
        .with_result_sets("portal_dashboard", vec![vec![kpi_b]]);
    (a, b)
}

fn bound_tenant() -> LedgerBinding {
    LedgerBinding {
        tenant_id: TENANT.to_string(),
        scope: LedgerScope {
            source_a: BTreeSet::from([1]),
            source_b: BTreeSet::from([2]),
        },
        ..LedgerBinding::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_pages_merged_orders_and_degrades_per_source() {
    let log_buf = init_test_tracing();

    let (source_a, source_b) = seeded_sources();
    let backends = Backends {
        store: Arc::new(MemoryBindingStore::with_bindings([bound_tenant()])),
        source_a: Arc::new(source_a.clone()),
        source_b: Arc::new(source_b.clone()),
    };
    let app = router(gateway_config(), &backends).expect("gateway router should init");
    let (addr, shutdown, task) = spawn_server(app).await;

    let client = reqwest::Client::new();
    wait_for_healthz(&client, addr).await;

    // Walk every page and check the stream is sorted, disjoint and complete.
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;
    loop {
        let mut request = client
            .get(format!("http://{}/orders", addr))
            .header("x-cdc-tenant-id", TENANT)
            .query(&[("limit", "5")]);
        if let Some(c) = cursor.as_deref() {
            request = request.query(&[("cursor", c)]);
        }
        let response = request.send().await.expect("orders request should succeed");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.headers().get("x-cdc-request-id").is_some());

        let body: serde_json::Value = response.json().await.expect("orders body is json");
        let items = body["items"].as_array().expect("items array");
        assert!(items.len() <= 5);
        for item in items {
            let id = item["JobBookingID"].as_i64().expect("JobBookingID");
            assert!(seen.insert(id), "row {} served twice", id);
            assert!(item.get("_cursorDate").is_none());
            keys.push(id);
        }

        pages += 1;
        match body["nextCursor"].as_str() {
            Some(next) => cursor = Some(next.to_string()),
            None => break,
        }
        assert!(pages < 10, "pagination did not terminate");
    }
    assert_eq!(seen.len(), 12);
    assert_eq!(pages, 3);
    // Shared timestamp: the higher id sorts first across sources.
    let pos_250 = keys.iter().position(|id| *id == 250).expect("row 250");
    let pos_102 = keys.iter().position(|id| *id == 102).expect("row 102");
    assert!(pos_250 < pos_102);

    // Pinning a source bypasses the other.
    let pinned: serde_json::Value = client
        .get(format!("http://{}/orders?source=b&limit=50", addr))
        .header("x-cdc-tenant-id", TENANT)
        .send()
        .await
        .expect("pinned request should succeed")
        .json()
        .await
        .expect("pinned body is json");
    let pinned_items = pinned["items"].as_array().expect("items array");
    assert_eq!(pinned_items.len(), 5);
    assert!(pinned_items.iter().all(|i| i["Source"] == "b"));

    // Dashboard KPIs are summed before percentages are computed.
    let dashboard: serde_json::Value = client
        .get(format!("http://{}/dashboard", addr))
        .header("x-cdc-tenant-id", TENANT)
        .send()
        .await
        .expect("dashboard request should succeed")
        .json()
        .await
        .expect("dashboard body is json");
    assert_eq!(dashboard["kpis"][0]["OrderValueChangePct"], 50.0);

    // One source down: partial result flagged in a header.
    source_b.set_failing(true);
    let response = client
        .get(format!("http://{}/orders?limit=50", addr))
        .header("x-cdc-tenant-id", TENANT)
        .header("x-cdc-request-id", "req_smoke_degraded")
        .send()
        .await
        .expect("degraded request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-cdc-degraded-sources")
            .and_then(|v| v.to_str().ok()),
        Some("b")
    );
    let body: serde_json::Value = response.json().await.expect("degraded body is json");
    assert_eq!(body["items"].as_array().map(Vec::len), Some(7));

    // Both down: retryable 503.
    source_a.set_failing(true);
    let response = client
        .get(format!("http://{}/orders", addr))
        .header("x-cdc-tenant-id", TENANT)
        .send()
        .await
        .expect("failing request should complete");
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.expect("error body is json");
    assert_eq!(body["code"], "ERR_SOURCE_UNAVAILABLE");
    assert_eq!(body["retryable"], true);

    // Unknown tenant: non-retryable client error.
    let response = client
        .get(format!("http://{}/orders", addr))
        .header("x-cdc-tenant-id", "stranger@example.com")
        .send()
        .await
        .expect("unbound request should complete");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.expect("error body is json");
    assert_eq!(body["code"], "ERR_TENANT_NOT_BOUND");

    // Missing identity.
    let response = client
        .get(format!("http://{}/orders", addr))
        .send()
        .await
        .expect("anonymous request should complete");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let metrics = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .expect("metrics request should succeed")
        .text()
        .await
        .expect("metrics body");
    assert!(metrics.contains("cdc_gateway_http_requests_total"));
    assert!(metrics.contains("cdc_gateway_partial_results_total"));
    assert!(metrics.contains("cdc_gateway_source_queries_total"));

    let _ = shutdown.send(());
    let _ = task.await;
    backends.close().await;

    let logs = {
        let guard = log_buf.lock().expect("log lock should be available");
        String::from_utf8_lossy(&guard).to_string()
    };
    assert!(logs.contains("req_smoke_degraded"), "logs:\n{}", logs);
    assert!(logs.contains("gateway.source_query_failed"), "logs:\n{}", logs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_refreshes_bindings_against_postgres_store() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping binding store smoke test; set CDC_TEST_DB_URL to enable");
        return;
    };
    let _ = init_test_tracing();

    let store = BindingStore::connect_and_migrate(&db_url, Duration::from_secs(2))
        .await
        .expect("binding store should connect and migrate");

    let tenant = format!("smoke+{}@example.com", Utc::now().timestamp_micros());
    let mut ledger = Payload::new();
    ledger.insert("LedgerID".to_string(), json!(1));
    ledger.insert("LedgerName".to_string(), json!("Main"));

    let (source_a, source_b) = seeded_sources();
    let source_a = source_a.with_rows("portal_validate_email_key", vec![ledger]);
    let backends = Backends {
        store: Arc::new(store.clone()),
        source_a: Arc::new(source_a),
        source_b: Arc::new(source_b),
    };
    let app = router(gateway_config(), &backends).expect("gateway router should init");
    let (addr, shutdown, task) = spawn_server(app).await;

    let client = reqwest::Client::new();
    wait_for_healthz(&client, addr).await;

    let response = client
        .get(format!("http://{}/orders", addr))
        .header("x-cdc-tenant-id", tenant.as_str())
        .send()
        .await
        .expect("orders request should complete");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = client
        .post(format!("http://{}/bindings/refresh", addr))
        .header("x-cdc-tenant-id", tenant.as_str())
        .json(&json!({ "customerKey": "CK-1" }))
        .send()
        .await
        .expect("refresh request should complete");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("refresh body is json");
    assert_eq!(body["sourceA"]["ledgerIds"], json!([1]));
    assert_eq!(body["sourceB"]["ledgerIds"], json!([]));

    let stored = store
        .find_binding(&tenant)
        .await
        .expect("binding lookup should succeed")
        .expect("binding should exist after refresh");
    assert_eq!(stored.scope.source_a, BTreeSet::from([1]));
    assert_eq!(stored.source_a_names, vec!["Main".to_string()]);

    let response = client
        .get(format!("http://{}/orders?limit=50", addr))
        .header("x-cdc-tenant-id", tenant.as_str())
        .send()
        .await
        .expect("orders request should complete");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("orders body is json");
    assert_eq!(body["items"].as_array().map(Vec::len), Some(7));

    let ready: serde_json::Value = client
        .get(format!("http://{}/readyz", addr))
        .send()
        .await
        .expect("readyz request should complete")
        .json()
        .await
        .expect("readyz body is json");
    assert_eq!(ready["checks"]["binding_store"], true);

    let _ = shutdown.send(());
    let _ = task.await;
    backends.close().await;
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

async fn wait_for_healthz(client: &reqwest::Client, addr: SocketAddr) {
    let url = format!("http://{}/healthz", addr);

    for _ in 0..50 {
        if let Ok(response) = client.get(&url).send().await
            && response.status().is_success()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("server did not become ready at {}", url);
}

#[derive(Clone)]
struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut lock = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("log mutex poisoned"))?;
        lock.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}
