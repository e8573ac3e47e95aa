use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static SOURCE_QUERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static PARTIAL_RESULTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static INPUT_FALLBACKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ROWS_DROPPED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn counter_vec(
    cell: &'static OnceLock<IntCounterVec>,
    name: &'static str,
    help: &'static str,
    labels: &[&str],
) -> &'static IntCounterVec {
    cell.get_or_init(|| {
        register_collector(
            IntCounterVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|err| panic!("create {}: {}", name, err)),
        )
    })
}

fn http_requests_total() -> &'static IntCounterVec {
    counter_vec(
        &HTTP_REQUESTS_TOTAL,
        "cdc_gateway_http_requests_total",
        "Gateway HTTP request count.",
        &["route", "method", "status"],
    )
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "cdc_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create cdc_gateway_http_request_duration_seconds"),
        )
    })
}

fn source_queries_total() -> &'static IntCounterVec {
    counter_vec(
        &SOURCE_QUERIES_TOTAL,
        "cdc_gateway_source_queries_total",
        "Upstream procedure calls by source and outcome.",
        &["source", "procedure", "outcome"],
    )
}

fn partial_results_total() -> &'static IntCounterVec {
    counter_vec(
        &PARTIAL_RESULTS_TOTAL,
        "cdc_gateway_partial_results_total",
        "Responses served without one source's rows.",
        &["route", "source"],
    )
}

fn input_fallbacks_total() -> &'static IntCounterVec {
    counter_vec(
        &INPUT_FALLBACKS_TOTAL,
        "cdc_gateway_input_fallbacks_total",
        "Malformed request inputs replaced by defaults.",
        &["kind"],
    )
}

fn rows_dropped_total() -> &'static IntCounterVec {
    counter_vec(
        &ROWS_DROPPED_TOTAL,
        "cdc_gateway_rows_dropped_total",
        "Upstream rows discarded before merging.",
        &["procedure", "reason"],
    )
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

/// `outcome` is one of `ok`, `skipped`, `error`, `timeout`.
pub fn observe_source_query(source: &str, procedure: &str, outcome: &str) {
    source_queries_total()
        .with_label_values(&[source, procedure, outcome])
        .inc();
}

pub fn observe_partial_result(route: &str, source: &str) {
    partial_results_total()
        .with_label_values(&[route, source])
        .inc();
}

pub fn inc_input_fallback(kind: &str) {
    input_fallbacks_total().with_label_values(&[kind]).inc();
}

pub fn add_rows_dropped(procedure: &str, reason: &str, count: usize) {
    if count == 0 {
        return;
    }
    rows_dropped_total()
        .with_label_values(&[procedure, reason])
        .inc_by(count as u64);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = partial_results_total();
    let _ = input_fallbacks_total();
    let _ = rows_dropped_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_observed_series() {
        observe_source_query("a", "portal_orders_list", "ok");
        inc_input_fallback("unknown_range_token");
        add_rows_dropped("portal_orders_list", "missing_key", 2);

        let (body, content_type) = render().expect("render should succeed");
        let body = String::from_utf8(body).expect("metrics are utf8");
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("cdc_gateway_source_queries_total"));
        assert!(body.contains("cdc_gateway_input_fallbacks_total{kind=\"unknown_range_token\"}"));
        assert!(body.contains("cdc_gateway_rows_dropped_total"));
    }
}
