use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use cdc_ledger::LedgerBinding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, Served, authorize, invalid_params, json_error, non_empty, serve};
use crate::resolver::RefreshError;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RefreshRequest {
    customer_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BoundLedgers {
    ledger_ids: Vec<i32>,
    ledger_names: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    tenant_id: String,
    source_a: BoundLedgers,
    source_b: BoundLedgers,
    refreshed_at: Option<DateTime<Utc>>,
}

impl From<LedgerBinding> for RefreshResponse {
    fn from(binding: LedgerBinding) -> Self {
        Self {
            tenant_id: binding.tenant_id,
            source_a: BoundLedgers {
                ledger_ids: binding.scope.source_a.into_iter().collect(),
                ledger_names: binding.source_a_names,
            },
            source_b: BoundLedgers {
                ledger_ids: binding.scope.source_b.into_iter().collect(),
                ledger_names: binding.source_b_names,
            },
            refreshed_at: binding.refreshed_at,
        }
    }
}

/// Body is optional; an empty body refreshes by tenant identity alone.
fn parse_request(body: &[u8]) -> Result<RefreshRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RefreshRequest::default());
    }
    serde_json::from_slice(body).map_err(|_| invalid_params("invalid JSON body"))
}

pub(super) async fn refresh(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    serve("/bindings/refresh", "POST", &headers, async {
        let principal = authorize(&state, &headers)?;
        let request = parse_request(&body)?;
        let customer_key = non_empty(request.customer_key.as_deref());

        let (binding, failures) = state
            .resolver
            .refresh(&state.executor, &principal.tenant_id, customer_key)
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "gateway.binding_refresh_failed");
                match err {
                    RefreshError::SourcesUnavailable(_) => json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "ERR_SOURCE_UNAVAILABLE",
                        "no source answered the ledger lookup",
                        true,
                    ),
                    RefreshError::Store(_) => json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "ERR_BINDING_UNAVAILABLE",
                        "ledger binding store unavailable",
                        true,
                    ),
                }
            })?;

        let degraded = failures.iter().map(|f| f.source).collect::<Vec<_>>();
        for source in &degraded {
            crate::metrics::observe_partial_result("/bindings/refresh", source.as_str());
        }

        Ok::<_, ApiError>(Served {
            body: RefreshResponse::from(binding),
            degraded,
        })
    })
    .await
}
