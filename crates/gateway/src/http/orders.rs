use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use cdc_contracts::{ListResponse, Payload};
use cdc_merge::take_page_with;
use serde::Deserialize;

use super::{
    ApiError, AppState, Served, authorize, decode_cursor, invalid_params, json_error,
    page_limit, resolve_scope, serve, settle, source_selection,
};
use crate::executor::{DELIVERY_KEYS, DeliveryQuery, SourceOutcome};

const DEFAULT_DELIVERY_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub(super) struct OrderParams {
    source: Option<String>,
    limit: Option<String>,
    cursor: Option<String>,
}

fn parse_job_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| invalid_params("job id must be a positive integer"))
}

fn not_found(message: &str) -> ApiError {
    json_error(StatusCode::NOT_FOUND, "ERR_NOT_FOUND", message, false)
}

/// First answering source with rows, in source order.
fn first_with_rows<T>(outcomes: Vec<SourceOutcome<Vec<T>>>) -> Option<Vec<T>> {
    outcomes
        .into_iter()
        .find(|o| o.failure.is_none() && !o.rows.is_empty())
        .map(|o| o.rows)
}

pub(super) async fn processes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    params: Result<Query<OrderParams>, QueryRejection>,
) -> Response {
    serve("/orders/{job_id}/processes", "GET", &headers, async {
        let Query(params) = params.map_err(|_| invalid_params("invalid query string"))?;
        let job_id = parse_job_id(&job_id)?;
        let principal = authorize(&state, &headers)?;
        let scope = resolve_scope(&state, &principal).await?;
        let sources = source_selection(params.source.as_deref());

        let outcomes = state
            .executor
            .order_processes_all(sources, &scope, job_id)
            .await;
        let degraded = settle("/orders/{job_id}/processes", &outcomes)?;

        let rows: Vec<Payload> = if sources.len() == 1 {
            outcomes.into_iter().next().map(|o| o.rows).unwrap_or_default()
        } else {
            first_with_rows(outcomes).ok_or_else(|| not_found("no processes for job"))?
        };
        tracing::Span::current().record("rows", rows.len());

        Ok::<_, ApiError>(Served {
            body: rows,
            degraded,
        })
    })
    .await
}

pub(super) async fn deliveries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    params: Result<Query<OrderParams>, QueryRejection>,
) -> Response {
    serve("/orders/{job_id}/deliveries", "GET", &headers, async {
        let Query(params) = params.map_err(|_| invalid_params("invalid query string"))?;
        let job_id = parse_job_id(&job_id)?;
        let principal = authorize(&state, &headers)?;
        let scope = resolve_scope(&state, &principal).await?;
        let sources = source_selection(params.source.as_deref());

        let query = DeliveryQuery {
            job_id,
            cursor: decode_cursor(params.cursor.as_deref()),
            limit: page_limit(
                params.limit.as_deref(),
                DEFAULT_DELIVERY_LIMIT,
                state.config.max_page_limit,
            ),
        };
        let outcomes = state
            .executor
            .order_deliveries_all(sources, &scope, &query)
            .await;
        let degraded = settle("/orders/{job_id}/deliveries", &outcomes)?;

        // Prefer a source with rows; otherwise any source that answered.
        let answered = outcomes.iter().position(|o| o.failure.is_none());
        let with_rows = outcomes
            .iter()
            .position(|o| o.failure.is_none() && !o.rows.is_empty());
        let rows = with_rows
            .or(answered)
            .and_then(|idx| outcomes.into_iter().nth(idx))
            .map(|o| o.rows)
            .unwrap_or_default();

        let page = take_page_with(
            rows,
            query.limit,
            query.cursor.as_ref(),
            DELIVERY_KEYS.repeats(),
        );
        tracing::Span::current().record("rows", page.items.len());

        Ok::<_, ApiError>(Served {
            body: ListResponse {
                items: page.items,
                next_cursor: page.next_cursor.as_ref().map(cdc_merge::cursor::encode),
            },
            degraded,
        })
    })
    .await
}
