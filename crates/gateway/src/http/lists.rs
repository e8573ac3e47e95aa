use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use cdc_contracts::{ListResponse, ListView, SourceTag};
use cdc_merge::dashboard::{Dashboard, merge_dashboard};
use cdc_merge::{merge, normalize, take_page};
use chrono::Utc;
use serde::Deserialize;

use super::{
    ApiError, AppState, Served, authorize, decode_cursor, invalid_params, note_fallback,
    page_limit, resolve_scope, serve, settle, source_selection, split_by_source,
};
use crate::executor::{ListQuery, normalize_search};

#[derive(Debug, Default, Deserialize)]
pub(super) struct ListParams {
    range: Option<String>,
    from: Option<String>,
    to: Option<String>,
    q: Option<String>,
    limit: Option<String>,
    cursor: Option<String>,
    source: Option<String>,
    tab: Option<String>,
}

pub(super) async fn orders(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    list_view(state, headers, params, ListView::Orders).await
}

pub(super) async fn dispatches(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    list_view(state, headers, params, ListView::Dispatches).await
}

pub(super) async fn approvals(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    list_view(state, headers, params, ListView::Approvals).await
}

pub(super) async fn otif(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    list_view(state, headers, params, ListView::Otif).await
}

fn list_route(view: ListView) -> &'static str {
    match view {
        ListView::Orders => "/orders",
        ListView::Dispatches => "/dispatches",
        ListView::Approvals => "/approvals",
        ListView::Otif => "/otif",
    }
}

async fn list_view(
    state: AppState,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
    view: ListView,
) -> Response {
    let route = list_route(view);
    serve(route, "GET", &headers, async {
        let Query(params) = params.map_err(|_| invalid_params("invalid query string"))?;
        let principal = authorize(&state, &headers)?;
        let scope = resolve_scope(&state, &principal).await?;

        let normalized = normalize(
            params.range.as_deref(),
            params.from.as_deref(),
            params.to.as_deref(),
            Utc::now(),
        );
        if let Some(fallback) = normalized.fallback {
            let raw = params
                .range
                .as_deref()
                .or(params.from.as_deref())
                .unwrap_or_default();
            note_fallback(fallback.as_str(), raw);
        }

        let limit = page_limit(
            params.limit.as_deref(),
            view.default_limit(),
            state.config.max_page_limit,
        );
        let cursor = decode_cursor(params.cursor.as_deref());
        let sources = source_selection(params.source.as_deref());

        let query = ListQuery {
            view,
            window: normalized.window,
            status: view.status_filter(params.tab.as_deref()),
            search: normalize_search(params.q.as_deref()),
            cursor,
            limit,
        };
        let outcomes = state.executor.list_all(sources, &scope, &query).await;
        let degraded = settle(route, &outcomes)?;

        let (rows_a, rows_b) = split_by_source(outcomes);
        let page = match sources {
            [SourceTag::A] => take_page(rows_a, limit, cursor.as_ref()),
            [SourceTag::B] => take_page(rows_b, limit, cursor.as_ref()),
            _ => merge(rows_a, rows_b, limit, cursor.as_ref()),
        };

        tracing::Span::current().record("rows", page.items.len());
        tracing::debug!(
            from_a = page.from_a,
            from_b = page.from_b,
            has_more = page.next_cursor.is_some(),
            "gateway.page_merged"
        );

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

/// Dashboard procedures take ledger ids only; window and paging
/// parameters are ignored.
pub(super) async fn dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    serve("/dashboard", "GET", &headers, async {
        let Query(params) = params.map_err(|_| invalid_params("invalid query string"))?;
        let principal = authorize(&state, &headers)?;
        let scope = resolve_scope(&state, &principal).await?;
        let sources = source_selection(params.source.as_deref());

        let outcomes = state.executor.dashboard_all(sources, &scope).await;
        let degraded = settle("/dashboard", &outcomes)?;

        let (a, b) = split_by_source(outcomes);
        let dashboard: Dashboard = merge_dashboard(a, b);
        tracing::Span::current().record("rows", dashboard.recent_orders.len());

        Ok::<_, ApiError>(Served {
            body: dashboard,
            degraded,
        })
    })
    .await
}
