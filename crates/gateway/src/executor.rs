use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cdc_contracts::{Cursor, DateWindow, LedgerScope, ListView, Payload, Row, SourceTag};
use cdc_merge::dashboard::DashboardSets;
use cdc_merge::window::retain_civil_range;
use cdc_merge::{RowKeys, enforce_descending, map_rows, source_bound};

use crate::metrics;
use crate::source::{ProcedureParams, ResultSet, SourceClient};

pub const DASHBOARD_PROCEDURE: &str = "portal_dashboard";
pub const PROCESSES_PROCEDURE: &str = "portal_order_processes";
pub const DELIVERIES_PROCEDURE: &str = "portal_order_deliveries";
pub const VALIDATE_PROCEDURE: &str = "portal_validate_email_key";

pub const DELIVERY_KEYS: RowKeys = RowKeys::display("DeliveryTs", Some("DeliveryId"));

/// Upstream search text is capped at this many characters.
pub const MAX_SEARCH_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: SourceTag,
    pub procedure: &'static str,
    pub timed_out: bool,
    pub message: String,
}

/// Result of one source's leg of a request. A failed or skipped leg carries
/// empty rows so callers can always merge.
#[derive(Debug, Clone)]
pub struct SourceOutcome<T> {
    pub source: SourceTag,
    pub rows: T,
    pub failure: Option<SourceFailure>,
    pub skipped: bool,
}

impl<T: Default> SourceOutcome<T> {
    fn ok(source: SourceTag, rows: T) -> Self {
        Self {
            source,
            rows,
            failure: None,
            skipped: false,
        }
    }

    fn skipped(source: SourceTag) -> Self {
        Self {
            source,
            rows: T::default(),
            failure: None,
            skipped: true,
        }
    }

    fn failed(failure: SourceFailure) -> Self {
        Self {
            source: failure.source,
            rows: T::default(),
            failure: Some(failure),
            skipped: false,
        }
    }
}

/// Sources whose leg failed, in source order.
pub fn degraded_sources<T>(outcomes: &[SourceOutcome<T>]) -> Vec<SourceTag> {
    outcomes
        .iter()
        .filter(|o| o.failure.is_some())
        .map(|o| o.source)
        .collect()
}

/// True when at least one source was queried and every queried source
/// failed. Skipped legs do not count either way.
pub fn all_queried_failed<T>(outcomes: &[SourceOutcome<T>]) -> bool {
    let mut queried = outcomes.iter().filter(|o| !o.skipped).peekable();
    queried.peek().is_some() && queried.all(|o| o.failure.is_some())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub view: ListView,
    pub window: DateWindow,
    pub status: Option<&'static str>,
    pub search: Option<String>,
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryQuery {
    pub job_id: i64,
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

/// Runs allowlisted procedures against both sources with a per-call timeout
/// and turns upstream errors into per-source outcomes.
#[derive(Clone)]
pub struct Executor {
    source_a: Arc<dyn SourceClient>,
    source_b: Arc<dyn SourceClient>,
    query_timeout: Duration,
    over_fetch_margin: usize,
}

impl Executor {
    pub fn new(
        source_a: Arc<dyn SourceClient>,
        source_b: Arc<dyn SourceClient>,
        query_timeout: Duration,
        over_fetch_margin: usize,
    ) -> Self {
        Self {
            source_a,
            source_b,
            query_timeout,
            over_fetch_margin,
        }
    }

    pub fn client(&self, source: SourceTag) -> &Arc<dyn SourceClient> {
        match source {
            SourceTag::A => &self.source_a,
            SourceTag::B => &self.source_b,
        }
    }

    pub async fn ping(&self, source: SourceTag) -> bool {
        matches!(
            tokio::time::timeout(self.query_timeout, self.client(source).ping()).await,
            Ok(Ok(()))
        )
    }

    pub async fn call(
        &self,
        source: SourceTag,
        procedure: &'static str,
        params: ProcedureParams,
    ) -> Result<Vec<ResultSet>, SourceFailure> {
        let result = tokio::time::timeout(
            self.query_timeout,
            self.client(source).execute(procedure, &params),
        )
        .await;

        let (outcome, failure) = match result {
            Ok(Ok(sets)) => {
                metrics::observe_source_query(source.as_str(), procedure, "ok");
                return Ok(sets);
            }
            Ok(Err(err)) => {
                let timed_out = err.is_timeout();
                (
                    if timed_out { "timeout" } else { "error" },
                    SourceFailure {
                        source,
                        procedure,
                        timed_out,
                        message: err.to_string(),
                    },
                )
            }
            Err(_) => (
                "timeout",
                SourceFailure {
                    source,
                    procedure,
                    timed_out: true,
                    message: format!(
                        "no response within {}ms",
                        self.query_timeout.as_millis()
                    ),
                },
            ),
        };

        metrics::observe_source_query(source.as_str(), procedure, outcome);
        tracing::warn!(
            source = source.as_str(),
            procedure,
            outcome,
            reason = %failure.message,
            "gateway.source_query_failed"
        );
        Err(failure)
    }

    fn row_limit(&self, limit: usize) -> i64 {
        i64::try_from(limit.saturating_add(self.over_fetch_margin)).unwrap_or(i64::MAX)
    }

    /// One source's leg of a list view.
    pub async fn list(
        &self,
        source: SourceTag,
        scope: &LedgerScope,
        query: &ListQuery,
    ) -> SourceOutcome<Vec<Row>> {
        let procedure = query.view.procedure();
        let ledgers = scope.for_source(source);
        if ledgers.is_empty() {
            metrics::observe_source_query(source.as_str(), procedure, "skipped");
            return SourceOutcome::skipped(source);
        }

        let bound = query.cursor.as_ref().map(|c| source_bound(c, source));
        let params = ProcedureParams::new()
            .ledger_ids(ledgers)
            .timestamp("from_date", query.window.from)
            .timestamp("to_date", query.window.to)
            .opt_text("status_filter", query.status)
            .opt_text("search_text", query.search.as_deref())
            .opt_timestamp("after_sort_key", bound.map(|b| b.sort_key))
            .opt_int("after_tie_break_id", bound.map(|b| b.tie_break_id))
            .int("row_limit", self.row_limit(query.limit));

        let records = match self.call(source, procedure, params).await {
            Ok(sets) => first_set(sets),
            Err(failure) => return SourceOutcome::failed(failure),
        };

        let mut rows = prepare_rows(source, procedure, records, RowKeys::LIST);
        if let Some(range) = query.window.civil {
            let removed = retain_civil_range(&mut rows, &range, query.view.civil_date_field());
            metrics::add_rows_dropped(procedure, "outside_civil_range", removed);
        }
        SourceOutcome::ok(source, rows)
    }

    pub async fn list_all(
        &self,
        sources: &[SourceTag],
        scope: &LedgerScope,
        query: &ListQuery,
    ) -> Vec<SourceOutcome<Vec<Row>>> {
        fan_out(sources, |source| self.list(source, scope, query)).await
    }

    /// One source's dashboard result sets. The dashboard procedure takes
    /// ledger ids only.
    pub async fn dashboard(&self, source: SourceTag, scope: &LedgerScope) -> SourceOutcome<DashboardSets> {
        let ledgers = scope.for_source(source);
        if ledgers.is_empty() {
            metrics::observe_source_query(source.as_str(), DASHBOARD_PROCEDURE, "skipped");
            return SourceOutcome::skipped(source);
        }

        let params = ProcedureParams::new().ledger_ids(ledgers);
        match self.call(source, DASHBOARD_PROCEDURE, params).await {
            Ok(sets) => SourceOutcome::ok(source, DashboardSets::from_result_sets(sets)),
            Err(failure) => SourceOutcome::failed(failure),
        }
    }

    pub async fn dashboard_all(
        &self,
        sources: &[SourceTag],
        scope: &LedgerScope,
    ) -> Vec<SourceOutcome<DashboardSets>> {
        fan_out(sources, |source| self.dashboard(source, scope)).await
    }

    pub async fn order_processes(
        &self,
        source: SourceTag,
        scope: &LedgerScope,
        job_id: i64,
    ) -> SourceOutcome<Vec<Payload>> {
        let ledgers = scope.for_source(source);
        if ledgers.is_empty() {
            metrics::observe_source_query(source.as_str(), PROCESSES_PROCEDURE, "skipped");
            return SourceOutcome::skipped(source);
        }

        let params = ProcedureParams::new()
            .int("job_booking_id", job_id)
            .ledger_ids(ledgers);
        match self.call(source, PROCESSES_PROCEDURE, params).await {
            Ok(sets) => SourceOutcome::ok(source, first_set(sets)),
            Err(failure) => SourceOutcome::failed(failure),
        }
    }

    pub async fn order_processes_all(
        &self,
        sources: &[SourceTag],
        scope: &LedgerScope,
        job_id: i64,
    ) -> Vec<SourceOutcome<Vec<Payload>>> {
        fan_out(sources, |source| self.order_processes(source, scope, job_id)).await
    }

    pub async fn order_deliveries(
        &self,
        source: SourceTag,
        scope: &LedgerScope,
        query: &DeliveryQuery,
    ) -> SourceOutcome<Vec<Row>> {
        let ledgers = scope.for_source(source);
        if ledgers.is_empty() {
            metrics::observe_source_query(source.as_str(), DELIVERIES_PROCEDURE, "skipped");
            return SourceOutcome::skipped(source);
        }

        let bound = query.cursor.as_ref().map(|c| source_bound(c, source));
        let params = ProcedureParams::new()
            .int("job_booking_id", query.job_id)
            .ledger_ids(ledgers)
            .opt_timestamp("after_ts", bound.map(|b| b.sort_key))
            .opt_int("after_id", bound.map(|b| b.tie_break_id))
            .int("row_limit", self.row_limit(query.limit));

        match self.call(source, DELIVERIES_PROCEDURE, params).await {
            Ok(sets) => SourceOutcome::ok(
                source,
                prepare_rows(source, DELIVERIES_PROCEDURE, first_set(sets), DELIVERY_KEYS),
            ),
            Err(failure) => SourceOutcome::failed(failure),
        }
    }

    pub async fn order_deliveries_all(
        &self,
        sources: &[SourceTag],
        scope: &LedgerScope,
        query: &DeliveryQuery,
    ) -> Vec<SourceOutcome<Vec<Row>>> {
        fan_out(sources, |source| self.order_deliveries(source, scope, query)).await
    }

    /// Looks up the ledgers a customer email and key unlock on one source.
    pub async fn validate_email_key(
        &self,
        source: SourceTag,
        email: &str,
        customer_key: Option<&str>,
    ) -> Result<Vec<Payload>, SourceFailure> {
        let params = ProcedureParams::new()
            .text("email", email)
            .opt_text("customer_key", customer_key);
        self.call(source, VALIDATE_PROCEDURE, params)
            .await
            .map(first_set)
    }
}

/// Runs one leg per requested source; two legs run concurrently.
async fn fan_out<T, F, Fut>(sources: &[SourceTag], leg: F) -> Vec<SourceOutcome<T>>
where
    F: Fn(SourceTag) -> Fut,
    Fut: Future<Output = SourceOutcome<T>>,
{
    match sources {
        [] => Vec::new(),
        [only] => vec![leg(*only).await],
        [first, second, ..] => {
            let (first, second) = tokio::join!(leg(*first), leg(*second));
            vec![first, second]
        }
    }
}

fn first_set(sets: Vec<ResultSet>) -> ResultSet {
    sets.into_iter().next().unwrap_or_default()
}

fn prepare_rows(source: SourceTag, procedure: &'static str, records: ResultSet, keys: RowKeys) -> Vec<Row> {
    let mapped = map_rows(records, keys, source);
    if mapped.dropped > 0 {
        tracing::debug!(
            source = source.as_str(),
            procedure,
            dropped = mapped.dropped,
            "gateway.rows_missing_key"
        );
        metrics::add_rows_dropped(procedure, "missing_key", mapped.dropped);
    }

    let mut rows = mapped.rows;
    if enforce_descending(&mut rows) {
        tracing::warn!(
            source = source.as_str(),
            procedure,
            rows = rows.len(),
            "gateway.source_order_violation"
        );
    }
    rows
}

/// Trims free-text search and caps it to what upstream accepts.
pub fn normalize_search(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_SEARCH_CHARS).collect())
}
