use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cdc_contracts::{Payload, SourceTag};
use cdc_merge::rows::parse_i64;
use cdc_merge::window::parse_instant;

use super::{ParamValue, ProcedureParams, ResultSet, SourceClient, SourceError, is_allowlisted_procedure};

/// Canned source used by tests and local smoke runs. Keyed procedures honor
/// the keyset arguments, ledger filtering and `row_limit` the way upstream
/// procedures do.
#[derive(Clone)]
pub struct MemorySource {
    tag: SourceTag,
    procedures: Arc<Mutex<HashMap<String, Vec<ResultSet>>>>,
    calls: Arc<Mutex<Vec<(String, ProcedureParams)>>>,
    failing: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MemorySource {
    pub fn new(tag: SourceTag) -> Self {
        Self {
            tag,
            procedures: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
            delay: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_result_sets(self, procedure: &str, sets: Vec<ResultSet>) -> Self {
        lock(&self.procedures).insert(procedure.to_string(), sets);
        self
    }

    pub fn with_rows(self, procedure: &str, rows: ResultSet) -> Self {
        self.with_result_sets(procedure, vec![rows])
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn calls(&self) -> Vec<(String, ProcedureParams)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Keyset {
    sort_field: &'static str,
    id_field: &'static str,
    after_sort_param: &'static str,
    after_id_param: &'static str,
}

fn keyset(procedure: &str) -> Option<Keyset> {
    match procedure {
        "portal_orders_list" | "portal_dispatches_list" | "portal_approvals_list"
        | "portal_otif_list" => Some(Keyset {
            sort_field: "_cursorDate",
            id_field: "_cursorId",
            after_sort_param: "after_sort_key",
            after_id_param: "after_tie_break_id",
        }),
        "portal_order_deliveries" => Some(Keyset {
            sort_field: "DeliveryTs",
            id_field: "DeliveryId",
            after_sort_param: "after_ts",
            after_id_param: "after_id",
        }),
        _ => None,
    }
}

fn in_ledgers(row: &Payload, params: &ProcedureParams) -> bool {
    let Some(ParamValue::IntArray(ids)) = params.get("ledger_ids") else {
        return true;
    };
    match row.get("LedgerID").and_then(parse_i64) {
        Some(id) => ids.iter().any(|l| i64::from(*l) == id),
        None => true,
    }
}

fn apply_keyset(rows: ResultSet, keys: &Keyset, params: &ProcedureParams) -> ResultSet {
    let after_sort = match params.get(keys.after_sort_param) {
        Some(ParamValue::Timestamp(ts)) => Some(*ts),
        _ => None,
    };
    let after_id = match params.get(keys.after_id_param) {
        Some(ParamValue::Int(id)) => *id,
        _ => i64::MAX,
    };
    let row_limit = match params.get("row_limit") {
        Some(ParamValue::Int(limit)) => usize::try_from(*limit).unwrap_or(0),
        _ => usize::MAX,
    };

    let mut keyed = rows
        .into_iter()
        .filter(|row| in_ledgers(row, params))
        .map(|row| {
            let sort = row.get(keys.sort_field).and_then(parse_instant);
            let id = row.get(keys.id_field).and_then(parse_i64).unwrap_or(0);
            (sort, id, row)
        })
        .filter(|(sort, id, _)| match (after_sort, sort) {
            (Some(after), Some(sort)) => (*sort, *id) < (after, after_id),
            _ => true,
        })
        .collect::<Vec<_>>();
    keyed.sort_by(|l, r| (r.0, r.1).cmp(&(l.0, l.1)));
    keyed.into_iter().take(row_limit).map(|(_, _, row)| row).collect()
}

#[async_trait]
impl SourceClient for MemorySource {
    fn tag(&self) -> SourceTag {
        self.tag
    }

    async fn execute(
        &self,
        procedure: &str,
        params: &ProcedureParams,
    ) -> Result<Vec<ResultSet>, SourceError> {
        lock(&self.calls).push((procedure.to_string(), params.clone()));

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Protocol(format!(
                "source {} unavailable",
                self.tag
            )));
        }
        if !is_allowlisted_procedure(procedure) {
            return Err(SourceError::NotAllowlisted(procedure.to_string()));
        }

        let mut sets = lock(&self.procedures)
            .get(procedure)
            .cloned()
            .unwrap_or_default();
        if let Some(keys) = keyset(procedure)
            && let Some(first) = sets.first_mut()
        {
            *first = apply_keyset(std::mem::take(first), &keys, params);
        }
        Ok(sets)
    }

    async fn ping(&self) -> Result<(), SourceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Protocol(format!(
                "source {} unavailable",
                self.tag
            )));
        }
        Ok(())
    }
}
