use cdc_contracts::{Payload, SourceTag};
use serde::Serialize;

use crate::merger::{enforce_descending, merge_with};
use crate::reduce::{Accumulate, percent_change, reduce};
use crate::rows::{RowKeys, map_rows, number_field, parse_i64};
use crate::window::parse_instant;

pub const RECENT_ORDERS_LIMIT: usize = 5;

const RECENT_ORDER_KEYS: RowKeys = RowKeys::display("OrderDate", Some("OrderBookingID"));
const PENDING_KEYS: RowKeys = RowKeys::display("PODate", Some("PurchaseOrderID"));

/// The six result sets `portal_dashboard` returns for one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardSets {
    pub kpis: Vec<Payload>,
    pub monthly_orders: Vec<Payload>,
    pub recent_orders: Vec<Payload>,
    pub otif: Vec<Payload>,
    pub pending_approvals: Vec<Payload>,
    pub pending_files: Vec<Payload>,
}

impl DashboardSets {
    /// Missing trailing result sets read as empty.
    pub fn from_result_sets(sets: Vec<Vec<Payload>>) -> Self {
        let mut sets = sets.into_iter();
        let mut next = || sets.next().unwrap_or_default();
        Self {
            kpis: next(),
            monthly_orders: next(),
            recent_orders: next(),
            otif: next(),
            pending_approvals: next(),
            pending_files: next(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KpiSummary {
    pub range_days: i64,
    pub range_label: Option<String>,
    pub curr_order_qty: f64,
    pub curr_order_value: f64,
    pub prev_order_qty: f64,
    pub prev_order_value: f64,
    pub order_value_change_pct: Option<f64>,
    pub order_qty_change_pct: Option<f64>,
}

impl KpiSummary {
    fn from_payload(payload: &Payload) -> Option<Self> {
        let range_days = payload.get("RangeDays").and_then(parse_i64)?;
        Some(Self {
            range_days,
            range_label: payload
                .get("RangeLabel")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            curr_order_qty: number_field(payload, "CurrOrderQty"),
            curr_order_value: number_field(payload, "CurrOrderValue"),
            prev_order_qty: number_field(payload, "PrevOrderQty"),
            prev_order_value: number_field(payload, "PrevOrderValue"),
            order_value_change_pct: None,
            order_qty_change_pct: None,
        })
    }

    fn with_changes(mut self) -> Self {
        self.order_value_change_pct = percent_change(self.curr_order_value, self.prev_order_value);
        self.order_qty_change_pct = percent_change(self.curr_order_qty, self.prev_order_qty);
        self
    }
}

impl Accumulate for KpiSummary {
    fn accumulate(&mut self, other: &Self) {
        self.curr_order_qty += other.curr_order_qty;
        self.curr_order_value += other.curr_order_value;
        self.prev_order_qty += other.prev_order_qty;
        self.prev_order_value += other.prev_order_value;
        if self.range_label.is_none() {
            self.range_label.clone_from(&other.range_label);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonthlyOrders {
    pub year_month: String,
    pub month_start: Option<serde_json::Value>,
    pub total_qty: f64,
    pub total_value: f64,
}

impl MonthlyOrders {
    fn from_payload(payload: &Payload) -> Option<Self> {
        let year_month = payload
            .get("YearMonth")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())?
            .to_string();
        Some(Self {
            year_month,
            month_start: payload.get("MonthStart").cloned().filter(|v| !v.is_null()),
            total_qty: number_field(payload, "TotalQty"),
            total_value: number_field(payload, "TotalValue"),
        })
    }
}

impl Accumulate for MonthlyOrders {
    fn accumulate(&mut self, other: &Self) {
        self.total_qty += other.total_qty;
        self.total_value += other.total_value;
        if self.month_start.is_none() {
            self.month_start.clone_from(&other.month_start);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtifSummary {
    pub planned_deliveries: f64,
    pub completed_on_time: f64,
    pub completed_with_delay: f64,
    pub yet_undelivered: f64,
}

impl OtifSummary {
    fn from_payload(payload: &Payload) -> Self {
        Self {
            planned_deliveries: number_field(payload, "PlannedDeliveries"),
            completed_on_time: number_field(payload, "CompletedOnTime"),
            completed_with_delay: number_field(payload, "CompletedWithDelay"),
            yet_undelivered: number_field(payload, "YetUndelivered"),
        }
    }
}

impl Accumulate for OtifSummary {
    fn accumulate(&mut self, other: &Self) {
        self.planned_deliveries += other.planned_deliveries;
        self.completed_on_time += other.completed_on_time;
        self.completed_with_delay += other.completed_with_delay;
        self.yet_undelivered += other.yet_undelivered;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub kpis: Vec<KpiSummary>,
    pub monthly_orders: Vec<MonthlyOrders>,
    pub recent_orders: Vec<Payload>,
    pub otif_summary: OtifSummary,
    pub pending_approvals: Vec<Payload>,
    pub pending_files: Vec<Payload>,
}

pub fn merge_dashboard(a: DashboardSets, b: DashboardSets) -> Dashboard {
    let kpis = reduce(
        a.kpis.iter().filter_map(KpiSummary::from_payload).collect(),
        b.kpis.iter().filter_map(KpiSummary::from_payload).collect(),
        |k: &KpiSummary| Some(k.range_days),
    )
    .into_values()
    .map(KpiSummary::with_changes)
    .collect();

    let mut monthly_orders = reduce(
        a.monthly_orders
            .iter()
            .filter_map(MonthlyOrders::from_payload)
            .collect(),
        b.monthly_orders
            .iter()
            .filter_map(MonthlyOrders::from_payload)
            .collect(),
        |m: &MonthlyOrders| Some(m.year_month.clone()),
    )
    .into_values()
    .collect::<Vec<_>>();
    monthly_orders.sort_by(|x, y| {
        let start = |m: &MonthlyOrders| m.month_start.as_ref().and_then(parse_instant);
        start(x)
            .cmp(&start(y))
            .then_with(|| x.year_month.cmp(&y.year_month))
    });

    let otif_summary = reduce(
        vec![otif_of(&a.otif)],
        vec![otif_of(&b.otif)],
        |_: &OtifSummary| Some(()),
    )
    .into_values()
    .next()
    .unwrap_or_default();

    // Display keys never drop a row: undated rows sort last and rows that
    // share a key (one per PO line item) are all kept.
    let merge_list = |left: Vec<Payload>, right: Vec<Payload>, keys: RowKeys, limit: usize| {
        let mut left = map_rows(left, keys, SourceTag::A).rows;
        let mut right = map_rows(right, keys, SourceTag::B).rows;
        enforce_descending(&mut left);
        enforce_descending(&mut right);
        merge_with(left, right, limit, None, keys.repeats()).items
    };

    let recent_orders = merge_list(
        a.recent_orders,
        b.recent_orders,
        RECENT_ORDER_KEYS,
        RECENT_ORDERS_LIMIT,
    );
    let pending_approvals = merge_list(
        a.pending_approvals,
        b.pending_approvals,
        PENDING_KEYS,
        usize::MAX,
    );
    let pending_files = merge_list(a.pending_files, b.pending_files, PENDING_KEYS, usize::MAX);

    Dashboard {
        kpis,
        monthly_orders,
        recent_orders,
        otif_summary,
        pending_approvals,
        pending_files,
    }
}

fn otif_of(rows: &[Payload]) -> OtifSummary {
    rows.first().map(OtifSummary::from_payload).unwrap_or_default()
}
