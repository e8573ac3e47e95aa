use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    A,
    B,
}

impl SourceTag {
    pub const ALL: [SourceTag; 2] = [SourceTag::A, SourceTag::B];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::A => "a",
            SourceTag::B => "b",
        }
    }

    /// Accepts `a`/`b` and the legacy `db1`/`db2` spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "a" | "db1" => Some(SourceTag::A),
            "b" | "db2" => Some(SourceTag::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merge key of a row.
///
/// Field order matters: the derived `Ord` compares `sort_key` first and
/// `tie_break_id` second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub sort_key: DateTime<Utc>,
    pub tie_break_id: i64,
}

/// Position of the last row a client has seen in the merged stream: its key
/// and, when known, the source that emitted it. Tie-break ids are unique
/// only within a source, so the source decides whether the other source's
/// row with the same key was already served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub sort_key: DateTime<Utc>,
    pub tie_break_id: i64,
    pub source: Option<SourceTag>,
}

impl Cursor {
    pub fn key(&self) -> RowKey {
        RowKey {
            sort_key: self.sort_key,
            tie_break_id: self.tie_break_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub sort_key: DateTime<Utc>,
    pub tie_break_id: i64,
    pub source: SourceTag,
    pub payload: Payload,
}

impl Row {
    pub fn key(&self) -> RowKey {
        RowKey {
            sort_key: self.sort_key,
            tie_break_id: self.tie_break_id,
        }
    }

    /// Cursor pointing at this row.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            sort_key: self.sort_key,
            tie_break_id: self.tie_break_id,
            source: Some(self.source),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl CivilRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Set when the window came from explicit civil dates; rows are then
    /// post-filtered by business date.
    pub civil: Option<CivilRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerScope {
    pub source_a: BTreeSet<i32>,
    pub source_b: BTreeSet<i32>,
}

impl LedgerScope {
    pub fn for_source(&self, source: SourceTag) -> &BTreeSet<i32> {
        match source {
            SourceTag::A => &self.source_a,
            SourceTag::B => &self.source_b,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_a.is_empty() && self.source_b.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListView {
    Orders,
    Dispatches,
    Approvals,
    Otif,
}

impl ListView {
    pub fn as_str(self) -> &'static str {
        match self {
            ListView::Orders => "orders",
            ListView::Dispatches => "dispatches",
            ListView::Approvals => "approvals",
            ListView::Otif => "otif",
        }
    }

    pub fn procedure(self) -> &'static str {
        match self {
            ListView::Orders => "portal_orders_list",
            ListView::Dispatches => "portal_dispatches_list",
            ListView::Approvals => "portal_approvals_list",
            ListView::Otif => "portal_otif_list",
        }
    }

    pub fn default_limit(self) -> usize {
        match self {
            ListView::Orders | ListView::Approvals => 25,
            ListView::Dispatches | ListView::Otif => 50,
        }
    }

    /// Payload field holding the business date used by the civil-date
    /// post-filter.
    pub fn civil_date_field(self) -> &'static str {
        match self {
            ListView::Orders => "OrderDate",
            ListView::Dispatches => "DispatchDate",
            ListView::Approvals | ListView::Otif => "PODate",
        }
    }

    /// Normalizes a `tab` value into the status filter sent upstream.
    /// Views without a status parameter return `None`.
    pub fn status_filter(self, tab: Option<&str>) -> Option<&'static str> {
        let tab = tab
            .map(|t| t.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match self {
            ListView::Orders => Some(match tab.as_str() {
                "pending" => "pending",
                "completed" => "completed",
                _ => "all",
            }),
            ListView::Approvals => Some(match tab.as_str() {
                "pending_approval" => "pending_approval",
                "pending_files" => "pending_files",
                _ => "all",
            }),
            ListView::Dispatches | ListView::Otif => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<Payload>,
    pub next_cursor: Option<String>,
}
