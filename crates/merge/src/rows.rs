use cdc_contracts::{Payload, Row, SourceTag};
use chrono::{DateTime, Utc};

use crate::merger::Repeats;
use crate::window::parse_instant;

/// Sort key given to display rows without a readable date; they order after
/// every dated row.
pub const UNDATED_SORT_KEY: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

/// Which payload fields carry a procedure's merge key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowKeys {
    pub sort_key: &'static str,
    pub tie_break: Option<&'static str>,
    /// Internal keys are bookkeeping columns: they are required, unique per
    /// source, and stripped from the payload. Display keys stay in the
    /// payload, may repeat, and a missing value never drops the row.
    pub internal: bool,
}

impl RowKeys {
    pub const LIST: RowKeys = RowKeys {
        sort_key: "_cursorDate",
        tie_break: Some("_cursorId"),
        internal: true,
    };

    pub const fn display(sort_key: &'static str, tie_break: Option<&'static str>) -> Self {
        Self {
            sort_key,
            tie_break,
            internal: false,
        }
    }

    pub fn repeats(self) -> Repeats {
        if self.internal {
            Repeats::Collapse
        } else {
            Repeats::Keep
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedRows {
    pub rows: Vec<Row>,
    pub dropped: usize,
}

/// Validates loosely-typed source records into `Row`s stamped with their
/// source. Records without usable internal keys are dropped and counted;
/// display rows without a date sort last.
pub fn map_rows(records: Vec<Payload>, keys: RowKeys, source: SourceTag) -> MappedRows {
    let mut out = MappedRows {
        rows: Vec::with_capacity(records.len()),
        dropped: 0,
    };

    for mut payload in records {
        let sort_key = match payload.get(keys.sort_key).and_then(parse_instant) {
            Some(sort_key) => sort_key,
            None if keys.internal => {
                out.dropped += 1;
                continue;
            }
            None => UNDATED_SORT_KEY,
        };

        let tie_break_id = match keys.tie_break {
            Some(field) => match payload.get(field).and_then(parse_i64) {
                Some(id) => id,
                None if keys.internal => {
                    out.dropped += 1;
                    continue;
                }
                None => 0,
            },
            None => 0,
        };

        if keys.internal {
            payload.remove(keys.sort_key);
            if let Some(field) = keys.tie_break {
                payload.remove(field);
            }
        }

        out.rows.push(Row {
            sort_key,
            tie_break_id,
            source,
            payload,
        });
    }

    out
}

pub fn parse_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Reads a numeric aggregate. Missing, null or unparseable values count as
/// zero.
pub fn number_field(payload: &Payload, field: &str) -> f64 {
    let value = match payload.get(field) {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}
