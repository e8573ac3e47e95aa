use std::cmp::Ordering;

use cdc_contracts::{Cursor, Payload, Row, RowKey, SourceTag};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedPage {
    pub items: Vec<Payload>,
    /// Last emitted row, present only when rows remain past it.
    pub next_cursor: Option<Cursor>,
    pub from_a: usize,
    pub from_b: usize,
}

/// How a stream treats consecutive rows carrying the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeats {
    /// Keys are unique row identities; a repeat is an over-fetch duplicate.
    Collapse,
    /// Keys only order the rows; every row is emitted.
    Keep,
}

/// Global order: sort key desc, tie-break desc, then source A before B.
///
/// Tie-break ids are unique only within a source, so an exact key twin in
/// both sources is two rows. A is emitted first and the page cursor records
/// the emitting source, which lets the next page still serve B's twin.
pub fn merge_order(a: &Row, b: &Row) -> Ordering {
    b.key()
        .cmp(&a.key())
        .then_with(|| a.source.cmp(&b.source))
}

/// Exclusive upper bound on `source`'s keys for the page after `cursor`.
///
/// When the cursor row came from A, B's row with the identical key comes
/// later in merged order and must stay in range, so B's bound moves one
/// tie-break id up. Cursors without a source exclude the key on both sides.
pub fn source_bound(cursor: &Cursor, source: SourceTag) -> RowKey {
    let key = cursor.key();
    let keeps_twin = cursor.source.is_some_and(|emitted| source > emitted);
    match key.tie_break_id.checked_add(1) {
        Some(next_id) if keeps_twin => RowKey {
            tie_break_id: next_id,
            ..key
        },
        _ => key,
    }
}

/// Restores descending key order if a source broke it. Returns whether the
/// rows had to be re-sorted.
pub fn enforce_descending(rows: &mut [Row]) -> bool {
    if rows.is_sorted_by(|a, b| a.key() >= b.key()) {
        return false;
    }
    rows.sort_by(|a, b| b.key().cmp(&a.key()));
    true
}

struct Stream {
    rows: std::iter::Peekable<std::vec::IntoIter<Row>>,
    bound: Option<RowKey>,
    repeats: Repeats,
    last: Option<RowKey>,
}

impl Stream {
    fn new(rows: Vec<Row>, source: SourceTag, cursor: Option<&Cursor>, repeats: Repeats) -> Self {
        Self {
            rows: rows.into_iter().peekable(),
            bound: cursor.map(|c| source_bound(c, source)),
            repeats,
            last: None,
        }
    }

    /// Head of the stream, skipping rows at or past the bound and, when
    /// collapsing, repeats of the row just taken.
    fn peek(&mut self) -> Option<&Row> {
        while let Some(row) = self.rows.peek() {
            let key = row.key();
            let before_bound = self.bound.is_some_and(|bound| key >= bound);
            let repeat = self.repeats == Repeats::Collapse && self.last == Some(key);
            if !before_bound && !repeat {
                break;
            }
            self.rows.next();
        }
        self.rows.peek()
    }

    fn pop(&mut self) -> Option<Row> {
        self.peek()?;
        let row = self.rows.next()?;
        self.last = Some(row.key());
        Some(row)
    }
}

/// Two-way merge of per-source streams already sorted descending by
/// `(sort_key, tie_break_id)`, collapsing over-fetch duplicates.
///
/// Rows at or before `cursor` in merged order are excluded. Consumption
/// stops once `limit` rows are emitted; a next cursor is produced only if
/// either stream still holds rows past the last emitted one.
pub fn merge(rows_a: Vec<Row>, rows_b: Vec<Row>, limit: usize, cursor: Option<&Cursor>) -> MergedPage {
    merge_with(rows_a, rows_b, limit, cursor, Repeats::Collapse)
}

pub fn merge_with(
    rows_a: Vec<Row>,
    rows_b: Vec<Row>,
    limit: usize,
    cursor: Option<&Cursor>,
    repeats: Repeats,
) -> MergedPage {
    let capacity = limit.min(rows_a.len() + rows_b.len());
    let mut left = Stream::new(rows_a, SourceTag::A, cursor, repeats);
    let mut right = Stream::new(rows_b, SourceTag::B, cursor, repeats);

    let mut page = MergedPage {
        items: Vec::with_capacity(capacity),
        ..MergedPage::default()
    };
    let mut last_emitted = None;

    while page.items.len() < limit {
        let take_left = match (left.peek(), right.peek()) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(l), Some(r)) => merge_order(l, r) != Ordering::Greater,
        };

        let next = if take_left { left.pop() } else { right.pop() };
        let Some(row) = next else {
            break;
        };

        match row.source {
            SourceTag::A => page.from_a += 1,
            SourceTag::B => page.from_b += 1,
        }
        last_emitted = Some(row.cursor());
        page.items.push(row.payload);
    }

    let has_more = left.peek().is_some() || right.peek().is_some();
    page.next_cursor = if has_more { last_emitted } else { None };
    page
}

/// Single-source paging, used when a request pins one upstream.
pub fn take_page(rows: Vec<Row>, limit: usize, cursor: Option<&Cursor>) -> MergedPage {
    take_page_with(rows, limit, cursor, Repeats::Collapse)
}

pub fn take_page_with(
    rows: Vec<Row>,
    limit: usize,
    cursor: Option<&Cursor>,
    repeats: Repeats,
) -> MergedPage {
    let source = rows.first().map(|r| r.source).unwrap_or(SourceTag::A);
    match source {
        SourceTag::A => merge_with(rows, Vec::new(), limit, cursor, repeats),
        SourceTag::B => merge_with(Vec::new(), rows, limit, cursor, repeats),
    }
}
