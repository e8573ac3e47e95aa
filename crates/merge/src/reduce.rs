use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Summary values that combine across sources by addition.
pub trait Accumulate {
    fn accumulate(&mut self, other: &Self);
}

/// Folds both sources' summary rows into one accumulator per group key.
/// Rows for which `group_key` yields `None` are ignored.
pub fn reduce<K, T, F>(rows_a: Vec<T>, rows_b: Vec<T>, group_key: F) -> BTreeMap<K, T>
where
    K: Ord,
    T: Accumulate,
    F: Fn(&T) -> Option<K>,
{
    let mut out: BTreeMap<K, T> = BTreeMap::new();
    for row in rows_a.into_iter().chain(rows_b) {
        let Some(key) = group_key(&row) else {
            continue;
        };
        match out.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().accumulate(&row),
            Entry::Vacant(entry) => {
                entry.insert(row);
            }
        }
    }
    out
}

/// Percentage change from `previous` to `current`; undefined when there is
/// no previous total.
pub fn percent_change(current: f64, previous: f64) -> Option<f64> {
    if previous == 0.0 || !previous.is_finite() || !current.is_finite() {
        return None;
    }
    Some((current - previous) * 100.0 / previous)
}
