pub mod cursor;
pub mod dashboard;
pub mod merger;
pub mod reduce;
pub mod rows;
pub mod window;

pub use merger::{
    MergedPage, Repeats, enforce_descending, merge, merge_with, source_bound, take_page, take_page_with,
};
pub use reduce::{Accumulate, percent_change, reduce};
pub use rows::{MappedRows, RowKeys, UNDATED_SORT_KEY, map_rows};
pub use window::{NormalizedWindow, WindowFallback, WindowKind, normalize};
