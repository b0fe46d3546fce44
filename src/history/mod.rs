//! Device history: stored location samples joined with the cells seen at
//! the same instant.

mod merge;
mod query;

pub use merge::merge_history;
pub use query::{load_history, HistoryQueryError, HistoryReport, HistoryWindow, Period};
