//! Query-related data models.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default row cap injected into unbounded SELECT statements.
pub const DEFAULT_MAX_ROWS: u32 = 1000;

/// Default per-call timeout for backend operations in milliseconds.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;

/// Uniform result of a statement, regardless of backend.
///
/// Each row is aligned with `columns`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    /// Affected-row count reported by DML statements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// True when rows past an injected row limit were dropped.
    #[serde(default)]
    pub truncated: bool,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<JsonValue>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            ..Default::default()
        }
    }

    /// Keep at most `limit` rows, marking the result truncated if any were dropped.
    pub fn cap_rows(&mut self, limit: usize) {
        self.truncated = self.rows.len() > limit;
        if self.truncated {
            self.rows.truncate(limit);
            self.row_count = self.rows.len();
        }
    }

    /// Index of a column by case-insensitive name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value at `row` for the named column.
    pub fn value(&self, row: usize, column: &str) -> Option<&JsonValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Rows as column-name keyed JSON objects.
    pub fn rows_as_objects(&self) -> Vec<serde_json::Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}
