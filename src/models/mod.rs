//! Data models for the database gateway.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod plan;
pub mod query;
pub mod schema;

pub use connection::ConnectionDescriptor;
pub use plan::{ExplainFormat, QueryPlanNode};
pub use query::{DEFAULT_MAX_ROWS, DEFAULT_QUERY_TIMEOUT_MS, QueryResult};
pub use schema::{
    ColumnDiff, ColumnSchema, DiffStatus, DiffSummary, IndexDiff, IndexSchema, SchemaDiff,
    TableDiff, TableSchema,
};
