//! Tool-facing logic on top of the database layer.
//!
//! - `guard`: lexical statement checks (destructive statements, read-only mode, identifiers)
//! - `redact`: secret masking for descriptors, messages and logged arguments
//! - `schema_diff`: schema comparison and migration scripts
//! - `explain`: dialect EXPLAIN statements and plan normalization
//! - `dispatch`: JSON tool calls routed to the gateway

pub mod dispatch;
pub mod explain;
pub mod guard;
pub mod redact;
pub mod schema_diff;

pub use dispatch::{ToolCall, ToolDispatcher, ToolResponse};
pub use explain::{build_explain_query, parse_explain_output};
pub use guard::{
    detect_transaction_control, enforce_read_only, enforce_read_only_for, sanitize_identifier,
    split_statements, validate_query, validate_query_for,
};
pub use redact::{redact_connection_string, redact_value};
pub use schema_diff::{compare_schemas, generate_migration_script, normalize_type};
