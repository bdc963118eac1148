//! Normalized query plan tree.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Requested EXPLAIN output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainFormat {
    #[default]
    Json,
    Text,
}

/// One node of a plan, shared by every dialect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlanNode {
    pub operation: String,
    /// Relation, index or object the node works on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_rows: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_width: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_rows: Option<f64>,
    /// Backend-specific attributes that have no normalized field.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub details: JsonValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<QueryPlanNode>,
}

impl QueryPlanNode {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// Total number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Self::node_count).sum::<usize>()
    }
}
