//! Query execution plans.
//!
//! Builds the dialect's EXPLAIN statement and parses whatever comes back into
//! one [`QueryPlanNode`] tree shape:
//!
//! - Postgres `FORMAT JSON` and MySQL `FORMAT=JSON` plans are walked recursively
//! - SQLite `EXPLAIN QUERY PLAN` rows are linked by their `id`/`parent` columns
//! - SQL Server showplan XML is walked by its `RelOp` elements
//! - Text output becomes one node per line, with `(cost=..)` and
//!   `(actual time=..)` annotations lifted into the numeric fields
//!
//! Unparseable output never fails: it degrades to one flat node per row.

use crate::db::dialect::{Dialect, NATIVE_DRIVERS};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{ExplainFormat, QueryPlanNode, QueryResult};
use crate::tools::guard::split_statements;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::sync::LazyLock;

/// Build the EXPLAIN statement for `sql`.
///
/// `sql` must hold exactly one statement; a trailing `;` is dropped.
pub fn build_explain_query(
    dialect: &Dialect,
    sql: &str,
    analyze: bool,
    format: ExplainFormat,
) -> GatewayResult<String> {
    let statements = split_statements(dialect, sql).map_err(|e| {
        GatewayError::validation(format!("Statement could not be tokenized: {e}"))
    })?;
    match statements.len() {
        0 => return Err(GatewayError::validation("SQL statement is required")),
        1 => {}
        n => {
            return Err(GatewayError::validation(format!(
                "EXPLAIN takes a single statement, got {n}"
            )));
        }
    }
    let sql = sql
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    let statement = match (dialect, format, analyze) {
        (Dialect::Postgres, ExplainFormat::Json, true) => {
            format!("EXPLAIN (ANALYZE, FORMAT JSON) {sql}")
        }
        (Dialect::Postgres, ExplainFormat::Json, false) => format!("EXPLAIN (FORMAT JSON) {sql}"),
        (Dialect::Postgres, ExplainFormat::Text, true) => format!("EXPLAIN ANALYZE {sql}"),
        (Dialect::Postgres, ExplainFormat::Text, false) => format!("EXPLAIN {sql}"),
        // EXPLAIN ANALYZE only has a tree output in MySQL
        (Dialect::MySql, _, true) => format!("EXPLAIN ANALYZE {sql}"),
        (Dialect::MySql, ExplainFormat::Json, false) => format!("EXPLAIN FORMAT=JSON {sql}"),
        (Dialect::MySql, ExplainFormat::Text, false) => format!("EXPLAIN {sql}"),
        (Dialect::MsSql, _, _) => {
            format!("SET STATISTICS XML ON; {sql}; SET STATISTICS XML OFF;")
        }
        (Dialect::Sqlite, _, _) => format!("EXPLAIN QUERY PLAN {sql}"),
        (Dialect::Unknown(driver), _, _) => {
            return Err(GatewayError::unsupported_driver(
                driver.as_str(),
                NATIVE_DRIVERS,
                "EXPLAIN requires a native adapter",
            ));
        }
    };
    Ok(statement)
}

/// Parse EXPLAIN output into plan trees (one per root).
pub fn parse_explain_output(
    dialect: &Dialect,
    result: &QueryResult,
    format: ExplainFormat,
) -> Vec<QueryPlanNode> {
    if result.rows.is_empty() {
        return Vec::new();
    }
    let parsed = match (dialect, format) {
        (Dialect::Postgres, ExplainFormat::Json) => first_json(result).and_then(|v| postgres_plan(&v)),
        (Dialect::MySql, ExplainFormat::Json) => first_json(result).and_then(|v| mysql_plan(&v)),
        (Dialect::Sqlite, _) => sqlite_plan(result),
        (Dialect::MsSql, _) => first_text(result).and_then(|xml| showplan(&xml)),
        _ => None,
    };
    parsed.unwrap_or_else(|| flat_nodes(result))
}

// =============================================================================
// Value Helpers
// =============================================================================

fn num(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

fn first_cell(result: &QueryResult) -> Option<&JsonValue> {
    result.rows.first().and_then(|row| row.first())
}

/// First cell as JSON, decoding it when the driver returned text.
fn first_json(result: &QueryResult) -> Option<JsonValue> {
    match first_cell(result)? {
        JsonValue::String(s) => serde_json::from_str(s).ok(),
        other => Some(other.clone()),
    }
}

fn first_text(result: &QueryResult) -> Option<String> {
    match first_cell(result)? {
        JsonValue::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn without_keys(object: &Map<String, JsonValue>, keys: &[&str]) -> JsonValue {
    let rest: Map<String, JsonValue> = object
        .iter()
        .filter(|(k, _)| !keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if rest.is_empty() {
        JsonValue::Null
    } else {
        JsonValue::Object(rest)
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

const PG_NORMALIZED: &[&str] = &[
    "Node Type",
    "Relation Name",
    "Startup Cost",
    "Total Cost",
    "Plan Rows",
    "Plan Width",
    "Actual Total Time",
    "Actual Rows",
    "Plans",
];

fn postgres_plan(value: &JsonValue) -> Option<Vec<QueryPlanNode>> {
    let entries = match value {
        JsonValue::Array(items) => items.as_slice(),
        JsonValue::Object(_) => std::slice::from_ref(value),
        _ => return None,
    };
    let mut roots = Vec::new();
    for entry in entries {
        let entry = entry.as_object()?;
        let mut node = postgres_node(entry.get("Plan")?.as_object()?);
        let timings = without_keys(entry, &["Plan"]);
        if let JsonValue::Object(timings) = timings {
            let details = node
                .details
                .as_object()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .chain(timings)
                .collect();
            node.details = JsonValue::Object(details);
        }
        roots.push(node);
    }
    (!roots.is_empty()).then_some(roots)
}

fn postgres_node(plan: &Map<String, JsonValue>) -> QueryPlanNode {
    let mut node = QueryPlanNode::new(
        string(plan.get("Node Type")).unwrap_or_else(|| "Unknown".to_string()),
    );
    node.target = ["Relation Name", "Index Name", "CTE Name", "Function Name"]
        .iter()
        .find_map(|key| string(plan.get(*key)));
    node.startup_cost = num(plan.get("Startup Cost"));
    node.total_cost = num(plan.get("Total Cost"));
    node.plan_rows = num(plan.get("Plan Rows"));
    node.plan_width = num(plan.get("Plan Width")).map(|w| w as u64);
    node.actual_time_ms = num(plan.get("Actual Total Time"));
    node.actual_rows = num(plan.get("Actual Rows"));
    node.details = without_keys(plan, PG_NORMALIZED);
    node.children = plan
        .get("Plans")
        .and_then(JsonValue::as_array)
        .map(|plans| {
            plans
                .iter()
                .filter_map(JsonValue::as_object)
                .map(postgres_node)
                .collect()
        })
        .unwrap_or_default();
    node
}

// =============================================================================
// MySQL
// =============================================================================

fn mysql_plan(value: &JsonValue) -> Option<Vec<QueryPlanNode>> {
    let block = value.get("query_block")?.as_object()?;
    Some(vec![mysql_block(block)])
}

fn mysql_block(block: &Map<String, JsonValue>) -> QueryPlanNode {
    let mut node = QueryPlanNode::new("Query Block");
    node.total_cost = num(block.get("cost_info").and_then(|c| c.get("query_cost")));
    if let Some(id) = block.get("select_id") {
        node.details = serde_json::json!({ "select_id": id });
    }
    node.children = mysql_children(block);
    node
}

fn mysql_operation(name: &str, body: &JsonValue) -> QueryPlanNode {
    let mut node = QueryPlanNode::new(name);
    if let Some(object) = body.as_object() {
        node.details = without_keys(
            object,
            &["table", "nested_loop", "query_block", "grouping_operation", "duplicates_removal"],
        );
        node.children = mysql_children(object);
    }
    node
}

fn mysql_children(object: &Map<String, JsonValue>) -> Vec<QueryPlanNode> {
    let mut children = Vec::new();
    for (key, value) in object {
        match key.as_str() {
            "table" => {
                if let Some(table) = value.as_object() {
                    children.push(mysql_table(table));
                }
            }
            "nested_loop" => {
                let mut node = QueryPlanNode::new("Nested Loop");
                node.children = value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(JsonValue::as_object)
                            .flat_map(mysql_children)
                            .collect()
                    })
                    .unwrap_or_default();
                children.push(node);
            }
            "ordering_operation" => children.push(mysql_operation("Sort", value)),
            "grouping_operation" => children.push(mysql_operation("Group", value)),
            "duplicates_removal" => children.push(mysql_operation("Distinct", value)),
            "union_result" => {
                let mut node = mysql_operation("Union", value);
                node.children = value
                    .get("query_specifications")
                    .and_then(JsonValue::as_array)
                    .map(|specs| {
                        specs
                            .iter()
                            .filter_map(|s| s.get("query_block").and_then(JsonValue::as_object))
                            .map(mysql_block)
                            .collect()
                    })
                    .unwrap_or_default();
                children.push(node);
            }
            "query_block" => {
                if let Some(block) = value.as_object() {
                    children.push(mysql_block(block));
                }
            }
            _ => {}
        }
    }
    children
}

fn mysql_access(access_type: &str) -> String {
    match access_type {
        "ALL" => "Full Table Scan".to_string(),
        "index" => "Full Index Scan".to_string(),
        "range" => "Index Range Scan".to_string(),
        "ref" | "eq_ref" | "ref_or_null" => "Index Lookup".to_string(),
        "const" | "system" => "Constant Lookup".to_string(),
        "fulltext" => "Fulltext Search".to_string(),
        other => format!("Table Access ({other})"),
    }
}

fn mysql_table(table: &Map<String, JsonValue>) -> QueryPlanNode {
    let access = string(table.get("access_type")).unwrap_or_else(|| "ALL".to_string());
    let mut node = QueryPlanNode::new(mysql_access(&access));
    node.target = string(table.get("table_name"));
    node.total_cost = num(table.get("cost_info").and_then(|c| c.get("prefix_cost")));
    node.plan_rows =
        num(table.get("rows_produced_per_join")).or_else(|| num(table.get("rows_examined_per_scan")));
    node.details = without_keys(table, &["table_name", "materialized_from_subquery"]);
    if let Some(block) = table
        .get("materialized_from_subquery")
        .and_then(|m| m.get("query_block"))
        .and_then(JsonValue::as_object)
    {
        node.children.push(mysql_block(block));
    }
    node
}

// =============================================================================
// SQLite
// =============================================================================

fn sqlite_plan(result: &QueryResult) -> Option<Vec<QueryPlanNode>> {
    let id_col = result.column_index("id")?;
    let parent_col = result.column_index("parent")?;
    let detail_col = result.column_index("detail")?;

    let mut entries: Vec<(i64, i64, QueryPlanNode)> = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let id = num(row.get(id_col))? as i64;
        let parent = num(row.get(parent_col)).unwrap_or(0.0) as i64;
        let detail = string(row.get(detail_col)).unwrap_or_default();
        let mut node = QueryPlanNode::new(detail.clone());
        node.target = sqlite_target(&detail);
        entries.push((id, parent, node));
    }

    // Rows arrive parent-first; attach children bottom-up
    let ids: Vec<i64> = entries.iter().map(|(id, _, _)| *id).collect();
    let mut slots: Vec<Option<QueryPlanNode>> = Vec::with_capacity(entries.len());
    let parents: Vec<i64> = entries.iter().map(|(_, parent, _)| *parent).collect();
    for (_, _, node) in entries {
        slots.push(Some(node));
    }
    for idx in (0..slots.len()).rev() {
        let parent = parents[idx];
        let Some(parent_idx) = ids.iter().position(|id| *id == parent && parent != 0) else {
            continue;
        };
        if parent_idx == idx {
            continue;
        }
        if let Some(child) = slots[idx].take() {
            if let Some(parent_node) = slots[parent_idx].as_mut() {
                parent_node.children.insert(0, child);
            }
        }
    }
    let roots: Vec<QueryPlanNode> = slots.into_iter().flatten().collect();
    (!roots.is_empty()).then_some(roots)
}

/// Table named in a detail line such as `SEARCH users USING INDEX ...`.
fn sqlite_target(detail: &str) -> Option<String> {
    let mut words = detail.split_whitespace();
    match words.next()? {
        "SCAN" | "SEARCH" => {
            let word = words.next()?;
            let word = if word == "TABLE" { words.next()? } else { word };
            Some(word.to_string())
        }
        _ => None,
    }
}

// =============================================================================
// SQL Server
// =============================================================================

static SHOWPLAN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<RelOp\b([^>]*?)(/?)>|</RelOp>|<Object\b([^>]*?)/?>|<RunTimeCountersPerThread\b([^>]*?)/?>"#)
        .expect("SHOWPLAN_TAG is a valid regex pattern")
});

static XML_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)="([^"]*)""#).expect("XML_ATTR is a valid regex pattern")
});

fn xml_attrs(raw: &str) -> Map<String, JsonValue> {
    XML_ATTR
        .captures_iter(raw)
        .map(|c| (c[1].to_string(), JsonValue::String(c[2].to_string())))
        .collect()
}

fn showplan(xml: &str) -> Option<Vec<QueryPlanNode>> {
    if !xml.contains("<RelOp") {
        return None;
    }
    let mut stack: Vec<QueryPlanNode> = Vec::new();
    let mut roots = Vec::new();

    let close = |stack: &mut Vec<QueryPlanNode>, roots: &mut Vec<QueryPlanNode>| {
        if let Some(node) = stack.pop() {
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => roots.push(node),
            }
        }
    };

    for caps in SHOWPLAN_TAG.captures_iter(xml) {
        if let Some(raw) = caps.get(1) {
            let attrs = xml_attrs(raw.as_str());
            let operation = string(attrs.get("PhysicalOp")).unwrap_or_else(|| "RelOp".to_string());
            let mut node = QueryPlanNode::new(operation);
            node.plan_rows = num(attrs.get("EstimateRows"));
            node.total_cost = num(attrs.get("EstimatedTotalSubtreeCost"));
            node.plan_width = num(attrs.get("AvgRowSize")).map(|w| w as u64);
            node.details = without_keys(
                &attrs,
                &["PhysicalOp", "EstimateRows", "EstimatedTotalSubtreeCost", "AvgRowSize"],
            );
            stack.push(node);
            if caps.get(2).is_some_and(|m| m.as_str() == "/") {
                close(&mut stack, &mut roots);
            }
        } else if let Some(raw) = caps.get(3) {
            if let Some(node) = stack.last_mut() {
                if node.target.is_none() {
                    let attrs = xml_attrs(raw.as_str());
                    node.target = string(attrs.get("Table"))
                        .or_else(|| string(attrs.get("Index")))
                        .map(|t| t.trim_matches(|c| c == '[' || c == ']').to_string());
                }
            }
        } else if let Some(raw) = caps.get(4) {
            if let Some(node) = stack.last_mut() {
                let attrs = xml_attrs(raw.as_str());
                if let Some(rows) = num(attrs.get("ActualRows")) {
                    node.actual_rows = Some(node.actual_rows.unwrap_or(0.0) + rows);
                }
                if let Some(ms) = num(attrs.get("ActualElapsedms")) {
                    node.actual_time_ms = Some(node.actual_time_ms.unwrap_or(0.0).max(ms));
                }
            }
        } else {
            close(&mut stack, &mut roots);
        }
    }
    while !stack.is_empty() {
        close(&mut stack, &mut roots);
    }
    (!roots.is_empty()).then_some(roots)
}

// =============================================================================
// Text and Row Output
// =============================================================================

static COST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(cost=([\d.]+)(?:\.\.([\d.]+))?\s+rows=([\d.eE+]+)(?:\s+width=(\d+))?\)")
        .expect("COST is a valid regex pattern")
});

static ACTUAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(actual time=([\d.]+)\.\.([\d.]+)\s+rows=([\d.]+)")
        .expect("ACTUAL is a valid regex pattern")
});

/// One node from a text plan line, e.g. `->  Seq Scan on users  (cost=0.00..1.01 rows=1 width=4)`.
pub fn text_line_node(line: &str) -> QueryPlanNode {
    let trimmed = line.trim().trim_start_matches("->").trim();
    let label = trimmed.split(" (").next().unwrap_or(trimmed).trim();
    let (operation, target) = match label.split_once(" on ") {
        Some((op, rest)) => (
            op.trim().to_string(),
            rest.split_whitespace().next().map(str::to_string),
        ),
        None => (label.to_string(), None),
    };
    let mut node = QueryPlanNode::new(operation);
    node.target = target;

    if let Some(caps) = COST.captures(trimmed) {
        let first = caps.get(1).and_then(|m| m.as_str().parse().ok());
        match caps.get(2).and_then(|m| m.as_str().parse().ok()) {
            Some(total) => {
                node.startup_cost = first;
                node.total_cost = Some(total);
            }
            None => node.total_cost = first,
        }
        node.plan_rows = caps.get(3).and_then(|m| m.as_str().parse().ok());
        node.plan_width = caps.get(4).and_then(|m| m.as_str().parse().ok());
    }
    if let Some(caps) = ACTUAL.captures(trimmed) {
        node.actual_time_ms = caps.get(2).and_then(|m| m.as_str().parse().ok());
        node.actual_rows = caps.get(3).and_then(|m| m.as_str().parse().ok());
    }
    node.details = serde_json::json!({ "line": trimmed });
    node
}

/// Column holding the operation text, by the names each backend uses.
fn operation_column(result: &QueryResult) -> Option<usize> {
    ["detail", "QUERY PLAN", "EXPLAIN", "StmtText"]
        .iter()
        .find_map(|name| result.column_index(name))
}

/// One node per row (or per line of multi-line text cells).
pub fn flat_nodes(result: &QueryResult) -> Vec<QueryPlanNode> {
    let objects = result.rows_as_objects();
    let op_col = operation_column(result);
    let mut nodes = Vec::new();

    for (row, object) in result.rows.iter().zip(objects) {
        if let Some(JsonValue::String(text)) = op_col.and_then(|idx| row.get(idx)) {
            let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
            if !lines.is_empty() {
                nodes.extend(lines.into_iter().map(text_line_node));
                continue;
            }
        }

        let operation = match (object.get("select_type"), object.get("type")) {
            // MySQL traditional EXPLAIN
            (Some(select_type), Some(access)) => format!(
                "{} ({})",
                string(Some(select_type)).unwrap_or_default(),
                string(Some(access)).unwrap_or_else(|| "ALL".to_string())
            ),
            _ => row
                .first()
                .and_then(|v| string(Some(v)))
                .unwrap_or_else(|| "Unknown".to_string()),
        };
        let mut node = QueryPlanNode::new(operation);
        node.target = string(object.get("table"));
        node.plan_rows = num(object.get("rows"));
        node.details = JsonValue::Object(object);
        nodes.push(node);
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_postgres_variants() {
        let pg = Dialect::Postgres;
        assert_eq!(
            build_explain_query(&pg, "SELECT 1;", true, ExplainFormat::Json).unwrap(),
            "EXPLAIN (ANALYZE, FORMAT JSON) SELECT 1"
        );
        assert_eq!(
            build_explain_query(&pg, "SELECT 1", false, ExplainFormat::Json).unwrap(),
            "EXPLAIN (FORMAT JSON) SELECT 1"
        );
        assert_eq!(
            build_explain_query(&pg, "SELECT 1", true, ExplainFormat::Text).unwrap(),
            "EXPLAIN ANALYZE SELECT 1"
        );
        assert_eq!(
            build_explain_query(&pg, "SELECT 1", false, ExplainFormat::Text).unwrap(),
            "EXPLAIN SELECT 1"
        );
    }

    #[test]
    fn test_build_other_dialects() {
        assert_eq!(
            build_explain_query(&Dialect::MySql, "SELECT 1", false, ExplainFormat::Json).unwrap(),
            "EXPLAIN FORMAT=JSON SELECT 1"
        );
        assert_eq!(
            build_explain_query(&Dialect::MySql, "SELECT 1", true, ExplainFormat::Json).unwrap(),
            "EXPLAIN ANALYZE SELECT 1"
        );
        assert_eq!(
            build_explain_query(&Dialect::MsSql, "SELECT 1;;", false, ExplainFormat::Json)
                .unwrap(),
            "SET STATISTICS XML ON; SELECT 1; SET STATISTICS XML OFF;"
        );
        assert_eq!(
            build_explain_query(&Dialect::Sqlite, "SELECT 1", false, ExplainFormat::Text).unwrap(),
            "EXPLAIN QUERY PLAN SELECT 1"
        );
        let err = build_explain_query(
            &Dialect::Unknown("oracle".into()),
            "SELECT 1",
            false,
            ExplainFormat::Json,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "unsupported_driver");
    }

    #[test]
    fn test_build_rejects_stacked_statements() {
        for dialect in [Dialect::Postgres, Dialect::MySql, Dialect::MsSql, Dialect::Sqlite] {
            let err = build_explain_query(&dialect, "SELECT 1; DROP TABLE items", false, ExplainFormat::Text)
                .unwrap_err();
            assert_eq!(err.kind(), "validation", "{dialect:?}");
        }
        let err = build_explain_query(&Dialect::Sqlite, "SELECT 1 /* ; */; DELETE FROM t", false, ExplainFormat::Text)
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(
            build_explain_query(&Dialect::Sqlite, "SELECT ';' /* ; */", false, ExplainFormat::Text).unwrap(),
            "EXPLAIN QUERY PLAN SELECT ';' /* ; */"
        );
        assert_eq!(
            build_explain_query(&Dialect::Sqlite, " ;; ", false, ExplainFormat::Text)
                .unwrap_err()
                .kind(),
            "validation"
        );
        assert_eq!(
            build_explain_query(&Dialect::Sqlite, "SELECT 'open", false, ExplainFormat::Text)
                .unwrap_err()
                .kind(),
            "validation"
        );
    }

    #[test]
    fn test_parse_postgres_json_tree() {
        let plan = json!([{
            "Plan": {
                "Node Type": "Hash Join",
                "Startup Cost": 1.5,
                "Total Cost": 10.25,
                "Plan Rows": 20,
                "Plan Width": 16,
                "Join Type": "Inner",
                "Plans": [
                    {"Node Type": "Seq Scan", "Relation Name": "orders", "Total Cost": 4.0, "Plan Rows": 100},
                    {"Node Type": "Hash", "Plans": [
                        {"Node Type": "Index Scan", "Index Name": "users_pkey", "Relation Name": "users"}
                    ]}
                ]
            },
            "Planning Time": 0.12,
            "Execution Time": 0.5
        }]);
        let result = QueryResult::new(vec!["QUERY PLAN".into()], vec![vec![plan]]);
        let nodes = parse_explain_output(&Dialect::Postgres, &result, ExplainFormat::Json);

        assert_eq!(nodes.len(), 1);
        let root = &nodes[0];
        assert_eq!(root.operation, "Hash Join");
        assert_eq!(root.total_cost, Some(10.25));
        assert_eq!(root.plan_width, Some(16));
        assert_eq!(root.details["Join Type"], "Inner");
        assert_eq!(root.details["Execution Time"], 0.5);
        assert_eq!(root.node_count(), 4);
        assert_eq!(root.children[0].target.as_deref(), Some("orders"));
        assert_eq!(root.children[1].children[0].target.as_deref(), Some("users"));
    }

    #[test]
    fn test_malformed_json_falls_back_to_flat_nodes() {
        let result = QueryResult::new(
            vec!["QUERY PLAN".into()],
            vec![vec![json!("[{\"Plan\": {")]],
        );
        let nodes = parse_explain_output(&Dialect::Postgres, &result, ExplainFormat::Json);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].children.is_empty());
    }

    #[test]
    fn test_parse_postgres_text_lines() {
        let result = QueryResult::new(
            vec!["QUERY PLAN".into()],
            vec![
                vec![json!("Seq Scan on users  (cost=0.00..35.50 rows=2550 width=4) (actual time=0.010..0.020 rows=3 loops=1)")],
                vec![json!("Planning Time: 0.050 ms")],
            ],
        );
        let nodes = parse_explain_output(&Dialect::Postgres, &result, ExplainFormat::Text);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].operation, "Seq Scan");
        assert_eq!(nodes[0].target.as_deref(), Some("users"));
        assert_eq!(nodes[0].startup_cost, Some(0.0));
        assert_eq!(nodes[0].total_cost, Some(35.5));
        assert_eq!(nodes[0].plan_rows, Some(2550.0));
        assert_eq!(nodes[0].plan_width, Some(4));
        assert_eq!(nodes[0].actual_time_ms, Some(0.02));
        assert_eq!(nodes[0].actual_rows, Some(3.0));
    }

    #[test]
    fn test_parse_mysql_json() {
        let plan = json!({
            "query_block": {
                "select_id": 1,
                "cost_info": {"query_cost": "2.45"},
                "ordering_operation": {
                    "using_filesort": true,
                    "nested_loop": [
                        {"table": {"table_name": "o", "access_type": "ALL", "rows_produced_per_join": 10, "cost_info": {"prefix_cost": "1.25"}}},
                        {"table": {"table_name": "u", "access_type": "eq_ref", "key": "PRIMARY"}}
                    ]
                }
            }
        });
        let result = QueryResult::new(vec!["EXPLAIN".into()], vec![vec![json!(plan.to_string())]]);
        let nodes = parse_explain_output(&Dialect::MySql, &result, ExplainFormat::Json);

        let root = &nodes[0];
        assert_eq!(root.operation, "Query Block");
        assert_eq!(root.total_cost, Some(2.45));
        let sort = &root.children[0];
        assert_eq!(sort.operation, "Sort");
        let join = &sort.children[0];
        assert_eq!(join.operation, "Nested Loop");
        assert_eq!(join.children[0].operation, "Full Table Scan");
        assert_eq!(join.children[0].target.as_deref(), Some("o"));
        assert_eq!(join.children[0].total_cost, Some(1.25));
        assert_eq!(join.children[1].operation, "Index Lookup");
    }

    #[test]
    fn test_parse_sqlite_query_plan_tree() {
        let result = QueryResult::new(
            vec!["id".into(), "parent".into(), "notused".into(), "detail".into()],
            vec![
                vec![json!(2), json!(0), json!(0), json!("SCAN users")],
                vec![json!(5), json!(0), json!(0), json!("USE TEMP B-TREE FOR ORDER BY")],
                vec![json!(7), json!(2), json!(0), json!("SEARCH orders USING INDEX idx_user (user_id=?)")],
            ],
        );
        let nodes = parse_explain_output(&Dialect::Sqlite, &result, ExplainFormat::Text);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].target.as_deref(), Some("users"));
        assert_eq!(nodes[0].children.len(), 1);
        assert_eq!(nodes[0].children[0].target.as_deref(), Some("orders"));
    }

    #[test]
    fn test_parse_mssql_showplan() {
        let xml = r#"<ShowPlanXML><BatchSequence><Batch><Statements><StmtSimple>
            <QueryPlan>
              <RelOp NodeId="0" PhysicalOp="Nested Loops" LogicalOp="Inner Join" EstimateRows="10" EstimatedTotalSubtreeCost="0.5">
                <RunTimeInformation><RunTimeCountersPerThread Thread="0" ActualRows="8" /></RunTimeInformation>
                <RelOp NodeId="1" PhysicalOp="Clustered Index Scan" EstimateRows="10" EstimatedTotalSubtreeCost="0.2">
                  <IndexScan><Object Database="[app]" Schema="[dbo]" Table="[orders]" Index="[pk_orders]" /></IndexScan>
                </RelOp>
              </RelOp>
            </QueryPlan></StmtSimple></Statements></Batch></BatchSequence></ShowPlanXML>"#;
        let result = QueryResult::new(
            vec!["Microsoft SQL Server 2005 XML Showplan".into()],
            vec![vec![json!(xml)]],
        );
        let nodes = parse_explain_output(&Dialect::MsSql, &result, ExplainFormat::Json);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].operation, "Nested Loops");
        assert_eq!(nodes[0].actual_rows, Some(8.0));
        assert_eq!(nodes[0].children[0].operation, "Clustered Index Scan");
        assert_eq!(nodes[0].children[0].target.as_deref(), Some("orders"));
    }

    #[test]
    fn test_mysql_traditional_rows() {
        let result = QueryResult::new(
            vec!["id".into(), "select_type".into(), "table".into(), "type".into(), "rows".into()],
            vec![vec![json!(1), json!("SIMPLE"), json!("users"), json!("ALL"), json!(42)]],
        );
        let nodes = parse_explain_output(&Dialect::MySql, &result, ExplainFormat::Text);
        assert_eq!(nodes[0].operation, "SIMPLE (ALL)");
        assert_eq!(nodes[0].target.as_deref(), Some("users"));
        assert_eq!(nodes[0].plan_rows, Some(42.0));
    }

    #[test]
    fn test_empty_output() {
        let result = QueryResult::default();
        assert!(parse_explain_output(&Dialect::Postgres, &result, ExplainFormat::Json).is_empty());
    }
}
