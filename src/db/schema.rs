//! Schema introspection.
//!
//! Loads the columns and indexes of every base table in one schema, for the
//! schema diff engine.
//!
//! # Architecture
//!
//! SQL text lives in the `queries` submodule, one builder per backend. Every
//! backend answers the same two queries, columns and index columns, with the
//! same column aliases, so a single assembler turns both result sets into
//! [`TableSchema`] values. Schema names are validated with
//! [`sanitize_identifier`] before being interpolated.

use crate::db::dialect::{Dialect, NATIVE_DRIVERS};
use crate::db::executor::QueryRouter;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{ColumnSchema, ConnectionDescriptor, IndexSchema, QueryResult, TableSchema};
use crate::tools::guard::sanitize_identifier;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::debug;

mod queries {
    pub mod postgres {
        pub fn columns(schema: &str) -> String {
            format!(
                r#"
                SELECT
                    c.table_name::text AS table_name,
                    c.column_name::text AS column_name,
                    format_type(a.atttypid, a.atttypmod) AS data_type,
                    c.is_nullable::text AS is_nullable,
                    c.column_default::text AS column_default
                FROM information_schema.columns c
                JOIN information_schema.tables t
                    ON t.table_schema = c.table_schema
                    AND t.table_name = c.table_name
                    AND t.table_type = 'BASE TABLE'
                JOIN pg_namespace n ON n.nspname = c.table_schema
                JOIN pg_class cl ON cl.relnamespace = n.oid AND cl.relname = c.table_name
                JOIN pg_attribute a ON a.attrelid = cl.oid AND a.attname = c.column_name
                WHERE c.table_schema = '{schema}'
                ORDER BY c.table_name, c.ordinal_position
                "#
            )
        }

        pub fn indexes(schema: &str) -> String {
            format!(
                r#"
                SELECT
                    t.relname::text AS table_name,
                    i.relname::text AS index_name,
                    a.attname::text AS column_name,
                    ix.indisunique AS is_unique
                FROM pg_index ix
                JOIN pg_class i ON i.oid = ix.indexrelid
                JOIN pg_class t ON t.oid = ix.indrelid
                JOIN pg_namespace n ON n.oid = t.relnamespace
                CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                WHERE n.nspname = '{schema}' AND t.relkind = 'r'
                ORDER BY t.relname, i.relname, k.ord
                "#
            )
        }
    }

    pub mod mysql {
        /// `schema` is a quoted literal or `DATABASE()`.
        pub fn columns(schema: &str) -> String {
            format!(
                r#"
                SELECT
                    CONVERT(c.TABLE_NAME USING utf8mb4) AS table_name,
                    CONVERT(c.COLUMN_NAME USING utf8mb4) AS column_name,
                    CONVERT(c.COLUMN_TYPE USING utf8mb4) AS data_type,
                    CONVERT(c.IS_NULLABLE USING utf8mb4) AS is_nullable,
                    CONVERT(c.COLUMN_DEFAULT USING utf8mb4) AS column_default
                FROM information_schema.COLUMNS c
                JOIN information_schema.TABLES t
                    ON t.TABLE_SCHEMA = c.TABLE_SCHEMA
                    AND t.TABLE_NAME = c.TABLE_NAME
                    AND t.TABLE_TYPE = 'BASE TABLE'
                WHERE c.TABLE_SCHEMA = {schema}
                ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
                "#
            )
        }

        pub fn indexes(schema: &str) -> String {
            format!(
                r#"
                SELECT
                    CONVERT(TABLE_NAME USING utf8mb4) AS table_name,
                    CONVERT(INDEX_NAME USING utf8mb4) AS index_name,
                    CONVERT(COLUMN_NAME USING utf8mb4) AS column_name,
                    NON_UNIQUE = 0 AS is_unique
                FROM information_schema.STATISTICS
                WHERE TABLE_SCHEMA = {schema}
                ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX
                "#
            )
        }
    }

    pub mod mssql {
        pub fn columns(schema: &str) -> String {
            format!(
                r#"
                SELECT
                    c.TABLE_NAME AS table_name,
                    c.COLUMN_NAME AS column_name,
                    c.DATA_TYPE AS data_type,
                    c.IS_NULLABLE AS is_nullable,
                    c.COLUMN_DEFAULT AS column_default
                FROM INFORMATION_SCHEMA.COLUMNS c
                JOIN INFORMATION_SCHEMA.TABLES t
                    ON t.TABLE_SCHEMA = c.TABLE_SCHEMA
                    AND t.TABLE_NAME = c.TABLE_NAME
                    AND t.TABLE_TYPE = 'BASE TABLE'
                WHERE c.TABLE_SCHEMA = N'{schema}'
                ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
                "#
            )
        }

        pub fn indexes(schema: &str) -> String {
            format!(
                r#"
                SELECT
                    t.name AS table_name,
                    i.name AS index_name,
                    col.name AS column_name,
                    CAST(i.is_unique AS int) AS is_unique
                FROM sys.indexes i
                JOIN sys.tables t ON t.object_id = i.object_id
                JOIN sys.schemas s ON s.schema_id = t.schema_id
                JOIN sys.index_columns ic
                    ON ic.object_id = i.object_id AND ic.index_id = i.index_id
                JOIN sys.columns col
                    ON col.object_id = ic.object_id AND col.column_id = ic.column_id
                WHERE s.name = N'{schema}'
                    AND i.name IS NOT NULL
                    AND ic.is_included_column = 0
                ORDER BY t.name, i.name, ic.key_ordinal
                "#
            )
        }
    }

    pub mod sqlite {
        pub fn columns(schema: &str) -> String {
            format!(
                r#"
                SELECT
                    m.name AS table_name,
                    p.name AS column_name,
                    p.type AS data_type,
                    CASE WHEN p."notnull" = 0 THEN 'YES' ELSE 'NO' END AS is_nullable,
                    p.dflt_value AS column_default
                FROM {schema}.sqlite_master m
                JOIN pragma_table_info(m.name, '{schema}') p
                WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'
                ORDER BY m.name, p.cid
                "#
            )
        }

        pub fn indexes(schema: &str) -> String {
            format!(
                r#"
                SELECT
                    m.name AS table_name,
                    il.name AS index_name,
                    ii.name AS column_name,
                    il."unique" AS is_unique
                FROM {schema}.sqlite_master m
                JOIN pragma_index_list(m.name, '{schema}') il
                JOIN pragma_index_info(il.name, '{schema}') ii
                WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%'
                ORDER BY m.name, il.name, ii.seqno
                "#
            )
        }
    }
}

/// Schema inspector for database introspection.
pub struct SchemaInspector;

impl SchemaInspector {
    /// Load every base table of `schema` (the dialect default when `None`).
    pub async fn load_tables(
        router: &QueryRouter,
        descriptor: &ConnectionDescriptor,
        schema: Option<&str>,
    ) -> GatewayResult<Vec<TableSchema>> {
        let dialect = Dialect::classify(&descriptor.driver);
        let (columns_sql, indexes_sql) = Self::build_queries(&dialect, schema)?;

        debug!(
            connection_id = %descriptor.id,
            dialect = %dialect,
            schema = ?schema,
            "Loading schema"
        );

        let (columns, indexes) = tokio::try_join!(
            router.execute_unlimited(descriptor, &columns_sql),
            router.execute_unlimited(descriptor, &indexes_sql),
        )?;
        Ok(assemble_tables(&columns, &indexes))
    }

    /// Column and index queries for one schema.
    pub fn build_queries(dialect: &Dialect, schema: Option<&str>) -> GatewayResult<(String, String)> {
        let schema = match schema {
            Some(name) => Some(sanitize_identifier(name)?),
            None => dialect.default_schema(),
        };
        match dialect {
            Dialect::Postgres => {
                let schema = schema.unwrap_or("public");
                Ok((
                    queries::postgres::columns(schema),
                    queries::postgres::indexes(schema),
                ))
            }
            Dialect::MySql => {
                let schema = schema
                    .map(|s| format!("'{s}'"))
                    .unwrap_or_else(|| "DATABASE()".to_string());
                Ok((
                    queries::mysql::columns(&schema),
                    queries::mysql::indexes(&schema),
                ))
            }
            Dialect::MsSql => {
                let schema = schema.unwrap_or("dbo");
                Ok((
                    queries::mssql::columns(schema),
                    queries::mssql::indexes(schema),
                ))
            }
            Dialect::Sqlite => {
                let schema = schema.unwrap_or("main");
                Ok((
                    queries::sqlite::columns(schema),
                    queries::sqlite::indexes(schema),
                ))
            }
            Dialect::Unknown(driver) => Err(GatewayError::unsupported_driver(
                driver.as_str(),
                NATIVE_DRIVERS,
                "schema introspection requires a native adapter",
            )),
        }
    }
}

fn text(result: &QueryResult, row: usize, column: &str) -> Option<String> {
    match result.value(row, column)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn truthy(result: &QueryResult, row: usize, column: &str) -> bool {
    match result.value(row, column) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(JsonValue::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "y" | "yes"
        ),
        _ => false,
    }
}

/// Build tables from the column and index result sets, ordered by table name.
pub fn assemble_tables(columns: &QueryResult, indexes: &QueryResult) -> Vec<TableSchema> {
    let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();

    for row in 0..columns.row_count {
        let (Some(table), Some(name)) = (
            text(columns, row, "table_name"),
            text(columns, row, "column_name"),
        ) else {
            continue;
        };
        let mut column = ColumnSchema::new(
            name,
            text(columns, row, "data_type").unwrap_or_default(),
            text(columns, row, "is_nullable").is_some_and(|v| v.eq_ignore_ascii_case("YES")),
        );
        column.default = text(columns, row, "column_default");
        tables
            .entry(table.clone())
            .or_insert_with(|| TableSchema::new(table))
            .columns
            .push(column);
    }

    for row in 0..indexes.row_count {
        let (Some(table), Some(index_name), Some(column)) = (
            text(indexes, row, "table_name"),
            text(indexes, row, "index_name"),
            text(indexes, row, "column_name"),
        ) else {
            continue;
        };
        // Indexes on views or filtered-out tables
        let Some(table) = tables.get_mut(&table) else {
            continue;
        };
        match table.indexes.iter_mut().find(|i| i.name == index_name) {
            Some(index) => index.columns.push(column),
            None => table.indexes.push(IndexSchema {
                name: index_name,
                columns: vec![column],
                unique: truthy(indexes, row, "is_unique"),
            }),
        }
    }

    tables.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(columns: &[&str], rows: Vec<Vec<JsonValue>>) -> QueryResult {
        QueryResult::new(columns.iter().map(|c| c.to_string()).collect(), rows)
    }

    #[test]
    fn test_assemble_tables_groups_columns_and_indexes() {
        let columns = result(
            &["table_name", "column_name", "data_type", "is_nullable", "column_default"],
            vec![
                vec![json!("users"), json!("id"), json!("integer"), json!("NO"), json!(null)],
                vec![json!("users"), json!("email"), json!("varchar(255)"), json!("YES"), json!(null)],
                vec![json!("orders"), json!("id"), json!("bigint"), json!("NO"), json!("0")],
            ],
        );
        let indexes = result(
            &["table_name", "index_name", "column_name", "is_unique"],
            vec![
                vec![json!("users"), json!("users_email_idx"), json!("email"), json!(true)],
                vec![json!("orders"), json!("orders_multi"), json!("id"), json!(0)],
                vec![json!("orders"), json!("orders_multi"), json!("id2"), json!(0)],
                vec![json!("some_view"), json!("ignored"), json!("x"), json!(1)],
            ],
        );

        let tables = assemble_tables(&columns, &indexes);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].name, "orders");
        assert_eq!(tables[1].name, "users");

        let users = &tables[1];
        assert_eq!(users.columns.len(), 2);
        assert!(users.column("email").unwrap().nullable);
        assert!(!users.column("id").unwrap().nullable);
        assert!(users.indexes[0].unique);

        let orders = &tables[0];
        assert_eq!(orders.column("id").unwrap().default.as_deref(), Some("0"));
        assert_eq!(orders.indexes[0].columns, vec!["id", "id2"]);
        assert!(!orders.indexes[0].unique);
    }

    #[test]
    fn test_schema_name_is_sanitized() {
        let err = SchemaInspector::build_queries(&Dialect::Postgres, Some("public'; DROP")).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_default_schemas() {
        let (columns, _) = SchemaInspector::build_queries(&Dialect::Postgres, None).unwrap();
        assert!(columns.contains("'public'"));
        let (columns, _) = SchemaInspector::build_queries(&Dialect::MySql, None).unwrap();
        assert!(columns.contains("DATABASE()"));
        let (_, indexes) = SchemaInspector::build_queries(&Dialect::MsSql, None).unwrap();
        assert!(indexes.contains("N'dbo'"));
        let (columns, _) = SchemaInspector::build_queries(&Dialect::Sqlite, None).unwrap();
        assert!(columns.contains("main.sqlite_master"));
    }

    #[test]
    fn test_unknown_dialect_is_unsupported() {
        let err = SchemaInspector::build_queries(&Dialect::Unknown("oracle".into()), None)
            .unwrap_err();
        assert_eq!(err.kind(), "unsupported_driver");
    }
}
