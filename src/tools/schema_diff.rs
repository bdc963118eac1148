//! Schema comparison and migration script generation.

use crate::db::dialect::Dialect;
use crate::models::{
    ColumnDiff, ColumnSchema, DiffStatus, DiffSummary, IndexDiff, IndexSchema, SchemaDiff,
    TableDiff, TableSchema,
};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static TYPE_QUALIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\([^)]*\)").expect("TYPE_QUALIFIER is a valid regex pattern")
});

/// Canonical spelling of a column type, so that backend synonyms compare equal.
///
/// Lowercases, drops length/precision qualifiers and folds synonyms.
/// `normalize_type(normalize_type(t)) == normalize_type(t)` for every `t`.
pub fn normalize_type(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let stripped = TYPE_QUALIFIER.replace_all(&lowered, "");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let canonical = match collapsed.as_str() {
        "int4" | "int" | "integer" | "mediumint" | "serial" | "serial4" => "integer",
        "int8" | "bigint" | "bigserial" | "serial8" => "bigint",
        "int2" | "smallint" | "smallserial" => "smallint",
        "varchar" | "character varying" | "nvarchar" => "character varying",
        "bpchar" | "char" | "character" | "nchar" => "character",
        "bool" | "boolean" | "bit" => "boolean",
        "float8" | "double" | "double precision" => "double precision",
        "float4" | "real" => "real",
        "timestamptz" => "timestamp with time zone",
        "datetime" | "datetime2" | "timestamp" => "timestamp without time zone",
        "decimal" | "numeric" => "numeric",
        "text" | "ntext" | "longtext" | "mediumtext" => "text",
        other => return other.to_string(),
    };
    canonical.to_string()
}

/// Compare two table sets.
///
/// Tables only in `source` are `removed`, tables only in `target` are `added`.
/// Swapping the arguments swaps those two statuses and nothing else.
pub fn compare_schemas(source: &[TableSchema], target: &[TableSchema]) -> SchemaDiff {
    let source_tables: BTreeMap<&str, &TableSchema> =
        source.iter().map(|t| (t.name.as_str(), t)).collect();
    let target_tables: BTreeMap<&str, &TableSchema> =
        target.iter().map(|t| (t.name.as_str(), t)).collect();
    let names: BTreeSet<&str> = source_tables
        .keys()
        .chain(target_tables.keys())
        .copied()
        .collect();

    let mut summary = DiffSummary::default();
    let mut tables = Vec::with_capacity(names.len());

    for name in names {
        let table = match (source_tables.get(name), target_tables.get(name)) {
            (Some(_), None) => whole_table(name, DiffStatus::Removed),
            (None, Some(_)) => whole_table(name, DiffStatus::Added),
            (Some(src), Some(tgt)) => compare_table(src, tgt),
            (None, None) => continue,
        };
        match table.status {
            DiffStatus::Added => summary.added += 1,
            DiffStatus::Removed => summary.removed += 1,
            DiffStatus::Modified => summary.modified += 1,
            DiffStatus::Unchanged => summary.unchanged += 1,
        }
        tables.push(table);
    }

    SchemaDiff {
        source_connection: String::new(),
        target_connection: String::new(),
        tables,
        summary,
    }
}

fn whole_table(name: &str, status: DiffStatus) -> TableDiff {
    TableDiff {
        table_name: name.to_string(),
        status,
        column_diffs: Vec::new(),
        index_diffs: Vec::new(),
    }
}

fn compare_table(source: &TableSchema, target: &TableSchema) -> TableDiff {
    let column_diffs = diff_by_name(
        &source.columns,
        &target.columns,
        |c| c.name.as_str(),
        column_changes,
    )
    .into_iter()
    .map(|(name, status, changes, source, target)| ColumnDiff {
        column_name: name,
        status,
        changes,
        source,
        target,
    })
    .collect::<Vec<_>>();

    let index_diffs = diff_by_name(
        &source.indexes,
        &target.indexes,
        |i| i.name.as_str(),
        index_changes,
    )
    .into_iter()
    .map(|(name, status, changes, source, target)| IndexDiff {
        index_name: name,
        status,
        changes,
        source,
        target,
    })
    .collect::<Vec<_>>();

    let status = if column_diffs.is_empty() && index_diffs.is_empty() {
        DiffStatus::Unchanged
    } else {
        DiffStatus::Modified
    };

    TableDiff {
        table_name: source.name.clone(),
        status,
        column_diffs,
        index_diffs,
    }
}

type Entry<T> = (String, DiffStatus, Vec<String>, Option<T>, Option<T>);

/// Pair items by name and keep only those that differ, ordered by name.
fn diff_by_name<T: Clone>(
    source: &[T],
    target: &[T],
    name: impl Fn(&T) -> &str,
    changes: impl Fn(&T, &T) -> Vec<String>,
) -> Vec<Entry<T>> {
    let source_items: BTreeMap<&str, &T> = source.iter().map(|i| (name(i), i)).collect();
    let target_items: BTreeMap<&str, &T> = target.iter().map(|i| (name(i), i)).collect();
    let names: BTreeSet<&str> = source_items
        .keys()
        .chain(target_items.keys())
        .copied()
        .collect();

    names
        .into_iter()
        .filter_map(|key| {
            let src = source_items.get(key).copied();
            let tgt = target_items.get(key).copied();
            let (status, diffs) = match (src, tgt) {
                (Some(_), None) => (DiffStatus::Removed, Vec::new()),
                (None, Some(_)) => (DiffStatus::Added, Vec::new()),
                (Some(s), Some(t)) => {
                    let diffs = changes(s, t);
                    if diffs.is_empty() {
                        return None;
                    }
                    (DiffStatus::Modified, diffs)
                }
                (None, None) => return None,
            };
            Some((key.to_string(), status, diffs, src.cloned(), tgt.cloned()))
        })
        .collect()
}

fn column_changes(source: &ColumnSchema, target: &ColumnSchema) -> Vec<String> {
    let mut changes = Vec::new();
    let (source_type, target_type) = (normalize_type(&source.data_type), normalize_type(&target.data_type));
    if source_type != target_type {
        changes.push(format!("type: {} -> {}", source.data_type, target.data_type));
    }
    if source.nullable != target.nullable {
        changes.push(format!("nullable: {} -> {}", source.nullable, target.nullable));
    }
    if source.default != target.default {
        changes.push(format!(
            "default: {} -> {}",
            source.default.as_deref().unwrap_or("none"),
            target.default.as_deref().unwrap_or("none")
        ));
    }
    changes
}

fn index_changes(source: &IndexSchema, target: &IndexSchema) -> Vec<String> {
    let mut changes = Vec::new();
    if source.columns != target.columns {
        changes.push(format!(
            "columns: ({}) -> ({})",
            source.columns.join(", "),
            target.columns.join(", ")
        ));
    }
    if source.unique != target.unique {
        changes.push(format!("unique: {} -> {}", source.unique, target.unique));
    }
    changes
}

// =============================================================================
// Migration Script
// =============================================================================

/// Statements that move the source schema towards the target schema.
///
/// Best effort: whole tables and unsupported alterations become SQL comments.
pub fn generate_migration_script(diff: &SchemaDiff, dialect: &Dialect) -> Vec<String> {
    let mut statements = Vec::new();

    for table in &diff.tables {
        let quoted = dialect.quote_ident(&table.table_name);
        match table.status {
            DiffStatus::Added => statements.push(format!(
                "-- CREATE TABLE {quoted}: table exists only in target; define it manually"
            )),
            DiffStatus::Removed => statements.push(format!(
                "-- DROP TABLE {quoted}: table exists only in source; review before dropping"
            )),
            DiffStatus::Unchanged => {}
            DiffStatus::Modified => {
                for column in &table.column_diffs {
                    statements.extend(column_statements(dialect, &quoted, column));
                }
                for index in &table.index_diffs {
                    statements.extend(index_statements(dialect, &quoted, index));
                }
            }
        }
    }
    statements
}

fn column_definition(dialect: &Dialect, column: &ColumnSchema) -> String {
    let mut definition = format!("{} {}", dialect.quote_ident(&column.name), column.data_type);
    definition.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
    if let Some(default) = &column.default {
        definition.push_str(&format!(" DEFAULT {default}"));
    }
    definition
}

fn column_statements(dialect: &Dialect, table: &str, diff: &ColumnDiff) -> Vec<String> {
    let column = dialect.quote_ident(&diff.column_name);
    match (diff.status, &diff.target) {
        (DiffStatus::Added, Some(target)) => {
            let keyword = if matches!(dialect, Dialect::MsSql) { "ADD" } else { "ADD COLUMN" };
            vec![format!(
                "ALTER TABLE {table} {keyword} {};",
                column_definition(dialect, target)
            )]
        }
        (DiffStatus::Removed, _) => vec![format!("ALTER TABLE {table} DROP COLUMN {column};")],
        (DiffStatus::Modified, Some(target)) => {
            let Some(source) = &diff.source else {
                return Vec::new();
            };
            alter_column(dialect, table, &column, source, target)
        }
        _ => Vec::new(),
    }
}

fn alter_column(
    dialect: &Dialect,
    table: &str,
    column: &str,
    source: &ColumnSchema,
    target: &ColumnSchema,
) -> Vec<String> {
    match dialect {
        Dialect::MySql => vec![format!(
            "ALTER TABLE {table} MODIFY COLUMN {};",
            column_definition(dialect, target)
        )],
        Dialect::MsSql => {
            let mut statements = Vec::new();
            if normalize_type(&source.data_type) != normalize_type(&target.data_type)
                || source.nullable != target.nullable
            {
                let null = if target.nullable { "NULL" } else { "NOT NULL" };
                statements.push(format!(
                    "ALTER TABLE {table} ALTER COLUMN {column} {} {null};",
                    target.data_type
                ));
            }
            if source.default != target.default {
                statements.push(format!(
                    "-- default of {column} on {table} changed; SQL Server defaults are named constraints"
                ));
            }
            statements
        }
        Dialect::Sqlite => vec![format!(
            "-- SQLite cannot alter column {column} on {table}; rebuild the table"
        )],
        Dialect::Postgres | Dialect::Unknown(_) => {
            let mut statements = Vec::new();
            if normalize_type(&source.data_type) != normalize_type(&target.data_type) {
                statements.push(format!(
                    "ALTER TABLE {table} ALTER COLUMN {column} TYPE {};",
                    target.data_type
                ));
            }
            if source.nullable != target.nullable {
                let action = if target.nullable { "DROP NOT NULL" } else { "SET NOT NULL" };
                statements.push(format!("ALTER TABLE {table} ALTER COLUMN {column} {action};"));
            }
            if source.default != target.default {
                statements.push(match &target.default {
                    Some(default) => {
                        format!("ALTER TABLE {table} ALTER COLUMN {column} SET DEFAULT {default};")
                    }
                    None => format!("ALTER TABLE {table} ALTER COLUMN {column} DROP DEFAULT;"),
                });
            }
            statements
        }
    }
}

fn drop_index(dialect: &Dialect, table: &str, index: &str) -> String {
    match dialect {
        Dialect::MySql | Dialect::MsSql => format!("DROP INDEX {index} ON {table};"),
        _ => format!("DROP INDEX {index};"),
    }
}

fn create_index(dialect: &Dialect, table: &str, index: &IndexSchema) -> String {
    let columns = index
        .columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let unique = if index.unique { "UNIQUE " } else { "" };
    format!(
        "CREATE {unique}INDEX {} ON {table} ({columns});",
        dialect.quote_ident(&index.name)
    )
}

fn index_statements(dialect: &Dialect, table: &str, diff: &IndexDiff) -> Vec<String> {
    let name = dialect.quote_ident(&diff.index_name);
    match (diff.status, &diff.target) {
        (DiffStatus::Added, Some(target)) => vec![create_index(dialect, table, target)],
        (DiffStatus::Removed, _) => vec![drop_index(dialect, table, &name)],
        (DiffStatus::Modified, Some(target)) => vec![
            drop_index(dialect, table, &name),
            create_index(dialect, table, target),
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(email_type: &str) -> TableSchema {
        TableSchema::new("users")
            .with_column(ColumnSchema::new("id", "int4", false))
            .with_column(ColumnSchema::new("email", email_type, true))
            .with_index(IndexSchema::new("users_pkey", &["id"], true))
    }

    #[test]
    fn test_normalize_type_folds_synonyms() {
        assert_eq!(normalize_type("INT4"), "integer");
        assert_eq!(normalize_type("INT(11)"), "integer");
        assert_eq!(normalize_type("varchar(255)"), "character varying");
        assert_eq!(normalize_type("NUMERIC(10, 2)"), "numeric");
        assert_eq!(normalize_type("timestamptz"), "timestamp with time zone");
        assert_eq!(normalize_type("DATETIME2(7)"), "timestamp without time zone");
        assert_eq!(normalize_type("uuid"), "uuid");
    }

    #[test]
    fn test_normalize_type_is_idempotent() {
        for raw in [
            "INT4", "bigserial", "nvarchar(50)", "bpchar", "bit", "float8", "real",
            "timestamptz", "timestamp", "decimal(5,1)", "longtext", "jsonb",
        ] {
            let once = normalize_type(raw);
            assert_eq!(normalize_type(&once), once, "not idempotent for {raw}");
        }
    }

    #[test]
    fn test_compare_identical_schemas() {
        let diff = compare_schemas(&[users("text")], &[users("TEXT")]);
        assert_eq!(diff.summary.unchanged, 1);
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_compare_detects_each_attribute() {
        let source = users("varchar(100)");
        let mut target = users("text");
        target.columns[1].nullable = false;
        target.columns[1].default = Some("''".into());
        target.indexes[0].unique = false;

        let diff = compare_schemas(&[source], &[target]);
        let table = diff.table("users").unwrap();
        assert_eq!(table.status, DiffStatus::Modified);
        assert_eq!(table.column_diffs.len(), 1);
        assert_eq!(table.column_diffs[0].changes.len(), 3);
        assert_eq!(table.index_diffs[0].changes, vec!["unique: true -> false"]);
    }

    #[test]
    fn test_compare_orders_tables_and_counts() {
        let source = vec![TableSchema::new("zeta"), users("text")];
        let target = vec![users("text"), TableSchema::new("alpha")];
        let diff = compare_schemas(&source, &target);

        let names: Vec<_> = diff.tables.iter().map(|t| t.table_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "users", "zeta"]);
        assert_eq!(diff.table("alpha").unwrap().status, DiffStatus::Added);
        assert_eq!(diff.table("zeta").unwrap().status, DiffStatus::Removed);
        assert_eq!(diff.summary.added, 1);
        assert_eq!(diff.summary.removed, 1);
        assert_eq!(diff.summary.unchanged, 1);
    }

    #[test]
    fn test_migration_script_per_dialect() {
        let source = users("varchar(100)");
        let target = users("text")
            .with_column(ColumnSchema::new("age", "integer", true))
            .with_index(IndexSchema::new("users_email_idx", &["email"], false));
        let diff = compare_schemas(&[source], &[target]);

        let pg = generate_migration_script(&diff, &Dialect::Postgres);
        assert!(pg.contains(&r#"ALTER TABLE "users" ADD COLUMN "age" integer NULL;"#.to_string()));
        assert!(pg.contains(&r#"ALTER TABLE "users" ALTER COLUMN "email" TYPE text;"#.to_string()));
        assert!(pg.contains(
            &r#"CREATE INDEX "users_email_idx" ON "users" ("email");"#.to_string()
        ));

        let mysql = generate_migration_script(&diff, &Dialect::MySql);
        assert!(mysql.iter().any(|s| s.starts_with("ALTER TABLE `users` MODIFY COLUMN `email` text")));

        let mssql = generate_migration_script(&diff, &Dialect::MsSql);
        assert!(mssql.contains(&"ALTER TABLE [users] ADD [age] integer NULL;".to_string()));
        assert!(mssql.contains(&"ALTER TABLE [users] ALTER COLUMN [email] text NULL;".to_string()));

        let sqlite = generate_migration_script(&diff, &Dialect::Sqlite);
        assert!(sqlite.iter().any(|s| s.starts_with("-- SQLite cannot alter column")));
    }

    #[test]
    fn test_migration_script_whole_tables_are_comments() {
        let diff = compare_schemas(&[TableSchema::new("old")], &[TableSchema::new("new")]);
        let script = generate_migration_script(&diff, &Dialect::Postgres);
        assert_eq!(script.len(), 2);
        assert!(script.iter().all(|s| s.starts_with("--")));
    }
}
