//! SQL dialect classification.
//!
//! A descriptor's free-form `driver` string is classified exactly once into a
//! closed [`Dialect`]; everything downstream matches on the enum.

use serde::Serialize;

/// Driver names with a native adapter, reported in unsupported-driver errors.
pub const NATIVE_DRIVERS: &[&str] = &["postgres", "mysql", "mariadb", "mssql", "sqlserver", "sqlite"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    /// Includes MariaDB
    MySql,
    MsSql,
    Sqlite,
    /// No native adapter; routed to the CLI fallback.
    Unknown(String),
}

impl Dialect {
    /// Classify a driver name by case-insensitive substring match.
    pub fn classify(driver: &str) -> Self {
        let lower = driver.trim().to_lowercase();
        if lower.contains("postgres") || lower.starts_with("pg") {
            Self::Postgres
        } else if lower.contains("mysql") || lower.contains("mariadb") {
            Self::MySql
        } else if lower.contains("mssql")
            || lower.contains("sqlserver")
            || lower.contains("sql server")
            || lower.contains("tedious")
        {
            Self::MsSql
        } else if lower.contains("sqlite") {
            Self::Sqlite
        } else {
            Self::Unknown(driver.to_string())
        }
    }

    /// Get the display name for this dialect.
    pub fn display_name(&self) -> &str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::MsSql => "SQL Server",
            Self::Sqlite => "SQLite",
            Self::Unknown(driver) => driver,
        }
    }

    /// Get the default port for this dialect.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::MsSql => Some(1433),
            Self::Sqlite | Self::Unknown(_) => None,
        }
    }

    /// Default schema used for introspection when none is given.
    pub fn default_schema(&self) -> Option<&'static str> {
        match self {
            Self::Postgres => Some("public"),
            Self::MsSql => Some("dbo"),
            Self::Sqlite => Some("main"),
            // MySQL schemas are databases
            Self::MySql | Self::Unknown(_) => None,
        }
    }

    pub fn is_native(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    /// Whether connections are pooled for this dialect.
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Postgres | Self::MySql | Self::MsSql)
    }

    pub fn begin_statement(&self) -> &'static str {
        match self {
            Self::MySql => "START TRANSACTION",
            Self::MsSql => "BEGIN TRANSACTION",
            _ => "BEGIN",
        }
    }

    pub fn commit_statement(&self) -> &'static str {
        match self {
            Self::MsSql => "COMMIT TRANSACTION",
            _ => "COMMIT",
        }
    }

    pub fn rollback_statement(&self) -> &'static str {
        match self {
            Self::MsSql => "ROLLBACK TRANSACTION",
            _ => "ROLLBACK",
        }
    }

    /// Quote an identifier for this dialect.
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", name.replace('`', "``")),
            Self::MsSql => format!("[{}]", name.replace(']', "]]")),
            _ => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_drivers() {
        assert_eq!(Dialect::classify("postgres"), Dialect::Postgres);
        assert_eq!(Dialect::classify("PostgreSQL"), Dialect::Postgres);
        assert_eq!(Dialect::classify("pg"), Dialect::Postgres);
        assert_eq!(Dialect::classify("mysql"), Dialect::MySql);
        assert_eq!(Dialect::classify("MariaDB"), Dialect::MySql);
        assert_eq!(Dialect::classify("mssql"), Dialect::MsSql);
        assert_eq!(Dialect::classify("SQLServer"), Dialect::MsSql);
        assert_eq!(Dialect::classify("Microsoft SQL Server"), Dialect::MsSql);
        assert_eq!(Dialect::classify("sqlite3"), Dialect::Sqlite);
    }

    #[test]
    fn test_classify_unknown_keeps_driver_name() {
        assert_eq!(
            Dialect::classify("oracle"),
            Dialect::Unknown("oracle".to_string())
        );
        assert!(!Dialect::classify("clickhouse").is_native());
    }

    #[test]
    fn test_transaction_statements() {
        assert_eq!(Dialect::MsSql.begin_statement(), "BEGIN TRANSACTION");
        assert_eq!(Dialect::MySql.begin_statement(), "START TRANSACTION");
        assert_eq!(Dialect::Postgres.rollback_statement(), "ROLLBACK");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(Dialect::Postgres.quote_ident("user"), "\"user\"");
        assert_eq!(Dialect::MySql.quote_ident("order"), "`order`");
        assert_eq!(Dialect::MsSql.quote_ident("a]b"), "[a]]b]");
    }

    #[test]
    fn test_pooling() {
        assert!(Dialect::Postgres.is_pooled());
        assert!(Dialect::MsSql.is_pooled());
        assert!(!Dialect::Sqlite.is_pooled());
        assert!(!Dialect::Unknown("db2".into()).is_pooled());
    }
}
