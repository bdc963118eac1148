//! Per-call connection options.
//!
//! Builds backend connect options from a [`ConnectionDescriptor`], reading SSL
//! and credential settings from its properties. Unknown SSL tokens are a
//! configuration error rather than a silent downgrade.

use crate::db::dialect::Dialect;
use crate::error::{GatewayError, GatewayResult};
use crate::models::ConnectionDescriptor;
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use tiberius::{AuthMethod, EncryptionLevel};

const APPLICATION_NAME: &str = "db-gateway";

/// Identifying context attached to backend errors and leak warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub driver: String,
    pub host: String,
    pub database: String,
}

impl ConnectionContext {
    pub fn from_descriptor(descriptor: &ConnectionDescriptor) -> Self {
        let host = if descriptor.host.is_empty() {
            "local".to_string()
        } else {
            match descriptor.port {
                Some(port) => format!("{}:{}", descriptor.host, port),
                None => descriptor.host.clone(),
            }
        };
        Self {
            connection_id: descriptor.id.clone(),
            driver: descriptor.driver.clone(),
            host,
            database: descriptor.database.clone(),
        }
    }
}

fn host_or_default(descriptor: &ConnectionDescriptor) -> &str {
    if descriptor.host.is_empty() {
        "localhost"
    } else {
        &descriptor.host
    }
}

fn port_or_default(descriptor: &ConnectionDescriptor, dialect: &Dialect) -> u16 {
    descriptor
        .port
        .or_else(|| dialect.default_port())
        .unwrap_or_default()
}

fn parse_bool(key: &str, value: &str) -> GatewayResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(GatewayError::configuration(format!(
            "Invalid boolean '{other}' for property '{key}'"
        ))),
    }
}

/// Parse a Postgres `sslmode` token.
pub fn pg_ssl_mode(value: &str) -> GatewayResult<PgSslMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "disable" => Ok(PgSslMode::Disable),
        "allow" => Ok(PgSslMode::Allow),
        "prefer" => Ok(PgSslMode::Prefer),
        "require" => Ok(PgSslMode::Require),
        "verify-ca" | "verify_ca" => Ok(PgSslMode::VerifyCa),
        "verify-full" | "verify_full" => Ok(PgSslMode::VerifyFull),
        other => Err(GatewayError::configuration(format!(
            "Unknown Postgres sslmode '{other}' (expected disable, allow, prefer, require, verify-ca or verify-full)"
        ))),
    }
}

/// Parse a MySQL `ssl-mode` token.
pub fn mysql_ssl_mode(value: &str) -> GatewayResult<MySqlSslMode> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "disabled" | "disable" => Ok(MySqlSslMode::Disabled),
        "preferred" | "prefer" => Ok(MySqlSslMode::Preferred),
        "required" | "require" => Ok(MySqlSslMode::Required),
        "verify_ca" => Ok(MySqlSslMode::VerifyCa),
        "verify_identity" => Ok(MySqlSslMode::VerifyIdentity),
        other => Err(GatewayError::configuration(format!(
            "Unknown MySQL ssl-mode '{other}' (expected disabled, preferred, required, verify_ca or verify_identity)"
        ))),
    }
}

/// Parse an SQL Server `encrypt` token.
pub fn mssql_encryption(value: &str) -> GatewayResult<EncryptionLevel> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "required" | "mandatory" | "strict" => Ok(EncryptionLevel::Required),
        "on" => Ok(EncryptionLevel::On),
        "off" => Ok(EncryptionLevel::Off),
        "false" | "no" | "disabled" | "not_supported" => Ok(EncryptionLevel::NotSupported),
        other => Err(GatewayError::configuration(format!(
            "Unknown SQL Server encrypt value '{other}' (expected true, false, strict or off)"
        ))),
    }
}

pub fn postgres_options(descriptor: &ConnectionDescriptor) -> GatewayResult<PgConnectOptions> {
    let mut options = PgConnectOptions::new()
        .host(host_or_default(descriptor))
        .port(port_or_default(descriptor, &Dialect::Postgres))
        .application_name(APPLICATION_NAME);
    if !descriptor.user.is_empty() {
        options = options.username(&descriptor.user);
    }
    if !descriptor.database.is_empty() {
        options = options.database(&descriptor.database);
    }
    if let Some(password) = descriptor.password() {
        options = options.password(password);
    }
    if let Some(mode) = descriptor.property(&["sslmode", "ssl-mode", "ssl_mode"]) {
        options = options.ssl_mode(pg_ssl_mode(mode)?);
    }
    Ok(options)
}

pub fn mysql_options(descriptor: &ConnectionDescriptor) -> GatewayResult<MySqlConnectOptions> {
    let mut options = MySqlConnectOptions::new()
        .host(host_or_default(descriptor))
        .port(port_or_default(descriptor, &Dialect::MySql))
        .charset("utf8mb4");
    if !descriptor.user.is_empty() {
        options = options.username(&descriptor.user);
    }
    if !descriptor.database.is_empty() {
        options = options.database(&descriptor.database);
    }
    if let Some(password) = descriptor.password() {
        options = options.password(password);
    }
    if let Some(mode) = descriptor.property(&["ssl-mode", "sslmode", "ssl_mode"]) {
        options = options.ssl_mode(mysql_ssl_mode(mode)?);
    }
    Ok(options)
}

/// SQLite options. `database` is the file path; `:memory:` opens a private in-memory database.
pub fn sqlite_options(descriptor: &ConnectionDescriptor) -> GatewayResult<SqliteConnectOptions> {
    let path = descriptor.database.trim();
    if path.is_empty() {
        return Err(GatewayError::configuration(format!(
            "SQLite connection '{}' requires a database file path",
            descriptor.id
        )));
    }
    let options = if path == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| GatewayError::configuration(e.to_string()))?
    } else {
        let create = match descriptor.property(&["create_if_missing"]) {
            Some(v) => parse_bool("create_if_missing", v)?,
            None => true,
        };
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
    };
    let read_only = match descriptor.property(&["read_only", "mode"]) {
        Some(v) if v.eq_ignore_ascii_case("ro") => true,
        Some(v) if v.eq_ignore_ascii_case("rw") || v.eq_ignore_ascii_case("rwc") => false,
        Some(v) => parse_bool("read_only", v)?,
        None => false,
    };
    Ok(options.read_only(read_only))
}

/// SQL Server (TDS) client configuration.
pub fn mssql_config(descriptor: &ConnectionDescriptor) -> GatewayResult<tiberius::Config> {
    let mut config = tiberius::Config::new();
    config.host(host_or_default(descriptor));
    config.port(port_or_default(descriptor, &Dialect::MsSql));
    config.application_name(APPLICATION_NAME);
    config.authentication(AuthMethod::sql_server(
        &descriptor.user,
        descriptor.password().unwrap_or_default(),
    ));
    if !descriptor.database.is_empty() {
        config.database(&descriptor.database);
    }
    let encryption = match descriptor.property(&["encrypt", "encryption"]) {
        Some(value) => mssql_encryption(value)?,
        None => EncryptionLevel::Required,
    };
    config.encryption(encryption);
    let trust = match descriptor.property(&["trustServerCertificate", "trust_server_certificate"]) {
        Some(value) => parse_bool("trustServerCertificate", value)?,
        None => false,
    };
    if trust {
        config.trust_cert();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_ssl_modes() {
        assert!(matches!(pg_ssl_mode("require"), Ok(PgSslMode::Require)));
        assert!(matches!(pg_ssl_mode("VERIFY-FULL"), Ok(PgSslMode::VerifyFull)));
        assert!(matches!(
            pg_ssl_mode("sometimes"),
            Err(GatewayError::Configuration { .. })
        ));
    }

    #[test]
    fn test_mysql_ssl_modes() {
        assert!(matches!(mysql_ssl_mode("REQUIRED"), Ok(MySqlSslMode::Required)));
        assert!(matches!(
            mysql_ssl_mode("verify-identity"),
            Ok(MySqlSslMode::VerifyIdentity)
        ));
        assert!(mysql_ssl_mode("maybe").is_err());
    }

    #[test]
    fn test_mssql_encryption_levels() {
        assert!(matches!(mssql_encryption("true"), Ok(EncryptionLevel::Required)));
        assert!(matches!(mssql_encryption("strict"), Ok(EncryptionLevel::Required)));
        assert!(matches!(mssql_encryption("false"), Ok(EncryptionLevel::NotSupported)));
        assert!(matches!(mssql_encryption("off"), Ok(EncryptionLevel::Off)));
        assert!(mssql_encryption("sometimes").is_err());
    }

    #[test]
    fn test_invalid_sslmode_property_is_configuration_error() {
        let descriptor = ConnectionDescriptor::new("db1", "postgres")
            .with_host("localhost", None)
            .with_property("sslmode", "bogus");
        assert!(matches!(
            postgres_options(&descriptor),
            Err(GatewayError::Configuration { .. })
        ));
    }

    #[test]
    fn test_sqlite_requires_path() {
        let descriptor = ConnectionDescriptor::new("local", "sqlite");
        assert!(sqlite_options(&descriptor).is_err());
        let descriptor = descriptor.with_database(":memory:");
        assert!(sqlite_options(&descriptor).is_ok());
    }

    #[test]
    fn test_context_formats_host_and_port() {
        let descriptor = ConnectionDescriptor::new("db1", "mysql")
            .with_host("db.internal", Some(3307))
            .with_database("sales");
        let ctx = ConnectionContext::from_descriptor(&descriptor);
        assert_eq!(ctx.host, "db.internal:3307");
        assert_eq!(ctx.database, "sales");
        assert_eq!(ctx.driver, "mysql");
    }
}
