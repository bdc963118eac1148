//! Query execution and driver routing.
//!
//! This module provides:
//! - [`DbClient`], one live backend connection (dedicated or checked out of a pool)
//! - [`QueryRouter`], which classifies a descriptor and runs a statement on the right backend
//! - Row-limit injection for unbounded SELECT statements
//!
//! # Architecture
//!
//! The executor uses backend-specific implementations organized in submodules:
//! - `postgres`, `mysql`, `sqlite`: sqlx raw statements, streamed into rows and row counts
//! - `mssql`: tiberius simple queries for row sets, `execute` for DML row counts
//!
//! Each submodule produces the same [`QueryResult`] shape. Every backend call is
//! bounded by the configured timeout, and every connection is either released
//! to its pool or closed on the way out.

use crate::db::dialect::{Dialect, NATIVE_DRIVERS};
use crate::db::fallback::CliFallback;
use crate::db::options::{self, ConnectionContext};
use crate::db::pool::PoolManager;
use crate::db::types::RowToValues;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{ConnectionDescriptor, QueryResult};
use crate::tools::guard::leading_keyword;
use crate::tools::redact::redact_text;
use bb8_tiberius::ConnectionManager;
use regex::Regex;
use sqlx::mysql::MySqlConnection;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgConnection;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, Database, MySql, Postgres};
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tiberius::Client;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

pub type MssqlClient = Client<Compat<TcpStream>>;
pub type MssqlPool = bb8::Pool<ConnectionManager>;

/// Upper bound for closing a connection during cleanup.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a backend future under `limit`, mapping expiry to a timeout error.
pub(crate) async fn bounded<T, F>(
    limit: Duration,
    operation: impl FnOnce() -> String,
    fut: F,
) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::timeout(operation(), limit)),
    }
}

// =============================================================================
// Connection Handles
// =============================================================================

/// A sqlx connection owned outright or checked out of a pool.
pub enum Handle<DB: Database> {
    Dedicated(DB::Connection),
    Pooled(PoolConnection<DB>),
}

impl<DB: Database> Handle<DB> {
    fn conn(&mut self) -> &mut DB::Connection {
        match self {
            Handle::Dedicated(conn) => conn,
            Handle::Pooled(conn) => &mut **conn,
        }
    }

    /// Close the underlying connection. Pooled connections are detached first
    /// so a broken session never goes back to the pool.
    async fn close(self) -> Result<(), sqlx::Error> {
        match self {
            Handle::Dedicated(conn) => conn.close().await,
            Handle::Pooled(conn) => conn.detach().close().await,
        }
    }
}

pub enum MssqlHandle {
    Dedicated(MssqlClient),
    Pooled(bb8::PooledConnection<'static, ConnectionManager>),
    /// Built by the pool's manager but never returned to it. The permit
    /// counts against the pool's transaction slots until the client closes.
    Reserved(MssqlClient, OwnedSemaphorePermit),
}

impl MssqlHandle {
    fn client(&mut self) -> &mut MssqlClient {
        match self {
            MssqlHandle::Dedicated(client) | MssqlHandle::Reserved(client, _) => client,
            MssqlHandle::Pooled(client) => &mut **client,
        }
    }
}

/// One live backend connection.
pub enum DbClient {
    Postgres(Handle<Postgres>),
    MySql(Handle<MySql>),
    /// SQLite has no pool; every client owns its file handle.
    Sqlite(SqliteConnection),
    MsSql(MssqlHandle),
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            DbClient::Postgres(_) => "Postgres",
            DbClient::MySql(_) => "MySql",
            DbClient::Sqlite(_) => "Sqlite",
            DbClient::MsSql(_) => "MsSql",
        };
        f.debug_tuple("DbClient").field(&variant).finish()
    }
}

impl DbClient {
    /// Open an ad hoc connection for a native dialect.
    pub async fn connect(
        descriptor: &ConnectionDescriptor,
        dialect: &Dialect,
        ctx: &ConnectionContext,
    ) -> GatewayResult<Self> {
        match dialect {
            Dialect::Postgres => {
                let opts = options::postgres_options(descriptor)?;
                let conn = PgConnection::connect_with(&opts)
                    .await
                    .map_err(|e| GatewayError::from_sqlx(ctx, e))?;
                Ok(DbClient::Postgres(Handle::Dedicated(conn)))
            }
            Dialect::MySql => {
                let opts = options::mysql_options(descriptor)?;
                let conn = MySqlConnection::connect_with(&opts)
                    .await
                    .map_err(|e| GatewayError::from_sqlx(ctx, e))?;
                Ok(DbClient::MySql(Handle::Dedicated(conn)))
            }
            Dialect::Sqlite => {
                let opts = options::sqlite_options(descriptor)?;
                let conn = SqliteConnection::connect_with(&opts)
                    .await
                    .map_err(|e| GatewayError::from_sqlx(ctx, e))?;
                Ok(DbClient::Sqlite(conn))
            }
            Dialect::MsSql => {
                let client = connect_mssql(descriptor, ctx).await?;
                Ok(DbClient::MsSql(MssqlHandle::Dedicated(client)))
            }
            Dialect::Unknown(driver) => Err(GatewayError::unsupported_driver(
                driver.as_str(),
                NATIVE_DRIVERS,
                "no native adapter can open this connection",
            )),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            DbClient::Postgres(_) => Dialect::Postgres,
            DbClient::MySql(_) => Dialect::MySql,
            DbClient::Sqlite(_) => Dialect::Sqlite,
            DbClient::MsSql(_) => Dialect::MsSql,
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(
            self,
            DbClient::Postgres(Handle::Pooled(_))
                | DbClient::MySql(Handle::Pooled(_))
                | DbClient::MsSql(MssqlHandle::Pooled(_))
        )
    }

    /// Run one statement (or batch) and collect its result.
    pub async fn run(
        &mut self,
        sql: &str,
        ctx: &ConnectionContext,
        limit: Duration,
    ) -> GatewayResult<QueryResult> {
        debug!(
            connection_id = %ctx.connection_id,
            driver = %ctx.driver,
            sql = %sql,
            "Executing statement"
        );
        let operation = || format!("statement on '{}'", ctx.connection_id);
        match self {
            DbClient::Postgres(handle) => {
                bounded(limit, operation, async {
                    postgres::run(handle.conn(), sql)
                        .await
                        .map_err(|e| GatewayError::from_sqlx(ctx, e))
                })
                .await
            }
            DbClient::MySql(handle) => {
                bounded(limit, operation, async {
                    mysql::run(handle.conn(), sql)
                        .await
                        .map_err(|e| GatewayError::from_sqlx(ctx, e))
                })
                .await
            }
            DbClient::Sqlite(conn) => {
                bounded(limit, operation, async {
                    sqlite::run(conn, sql)
                        .await
                        .map_err(|e| GatewayError::from_sqlx(ctx, e))
                })
                .await
            }
            DbClient::MsSql(handle) => {
                bounded(limit, operation, async {
                    mssql::run(handle.client(), sql)
                        .await
                        .map_err(|e| GatewayError::from_tiberius(ctx, e))
                })
                .await
            }
        }
    }

    /// Run a control statement (BEGIN, COMMIT, ROLLBACK) without collecting rows.
    pub async fn run_control(
        &mut self,
        sql: &str,
        ctx: &ConnectionContext,
        limit: Duration,
    ) -> GatewayResult<()> {
        match self {
            // T-SQL transaction statements must not go through sp_executesql
            DbClient::MsSql(handle) => {
                bounded(
                    limit,
                    || format!("{sql} on '{}'", ctx.connection_id),
                    async {
                        mssql::run_batch(handle.client(), sql)
                            .await
                            .map_err(|e| GatewayError::from_tiberius(ctx, e))
                    },
                )
                .await
            }
            _ => self.run(sql, ctx, limit).await.map(|_| ()),
        }
    }

    /// Close the connection outright, never returning it to a pool.
    pub async fn close(self) -> Result<(), String> {
        match self {
            DbClient::Postgres(handle) => handle.close().await.map_err(|e| e.to_string()),
            DbClient::MySql(handle) => handle.close().await.map_err(|e| e.to_string()),
            DbClient::Sqlite(conn) => conn.close().await.map_err(|e| e.to_string()),
            DbClient::MsSql(MssqlHandle::Dedicated(client)) => {
                client.close().await.map_err(|e| e.to_string())
            }
            DbClient::MsSql(MssqlHandle::Reserved(client, permit)) => {
                let closed = client.close().await.map_err(|e| e.to_string());
                drop(permit);
                closed
            }
            // bb8 cannot detach; the pool re-validates the connection on its next checkout
            DbClient::MsSql(MssqlHandle::Pooled(conn)) => {
                drop(conn);
                Ok(())
            }
        }
    }

    /// Return a pooled connection to its pool, or close a dedicated one.
    pub async fn release(self, ctx: &ConnectionContext) {
        if self.is_pooled() {
            drop(self);
        } else {
            self.discard(ctx).await;
        }
    }

    /// Close the connection, logging a leak warning when that fails.
    pub async fn discard(self, ctx: &ConnectionContext) {
        let outcome = match tokio::time::timeout(CLOSE_TIMEOUT, self.close()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("close timed out after {}ms", CLOSE_TIMEOUT.as_millis())),
        };
        if let Err(e) = outcome {
            warn!(
                connection_id = %ctx.connection_id,
                driver = %ctx.driver,
                host = %ctx.host,
                database = %ctx.database,
                error = %redact_text(&e),
                "Failed to close database connection; it may have leaked"
            );
        }
    }
}

/// Open a raw SQL Server client outside any pool.
pub async fn connect_mssql(
    descriptor: &ConnectionDescriptor,
    ctx: &ConnectionContext,
) -> GatewayResult<MssqlClient> {
    let config = options::mssql_config(descriptor)?;
    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| GatewayError::backend(ctx, format!("Failed to connect: {e}"), None))?;
    tcp.set_nodelay(true).ok();
    Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| GatewayError::from_tiberius(ctx, e))
}

// =============================================================================
// Row Limit
// =============================================================================

static LIMIT_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(LIMIT|OFFSET|TOP|FETCH)\b").expect("LIMIT_CLAUSE is a valid regex pattern")
});

static UNLIMITABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bFOR\s+(UPDATE|SHARE|NO\s+KEY\s+UPDATE|KEY\s+SHARE)\b|\bINTO\b")
        .expect("UNLIMITABLE is a valid regex pattern")
});

static MSSQL_SELECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^SELECT(\s+DISTINCT)?\s+").expect("MSSQL_SELECT is a valid regex pattern")
});

/// Inject a row cap into an unbounded SELECT.
///
/// Returns the statement to run and the cap, if one was injected. The
/// statement fetches one row past the cap so the caller can tell a full page
/// from a truncated one. Statements that already page, lock rows, write via
/// `INTO`, or contain several statements are left alone.
pub fn apply_row_limit(sql: &str, dialect: &Dialect, max_rows: u32) -> (String, Option<u32>) {
    let keyword = leading_keyword(sql);
    let trimmed = sql
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    let eligible = max_rows > 0
        && (keyword == "SELECT" || keyword == "WITH")
        && !trimmed.contains(';')
        && !LIMIT_CLAUSE.is_match(trimmed)
        && !UNLIMITABLE.is_match(trimmed);
    if !eligible {
        return (sql.to_string(), None);
    }
    let fetch = max_rows.saturating_add(1);

    match dialect {
        Dialect::Postgres | Dialect::MySql | Dialect::Sqlite => {
            // A trailing line comment would swallow a same-line LIMIT
            let separator = match trimmed.rsplit('\n').next() {
                Some(last_line) if last_line.contains("--") => "\n",
                _ => " ",
            };
            (
                format!("{trimmed}{separator}LIMIT {fetch}"),
                Some(max_rows),
            )
        }
        Dialect::MsSql => match MSSQL_SELECT.find(trimmed) {
            Some(m) => {
                let head = m.as_str().trim_end();
                let rest = &trimmed[m.end()..];
                (format!("{head} TOP {fetch} {rest}"), Some(max_rows))
            }
            None => (sql.to_string(), None),
        },
        Dialect::Unknown(_) => (sql.to_string(), None),
    }
}

// =============================================================================
// Router
// =============================================================================

/// Routes statements to a native backend or the CLI fallback.
pub struct QueryRouter {
    pools: Arc<PoolManager>,
    fallback: Arc<dyn CliFallback>,
    query_timeout: Duration,
    max_rows: u32,
}

impl QueryRouter {
    pub fn new(
        pools: Arc<PoolManager>,
        fallback: Arc<dyn CliFallback>,
        query_timeout: Duration,
        max_rows: u32,
    ) -> Self {
        Self {
            pools,
            fallback,
            query_timeout,
            max_rows,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Run a statement on an ad hoc connection, with the row cap applied.
    pub async fn execute(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        self.route(descriptor, sql, false, true).await
    }

    /// Run a statement on a pooled connection where the dialect has a pool.
    pub async fn execute_pooled(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        self.route(descriptor, sql, true, true).await
    }

    /// Run a statement without injecting a row cap. Used for introspection.
    pub async fn execute_unlimited(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        self.route(descriptor, sql, false, false).await
    }

    async fn route(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
        pooled: bool,
        limit_rows: bool,
    ) -> GatewayResult<QueryResult> {
        let dialect = Dialect::classify(&descriptor.driver);
        if let Dialect::Unknown(driver) = &dialect {
            return self.run_fallback(descriptor, driver, sql).await;
        }

        let (sql, injected) = if limit_rows {
            apply_row_limit(sql, &dialect, self.max_rows)
        } else {
            (sql.to_string(), None)
        };

        let ctx = ConnectionContext::from_descriptor(descriptor);
        let mut client = if pooled && dialect.is_pooled() {
            self.checkout(descriptor, &ctx).await?
        } else {
            bounded(
                self.query_timeout,
                || format!("connect to '{}'", ctx.connection_id),
                DbClient::connect(descriptor, &dialect, &ctx),
            )
            .await?
        };

        let outcome = client.run(&sql, &ctx, self.query_timeout).await;
        match &outcome {
            // The session state is unknown after a cancelled call
            Err(GatewayError::Timeout { .. }) => client.discard(&ctx).await,
            _ => client.release(&ctx).await,
        }

        let mut result = outcome?;
        if let Some(limit) = injected {
            result.cap_rows(limit as usize);
        }
        Ok(result)
    }

    async fn checkout(
        &self,
        descriptor: &ConnectionDescriptor,
        ctx: &ConnectionContext,
    ) -> GatewayResult<DbClient> {
        match self.pools.get_pool(descriptor).await? {
            Some(pool) => pool.acquire(ctx).await,
            None => {
                let dialect = Dialect::classify(&descriptor.driver);
                DbClient::connect(descriptor, &dialect, ctx).await
            }
        }
    }

    async fn run_fallback(
        &self,
        descriptor: &ConnectionDescriptor,
        driver: &str,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        debug!(
            connection_id = %descriptor.id,
            driver = %driver,
            "No native adapter, trying CLI fallback"
        );
        match tokio::time::timeout(self.query_timeout, self.fallback.execute(descriptor, sql)).await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(GatewayError::unsupported_driver(
                driver,
                NATIVE_DRIVERS,
                redact_text(&e),
            )),
            Err(_) => Err(GatewayError::timeout(
                format!("CLI fallback for '{}'", descriptor.id),
                self.query_timeout,
            )),
        }
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

fn process_rows<R: RowToValues>(
    rows: &[R],
    rows_affected: Option<u64>,
    start: Instant,
) -> QueryResult {
    let columns = rows.first().map(|r| r.column_names()).unwrap_or_default();
    let values = rows.iter().map(|r| r.to_values()).collect();
    let mut result = QueryResult::new(columns, values);
    result.rows_affected = rows_affected;
    result.execution_time_ms = start.elapsed().as_millis() as u64;
    result
}

macro_rules! sqlx_backend {
    ($name:ident, $conn:ty) => {
        mod $name {
            use super::*;
            use futures_util::TryStreamExt;
            use sqlx::Either;

            pub async fn run(conn: &mut $conn, sql: &str) -> Result<QueryResult, sqlx::Error> {
                let start = Instant::now();
                let mut rows = Vec::new();
                let mut affected: Option<u64> = None;
                {
                    let mut stream = sqlx::raw_sql(sql).fetch_many(conn);
                    while let Some(item) = stream.try_next().await? {
                        match item {
                            Either::Left(done) => {
                                *affected.get_or_insert(0) += done.rows_affected();
                            }
                            Either::Right(row) => rows.push(row),
                        }
                    }
                }
                // Row-returning statements report the selected count, not a write count
                let affected = if rows.is_empty() { affected } else { None };
                Ok(process_rows(&rows, affected, start))
            }
        }
    };
}

sqlx_backend!(postgres, PgConnection);
sqlx_backend!(mysql, MySqlConnection);
sqlx_backend!(sqlite, SqliteConnection);

mod mssql {
    use super::*;

    static OUTPUT_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\bOUTPUT\b").expect("OUTPUT_CLAUSE is a valid regex pattern")
    });

    /// DML without an OUTPUT clause runs through `execute` to get row counts.
    fn reports_row_count(sql: &str) -> bool {
        let keyword = leading_keyword(sql);
        matches!(keyword.as_str(), "INSERT" | "UPDATE" | "DELETE" | "MERGE")
            && !OUTPUT_CLAUSE.is_match(sql)
            && !sql.trim().trim_end_matches(';').contains(';')
    }

    pub async fn run(
        client: &mut MssqlClient,
        sql: &str,
    ) -> Result<QueryResult, tiberius::error::Error> {
        let start = Instant::now();
        if reports_row_count(sql) {
            let result = client.execute(sql, &[]).await?;
            let affected = result.total();
            return Ok(process_rows::<tiberius::Row>(&[], Some(affected), start));
        }
        let sets = client.simple_query(sql).await?.into_results().await?;
        // Batches like SET STATISTICS ... ON; SELECT ...; yield several sets
        let rows = sets
            .into_iter()
            .rev()
            .find(|set| !set.is_empty())
            .unwrap_or_default();
        Ok(process_rows(&rows, None, start))
    }

    pub async fn run_batch(client: &mut MssqlClient, sql: &str) -> Result<(), tiberius::error::Error> {
        client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}
