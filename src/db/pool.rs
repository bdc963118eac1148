//! Connection pool management.
//!
//! One pool per connection id, created lazily on first use.
//!
//! # Design
//!
//! - **`OnceCell` per connection id**: an uninitialized cell marks a creation in
//!   flight, so concurrent callers for the same id all await one creation
//! - **Registry lock never held across backend I/O**: the cell is cloned out of
//!   the map before the pool is built
//! - **Injectable factory**: pool construction goes through a [`PoolFactory`] so
//!   the registry can be exercised without a live server
//!
//! SQLite and drivers without a native adapter are never pooled; `get_pool`
//! returns `None` for them and callers open dedicated connections instead.

use crate::db::dialect::Dialect;
use crate::db::executor::{DbClient, Handle, MssqlHandle, MssqlPool};
use crate::db::options::{self, ConnectionContext};
use crate::error::{GatewayError, GatewayResult};
use crate::models::ConnectionDescriptor;
use bb8_tiberius::ConnectionManager;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock, Semaphore};
use tracing::{debug, info, warn};

/// Pool sizing and timeouts applied to every native pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    pub min: u32,
    pub max: u32,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            idle_timeout_ms: 600_000,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Backend-specific connection pool.
#[derive(Clone)]
pub enum NativePool {
    Postgres(PgPool),
    MySql(MySqlPool),
    MsSql(MssqlPool),
}

impl NativePool {
    pub fn dialect(&self) -> Dialect {
        match self {
            NativePool::Postgres(_) => Dialect::Postgres,
            NativePool::MySql(_) => Dialect::MySql,
            NativePool::MsSql(_) => Dialect::MsSql,
        }
    }

    /// Close the pool. bb8 has no close; its connections go when the last handle drops.
    pub async fn close(&self) {
        match self {
            NativePool::Postgres(pool) => pool.close().await,
            NativePool::MySql(pool) => pool.close().await,
            NativePool::MsSql(_) => {}
        }
    }

    /// `(total, idle)` connection counts.
    fn counts(&self) -> (u32, u32) {
        match self {
            NativePool::Postgres(pool) => (pool.size(), pool.num_idle() as u32),
            NativePool::MySql(pool) => (pool.size(), pool.num_idle() as u32),
            NativePool::MsSql(pool) => {
                let state = pool.state();
                (state.connections, state.idle_connections)
            }
        }
    }
}

impl std::fmt::Debug for NativePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (total, idle) = self.counts();
        f.debug_struct("NativePool")
            .field("dialect", &self.dialect())
            .field("total", &total)
            .field("idle", &idle)
            .finish()
    }
}

/// A registered pool and the settings it was built with.
#[derive(Debug)]
pub struct ManagedPool {
    pub connection_id: String,
    pub pool: NativePool,
    pub settings: PoolSettings,
    pub created_at: DateTime<Utc>,
    /// Caps connections held outside the pool by SQL Server transactions.
    transaction_slots: Arc<Semaphore>,
}

impl ManagedPool {
    pub fn new(connection_id: impl Into<String>, pool: NativePool, settings: PoolSettings) -> Self {
        Self {
            connection_id: connection_id.into(),
            pool,
            settings,
            created_at: Utc::now(),
            transaction_slots: Arc::new(Semaphore::new(settings.max as usize)),
        }
    }

    /// Close the pool and refuse further transaction slots.
    pub async fn close(&self) {
        self.transaction_slots.close();
        self.pool.close().await;
    }

    /// Free transaction slots for connections held outside the pool.
    pub fn available_transaction_slots(&self) -> usize {
        self.transaction_slots.available_permits()
    }

    /// Connection for a transaction that must never go back to the pool.
    ///
    /// SQL Server connections are built by the pool's own manager and hold
    /// one of `settings.max` transaction slots until closed. sqlx pools can
    /// detach a broken connection later, so they hand out a regular checkout.
    pub async fn dedicated(&self, ctx: &ConnectionContext) -> GatewayResult<DbClient> {
        let NativePool::MsSql(pool) = &self.pool else {
            return self.acquire(ctx).await;
        };
        let limit = self.settings.acquire_timeout();
        let slot = tokio::time::timeout(limit, Arc::clone(&self.transaction_slots).acquire_owned())
            .await
            .map_err(|_| {
                GatewayError::timeout(
                    format!("transaction slot for '{}'", ctx.connection_id),
                    limit,
                )
            })?
            .map_err(|_| {
                GatewayError::resource(format!(
                    "connection pool for '{}' is closed",
                    ctx.connection_id
                ))
            })?;
        let client = tokio::time::timeout(limit, pool.dedicated_connection())
            .await
            .map_err(|_| {
                GatewayError::timeout(format!("connect to '{}'", ctx.connection_id), limit)
            })?
            .map_err(|e| GatewayError::from_bb8_tiberius(ctx, e))?;
        Ok(DbClient::MsSql(MssqlHandle::Reserved(client, slot)))
    }

    /// Check out one connection.
    pub async fn acquire(&self, ctx: &ConnectionContext) -> GatewayResult<DbClient> {
        match &self.pool {
            NativePool::Postgres(pool) => pool
                .acquire()
                .await
                .map(|conn| DbClient::Postgres(Handle::Pooled(conn)))
                .map_err(|e| GatewayError::from_sqlx(ctx, e)),
            NativePool::MySql(pool) => pool
                .acquire()
                .await
                .map(|conn| DbClient::MySql(Handle::Pooled(conn)))
                .map_err(|e| GatewayError::from_sqlx(ctx, e)),
            NativePool::MsSql(pool) => match pool.get_owned().await {
                Ok(conn) => Ok(DbClient::MsSql(MssqlHandle::Pooled(conn))),
                Err(bb8::RunError::User(e)) => Err(GatewayError::from_bb8_tiberius(ctx, e)),
                Err(bb8::RunError::TimedOut) => Err(GatewayError::timeout(
                    format!("connection pool acquire for '{}'", ctx.connection_id),
                    self.settings.acquire_timeout(),
                )),
            },
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (total, idle) = self.pool.counts();
        PoolStats {
            connection_id: self.connection_id.clone(),
            total,
            idle,
            active: total.saturating_sub(idle),
            // Neither sqlx nor bb8 exposes a waiter count
            waiting: 0,
        }
    }
}

/// Normalized pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub connection_id: String,
    pub total: u32,
    pub idle: u32,
    pub active: u32,
    pub waiting: u32,
}

/// A live pool, as reported by [`PoolManager::list_pools`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub connection_id: String,
    pub dialect: Dialect,
    pub settings: PoolSettings,
    pub created_at: DateTime<Utc>,
}

/// Builds a native pool for a descriptor.
pub type PoolFactory = Arc<
    dyn Fn(ConnectionDescriptor, PoolSettings) -> BoxFuture<'static, GatewayResult<NativePool>>
        + Send
        + Sync,
>;

/// The default factory: connects real sqlx and bb8 pools.
pub fn native_pool_factory() -> PoolFactory {
    Arc::new(|descriptor, settings| {
        Box::pin(async move { create_native_pool(&descriptor, settings).await })
    })
}

/// Create a connection pool for a pooled dialect.
pub async fn create_native_pool(
    descriptor: &ConnectionDescriptor,
    settings: PoolSettings,
) -> GatewayResult<NativePool> {
    let ctx = ConnectionContext::from_descriptor(descriptor);
    match Dialect::classify(&descriptor.driver) {
        Dialect::Postgres => {
            let options = options::postgres_options(descriptor)?;
            let pool = PgPoolOptions::new()
                .min_connections(settings.min)
                .max_connections(settings.max)
                .acquire_timeout(settings.acquire_timeout())
                .idle_timeout(Some(settings.idle_timeout()))
                .connect_with(options)
                .await
                .map_err(|e| GatewayError::from_sqlx(&ctx, e))?;
            Ok(NativePool::Postgres(pool))
        }
        Dialect::MySql => {
            let options = options::mysql_options(descriptor)?;
            let pool = MySqlPoolOptions::new()
                .min_connections(settings.min)
                .max_connections(settings.max)
                .acquire_timeout(settings.acquire_timeout())
                .idle_timeout(Some(settings.idle_timeout()))
                .connect_with(options)
                .await
                .map_err(|e| GatewayError::from_sqlx(&ctx, e))?;
            Ok(NativePool::MySql(pool))
        }
        Dialect::MsSql => {
            let config = options::mssql_config(descriptor)?;
            let pool = bb8::Pool::builder()
                .max_size(settings.max)
                .min_idle(Some(settings.min))
                .idle_timeout(Some(settings.idle_timeout()))
                .connection_timeout(settings.acquire_timeout())
                .build(ConnectionManager::new(config))
                .await
                .map_err(|e| GatewayError::from_bb8_tiberius(&ctx, e))?;
            Ok(NativePool::MsSql(pool))
        }
        other => Err(GatewayError::configuration(format!(
            "{} connections are not pooled",
            other.display_name()
        ))),
    }
}

/// Registry of pools keyed by connection id.
pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<OnceCell<Arc<ManagedPool>>>>>,
    settings: PoolSettings,
    factory: PoolFactory,
}

impl PoolManager {
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_factory(settings, native_pool_factory())
    }

    pub fn with_factory(settings: PoolSettings, factory: PoolFactory) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            settings,
            factory,
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    /// Get or create the pool for a descriptor.
    ///
    /// Returns `None` for dialects without pooling. Concurrent calls for the
    /// same id wait on a single creation.
    pub async fn get_pool(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> GatewayResult<Option<Arc<ManagedPool>>> {
        let dialect = Dialect::classify(&descriptor.driver);
        if !dialect.is_pooled() {
            return Ok(None);
        }
        let id = descriptor.id.as_str();

        let cell = {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(id) {
                Arc::clone(cell)
            } else {
                drop(pools);
                let mut pools = self.pools.write().await;
                // Double-check after acquiring write lock
                Arc::clone(
                    pools
                        .entry(id.to_string())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        let created = cell
            .get_or_try_init(|| async {
                info!(connection_id = %id, dialect = %dialect, "Creating connection pool");
                let pool = (self.factory)(descriptor.clone(), self.settings).await?;
                Ok::<_, GatewayError>(Arc::new(ManagedPool::new(id, pool, self.settings)))
            })
            .await;

        let pool = match created {
            Ok(pool) => Arc::clone(pool),
            Err(e) => {
                self.forget_uninitialized(id, &cell).await;
                return Err(e);
            }
        };

        // A close_pool that ran while the pool was being built removed the cell
        let registered = {
            let pools = self.pools.read().await;
            pools.get(id).is_some_and(|current| Arc::ptr_eq(current, &cell))
        };
        if !registered {
            warn!(connection_id = %id, "Pool was closed while being created");
            pool.close().await;
            return Err(GatewayError::resource(format!(
                "connection pool for '{id}' was closed while being created"
            )));
        }

        debug!(connection_id = %id, "Returning connection pool");
        Ok(Some(pool))
    }

    /// Drop a cell whose creation failed, so the next caller starts fresh.
    async fn forget_uninitialized(&self, id: &str, cell: &Arc<OnceCell<Arc<ManagedPool>>>) {
        let mut pools = self.pools.write().await;
        if pools
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && current.get().is_none())
        {
            pools.remove(id);
        }
    }

    pub async fn get_stats(&self, connection_id: &str) -> Option<PoolStats> {
        let pools = self.pools.read().await;
        pools
            .get(connection_id)
            .and_then(|cell| cell.get())
            .map(|pool| pool.stats())
    }

    /// Close and unregister one pool. Returns whether a live pool was closed.
    pub async fn close_pool(&self, connection_id: &str) -> bool {
        let removed = {
            let mut pools = self.pools.write().await;
            pools.remove(connection_id)
        };
        match removed.and_then(|cell| cell.get().cloned()) {
            Some(pool) => {
                pool.close().await;
                info!(connection_id = %connection_id, "Connection pool closed");
                true
            }
            None => false,
        }
    }

    /// Close every pool concurrently. Returns the number closed.
    pub async fn close_all_pools(&self) -> usize {
        // Drain under lock, close outside lock
        let drained: Vec<Arc<ManagedPool>> = {
            let mut pools = self.pools.write().await;
            pools
                .drain()
                .filter_map(|(_, cell)| cell.get().cloned())
                .collect()
        };
        let count = drained.len();
        join_all(drained.iter().map(|pool| async move {
            pool.close().await;
            info!(connection_id = %pool.connection_id, "Connection pool closed");
        }))
        .await;
        count
    }

    /// Live pools, ordered by connection id.
    pub async fn list_pools(&self) -> Vec<PoolInfo> {
        let pools = self.pools.read().await;
        let mut infos: Vec<PoolInfo> = pools
            .values()
            .filter_map(|cell| cell.get())
            .map(|pool| PoolInfo {
                connection_id: pool.connection_id.clone(),
                dialect: pool.pool.dialect(),
                settings: pool.settings,
                created_at: pool.created_at,
            })
            .collect();
        infos.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        infos
    }

    /// Number of live pools.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.get().is_some()).count()
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
