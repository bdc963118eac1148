//! The gateway: one explicitly constructed owner of the router, the pool
//! registry and the transaction registry.
//!
//! Every public call goes through the statement guards first. `shutdown`
//! rolls back open transactions, then closes pools, then stops the stale
//! transaction sweeper.

use crate::config::GatewayConfig;
use crate::db::{
    CliFallback, Dialect, DisabledFallback, ManagedPool, PoolInfo, PoolManager, PoolStats,
    QueryRouter, SchemaInspector, TransactionAck, TransactionManager, TransactionMetadata,
};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{ConnectionDescriptor, ExplainFormat, QueryPlanNode, QueryResult, SchemaDiff};
use crate::tools::explain::{build_explain_query, parse_explain_output};
use crate::tools::guard::{enforce_read_only_for, validate_query_for};
use crate::tools::schema_diff::compare_schemas;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What `shutdown` cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub transactions_rolled_back: usize,
    pub pools_closed: usize,
}

pub struct Gateway {
    config: GatewayConfig,
    pools: Arc<PoolManager>,
    router: QueryRouter,
    transactions: TransactionManager,
    shutting_down: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build a gateway with native pools and no CLI fallback, and start the sweeper.
    pub fn new(config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        let pools = PoolManager::new(config.pool_settings());
        Self::with_parts(config, pools, Arc::new(DisabledFallback))
    }

    /// Build a gateway from explicit parts. Must be called inside a tokio runtime.
    pub fn with_parts(
        config: GatewayConfig,
        pools: PoolManager,
        fallback: Arc<dyn CliFallback>,
    ) -> GatewayResult<Arc<Self>> {
        config.validate()?;
        let pools = Arc::new(pools);
        let router = QueryRouter::new(
            Arc::clone(&pools),
            fallback,
            config.query_timeout(),
            config.max_rows,
        );
        let transactions = TransactionManager::new(Arc::clone(&pools), config.query_timeout());

        let gateway = Arc::new(Self {
            config,
            pools,
            router,
            transactions,
            shutting_down: AtomicBool::new(false),
            cleanup_task: Mutex::new(None),
        });
        gateway.start_cleanup_task();

        info!(
            read_only = gateway.config.read_only,
            max_rows = gateway.config.max_rows,
            query_timeout_ms = gateway.config.query_timeout_ms,
            "Gateway started"
        );
        Ok(gateway)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Periodic stale-transaction sweep. Holds only a weak reference.
    fn start_cleanup_task(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval();
        let threshold = self.config.stale_transaction_threshold();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(gateway) = weak.upgrade() else {
                    break;
                };
                let swept = gateway.transactions.cleanup_stale_transactions(threshold).await;
                if swept > 0 {
                    info!(count = swept, "Swept stale transactions");
                }
            }
        });
        *self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn ensure_running(&self) -> GatewayResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::configuration("gateway is shutting down"));
        }
        Ok(())
    }

    /// Apply read-only mode always, and the destructive-statement check unless confirmed.
    fn guard(&self, dialect: &Dialect, sql: &str, confirmed: bool) -> GatewayResult<()> {
        self.ensure_running()?;
        if self.config.read_only {
            if let Some(reason) = enforce_read_only_for(dialect, sql) {
                return Err(GatewayError::validation(reason));
            }
        }
        if !confirmed {
            if let Some(reason) = validate_query_for(dialect, sql) {
                return Err(GatewayError::validation(reason));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Ad hoc execution
    // =========================================================================

    /// Run a statement on a dedicated connection.
    pub async fn execute(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        self.guard(&Dialect::classify(&descriptor.driver), sql, false)?;
        self.router.execute(descriptor, sql).await
    }

    /// Run a statement on the connection's pool (dedicated for SQLite).
    pub async fn execute_pooled(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        self.guard(&Dialect::classify(&descriptor.driver), sql, false)?;
        self.router.execute_pooled(descriptor, sql).await
    }

    /// Run a statement the caller explicitly confirmed. Read-only mode still applies.
    pub async fn execute_confirmed(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
        pooled: bool,
    ) -> GatewayResult<QueryResult> {
        self.guard(&Dialect::classify(&descriptor.driver), sql, true)?;
        if pooled {
            self.router.execute_pooled(descriptor, sql).await
        } else {
            self.router.execute(descriptor, sql).await
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub async fn begin_transaction(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> GatewayResult<TransactionAck> {
        self.ensure_running()?;
        self.transactions.begin_transaction(descriptor).await
    }

    /// Dialect of an open transaction's connection.
    pub async fn transaction_dialect(&self, transaction_id: &str) -> GatewayResult<Dialect> {
        self.ensure_running()?;
        self.transactions.dialect_of(transaction_id).await
    }

    pub async fn execute_in_transaction(
        &self,
        transaction_id: &str,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        let dialect = self.transaction_dialect(transaction_id).await?;
        self.guard(&dialect, sql, false)?;
        self.transactions.execute_in_transaction(transaction_id, sql).await
    }

    pub async fn execute_in_transaction_confirmed(
        &self,
        transaction_id: &str,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        let dialect = self.transaction_dialect(transaction_id).await?;
        self.guard(&dialect, sql, true)?;
        self.transactions.execute_in_transaction(transaction_id, sql).await
    }

    pub async fn commit_transaction(&self, transaction_id: &str) -> GatewayResult<TransactionAck> {
        self.ensure_running()?;
        self.transactions.commit_transaction(transaction_id).await
    }

    pub async fn rollback_transaction(
        &self,
        transaction_id: &str,
    ) -> GatewayResult<TransactionAck> {
        self.ensure_running()?;
        self.transactions.rollback_transaction(transaction_id).await
    }

    pub async fn list_transactions(&self) -> Vec<TransactionMetadata> {
        self.transactions.list_transactions().await
    }

    /// Roll back transactions older than `max_age`. Returns how many were removed.
    pub async fn cleanup_stale_transactions(&self, max_age: Duration) -> usize {
        self.transactions.cleanup_stale_transactions(max_age).await
    }

    pub async fn rollback_all(&self) -> usize {
        self.transactions.rollback_all().await
    }

    // =========================================================================
    // Pools
    // =========================================================================

    pub async fn get_pool(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> GatewayResult<Option<Arc<ManagedPool>>> {
        self.ensure_running()?;
        self.pools.get_pool(descriptor).await
    }

    pub async fn get_stats(&self, connection_id: &str) -> Option<PoolStats> {
        self.pools.get_stats(connection_id).await
    }

    pub async fn close_pool(&self, connection_id: &str) -> bool {
        self.pools.close_pool(connection_id).await
    }

    pub async fn close_all_pools(&self) -> usize {
        self.pools.close_all_pools().await
    }

    pub async fn list_pools(&self) -> Vec<PoolInfo> {
        self.pools.list_pools().await
    }

    // =========================================================================
    // Schema and plans
    // =========================================================================

    /// Introspect both connections concurrently and compare them.
    pub async fn diff_schemas(
        &self,
        source: &ConnectionDescriptor,
        target: &ConnectionDescriptor,
        schema: Option<&str>,
    ) -> GatewayResult<SchemaDiff> {
        self.ensure_running()?;
        let (source_tables, target_tables) = tokio::try_join!(
            SchemaInspector::load_tables(&self.router, source, schema),
            SchemaInspector::load_tables(&self.router, target, schema),
        )?;

        let mut diff = compare_schemas(&source_tables, &target_tables);
        diff.source_connection = source.id.clone();
        diff.target_connection = target.id.clone();
        debug!(
            source = %source.id,
            target = %target.id,
            added = diff.summary.added,
            removed = diff.summary.removed,
            modified = diff.summary.modified,
            "Schema diff computed"
        );
        Ok(diff)
    }

    /// Explain a statement and normalize the plan.
    ///
    /// Read-only mode always applies to the explained statement. ANALYZE runs
    /// the statement, so it also needs the destructive-statement check, as do
    /// SQL Server plans, which always come from execution.
    pub async fn explain(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
        analyze: bool,
        format: ExplainFormat,
    ) -> GatewayResult<Vec<QueryPlanNode>> {
        let dialect = Dialect::classify(&descriptor.driver);
        let executes = analyze || matches!(dialect, Dialect::MsSql);
        self.guard(&dialect, sql, !executes)?;

        let statement = build_explain_query(&dialect, sql, analyze, format)?;
        let result = self.router.execute_unlimited(descriptor, &statement).await?;
        Ok(parse_explain_output(&dialect, &result, format))
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop accepting calls, roll back transactions, close pools, stop the sweeper.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress");
        }
        info!("Shutting down gateway");

        let transactions_rolled_back = self.transactions.rollback_all().await;
        info!(count = transactions_rolled_back, "Rolled back open transactions");

        let pools_closed = self.pools.close_all_pools().await;
        info!(count = pools_closed, "Closed pools");

        let task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Stale transaction sweeper failed");
                }
            }
        }

        let report = ShutdownReport {
            transactions_rolled_back,
            pools_closed,
        };
        info!(
            transactions_rolled_back = report.transactions_rolled_back,
            pools_closed = report.pools_closed,
            "Gateway shutdown complete"
        );
        report
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(task) = self
            .cleanup_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
