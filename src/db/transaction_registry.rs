//! Transaction registry for transactions that span several tool calls.
//!
//! Each transaction holds a dedicated backend client until it is committed,
//! rolled back, swept as stale, or rolled back at shutdown. A transaction is
//! removed from the registry before its terminal statement runs, so a second
//! commit or rollback on the same id always fails with `NotFound`.

use crate::db::dialect::{Dialect, NATIVE_DRIVERS};
use crate::db::executor::{DbClient, bounded};
use crate::db::options::ConnectionContext;
use crate::db::pool::PoolManager;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{ConnectionDescriptor, QueryResult};
use crate::tools::guard::detect_transaction_control;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default age after which an open transaction is considered abandoned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// Status reported by begin, commit and rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Started,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionAck {
    pub transaction_id: String,
    pub status: AckStatus,
}

/// Metadata about an active transaction (for listing without locking it).
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    pub transaction_id: String,
    pub connection_id: String,
    pub dialect: Dialect,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
}

#[derive(Debug, Clone, Copy)]
enum Finish {
    Commit,
    Rollback,
}

struct TransactionState {
    client: Option<DbClient>,
    status: TransactionStatus,
}

struct ActiveTransaction {
    transaction_id: String,
    dialect: Dialect,
    ctx: ConnectionContext,
    started: Instant,
    started_at: DateTime<Utc>,
    /// Serializes statements within this transaction.
    state: Mutex<TransactionState>,
}

impl ActiveTransaction {
    fn is_older_than(&self, max_age: Duration) -> bool {
        self.started.elapsed() > max_age
    }

    fn metadata(&self) -> TransactionMetadata {
        TransactionMetadata {
            transaction_id: self.transaction_id.clone(),
            connection_id: self.ctx.connection_id.clone(),
            dialect: self.dialect.clone(),
            // Registered entries are always active
            status: TransactionStatus::Active,
            started_at: self.started_at,
            age_secs: self.started.elapsed().as_secs(),
        }
    }
}

pub struct TransactionManager {
    transactions: RwLock<HashMap<String, Arc<ActiveTransaction>>>,
    pools: Arc<PoolManager>,
    query_timeout: Duration,
}

impl TransactionManager {
    pub fn new(pools: Arc<PoolManager>, query_timeout: Duration) -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            pools,
            query_timeout,
        }
    }

    /// Begin a transaction on a dedicated client.
    pub async fn begin_transaction(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> GatewayResult<TransactionAck> {
        let dialect = Dialect::classify(&descriptor.driver);
        if let Dialect::Unknown(driver) = &dialect {
            return Err(GatewayError::unsupported_driver(
                driver.as_str(),
                NATIVE_DRIVERS,
                "transactions require a native adapter",
            ));
        }
        let ctx = ConnectionContext::from_descriptor(descriptor);
        let mut client = self.checkout(descriptor, &dialect, &ctx).await?;

        if let Err(e) = client
            .run_control(dialect.begin_statement(), &ctx, self.query_timeout)
            .await
        {
            client.discard(&ctx).await;
            return Err(e);
        }

        let transaction_id = generate_transaction_id();
        let entry = Arc::new(ActiveTransaction {
            transaction_id: transaction_id.clone(),
            dialect: dialect.clone(),
            ctx,
            started: Instant::now(),
            started_at: Utc::now(),
            state: Mutex::new(TransactionState {
                client: Some(client),
                status: TransactionStatus::Active,
            }),
        });

        {
            let mut txs = self.transactions.write().await;
            txs.insert(transaction_id.clone(), entry);
        }

        info!(
            transaction_id = %transaction_id,
            connection_id = %descriptor.id,
            dialect = %dialect,
            "Transaction started"
        );

        Ok(TransactionAck {
            transaction_id,
            status: AckStatus::Started,
        })
    }

    /// A client that stays with the transaction until it finishes.
    async fn checkout(
        &self,
        descriptor: &ConnectionDescriptor,
        dialect: &Dialect,
        ctx: &ConnectionContext,
    ) -> GatewayResult<DbClient> {
        match self.pools.get_pool(descriptor).await? {
            Some(pool) => pool.dedicated(ctx).await,
            None => {
                bounded(
                    self.query_timeout,
                    || format!("connect to '{}'", ctx.connection_id),
                    DbClient::connect(descriptor, dialect, ctx),
                )
                .await
            }
        }
    }

    async fn lookup(&self, transaction_id: &str) -> GatewayResult<Arc<ActiveTransaction>> {
        let txs = self.transactions.read().await;
        txs.get(transaction_id)
            .cloned()
            .ok_or_else(|| GatewayError::transaction_not_found(transaction_id))
    }

    /// Dialect of an open transaction.
    pub async fn dialect_of(&self, transaction_id: &str) -> GatewayResult<Dialect> {
        Ok(self.lookup(transaction_id).await?.dialect.clone())
    }

    /// Run a statement on the transaction's client.
    ///
    /// Statements that would begin, commit or roll back on their own are
    /// rejected; the transaction ends only through commit or rollback here.
    pub async fn execute_in_transaction(
        &self,
        transaction_id: &str,
        sql: &str,
    ) -> GatewayResult<QueryResult> {
        let entry = self.lookup(transaction_id).await?;
        if let Some(reason) = detect_transaction_control(&entry.dialect, sql) {
            return Err(GatewayError::validation(reason));
        }
        let mut state = entry.state.lock().await;
        if state.status != TransactionStatus::Active {
            return Err(GatewayError::transaction_not_found(transaction_id));
        }
        let client = state
            .client
            .as_mut()
            .ok_or_else(|| GatewayError::transaction_not_found(transaction_id))?;

        let result = client.run(sql, &entry.ctx, self.query_timeout).await?;

        debug!(
            transaction_id = %transaction_id,
            row_count = result.row_count,
            rows_affected = ?result.rows_affected,
            "Executed in transaction"
        );

        Ok(result)
    }

    pub async fn commit_transaction(&self, transaction_id: &str) -> GatewayResult<TransactionAck> {
        let entry = self.take(transaction_id).await?;
        self.finish(&entry, Finish::Commit).await
    }

    pub async fn rollback_transaction(
        &self,
        transaction_id: &str,
    ) -> GatewayResult<TransactionAck> {
        let entry = self.take(transaction_id).await?;
        self.finish(&entry, Finish::Rollback).await
    }

    async fn take(&self, transaction_id: &str) -> GatewayResult<Arc<ActiveTransaction>> {
        let mut txs = self.transactions.write().await;
        txs.remove(transaction_id)
            .ok_or_else(|| GatewayError::transaction_not_found(transaction_id))
    }

    /// Run the terminal statement on an already unregistered transaction.
    ///
    /// On success the client goes back to its pool; on failure it is closed
    /// instead and the original error is returned.
    async fn finish(
        &self,
        entry: &ActiveTransaction,
        action: Finish,
    ) -> GatewayResult<TransactionAck> {
        let mut state = entry.state.lock().await;
        let mut client = state
            .client
            .take()
            .ok_or_else(|| GatewayError::transaction_not_found(&entry.transaction_id))?;

        let (statement, status, ack) = match action {
            Finish::Commit => (
                entry.dialect.commit_statement(),
                TransactionStatus::Committed,
                AckStatus::Committed,
            ),
            Finish::Rollback => (
                entry.dialect.rollback_statement(),
                TransactionStatus::RolledBack,
                AckStatus::RolledBack,
            ),
        };

        let outcome = client
            .run_control(statement, &entry.ctx, self.query_timeout)
            .await;

        match outcome {
            Ok(()) => {
                state.status = status;
                drop(state);
                client.release(&entry.ctx).await;
                info!(
                    transaction_id = %entry.transaction_id,
                    connection_id = %entry.ctx.connection_id,
                    status = ?status,
                    "Transaction finished"
                );
                Ok(TransactionAck {
                    transaction_id: entry.transaction_id.clone(),
                    status: ack,
                })
            }
            Err(e) => {
                // The server discards the transaction with the session
                state.status = TransactionStatus::RolledBack;
                drop(state);
                client.discard(&entry.ctx).await;
                warn!(
                    transaction_id = %entry.transaction_id,
                    connection_id = %entry.ctx.connection_id,
                    error = %e,
                    "{statement} failed; connection closed"
                );
                Err(e)
            }
        }
    }

    /// Roll back every transaction older than `max_age`. Returns how many were removed.
    pub async fn cleanup_stale_transactions(&self, max_age: Duration) -> usize {
        let stale: Vec<Arc<ActiveTransaction>> = {
            let mut txs = self.transactions.write().await;
            let ids: Vec<String> = txs
                .iter()
                .filter(|(_, entry)| entry.is_older_than(max_age))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| txs.remove(id)).collect()
        };

        for entry in &stale {
            warn!(
                transaction_id = %entry.transaction_id,
                connection_id = %entry.ctx.connection_id,
                age_secs = entry.started.elapsed().as_secs(),
                "Rolling back stale transaction"
            );
            // Removed regardless of the rollback outcome
            if let Err(e) = self.finish(entry, Finish::Rollback).await {
                warn!(transaction_id = %entry.transaction_id, error = %e, "Stale rollback failed");
            }
        }
        stale.len()
    }

    /// Best-effort rollback of every registered transaction. Returns the count processed.
    pub async fn rollback_all(&self) -> usize {
        let drained: Vec<Arc<ActiveTransaction>> = {
            let mut txs = self.transactions.write().await;
            txs.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        join_all(drained.iter().map(|entry| async move {
            if let Err(e) = self.finish(entry, Finish::Rollback).await {
                warn!(transaction_id = %entry.transaction_id, error = %e, "Rollback during shutdown failed");
            }
        }))
        .await;
        count
    }

    /// List all active transactions, oldest first.
    pub async fn list_transactions(&self) -> Vec<TransactionMetadata> {
        let txs = self.transactions.read().await;
        let mut list: Vec<TransactionMetadata> = txs.values().map(|e| e.metadata()).collect();
        list.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        list
    }

    /// Get the number of active transactions.
    pub async fn count(&self) -> usize {
        let txs = self.transactions.read().await;
        txs.len()
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
