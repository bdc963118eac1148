//! Pool registry tests. Pools are built lazily, so no server is needed.

use db_gateway::db::{DisabledFallback, NativePool, PoolFactory, PoolManager, PoolSettings};
use db_gateway::models::ConnectionDescriptor;
use db_gateway::{Gateway, GatewayConfig, GatewayResult};
use futures_util::future::{BoxFuture, join_all};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Builds a Postgres pool that never connects, after `delay`.
fn lazy_factory(calls: Arc<AtomicUsize>, delay: Duration) -> PoolFactory {
    Arc::new(move |descriptor, settings| {
        calls.fetch_add(1, Ordering::SeqCst);
        let created: BoxFuture<'static, GatewayResult<NativePool>> = Box::pin(async move {
            tokio::time::sleep(delay).await;
            let options = PgConnectOptions::new()
                .host(&descriptor.host)
                .port(descriptor.port.unwrap_or(5432));
            let pool = PgPoolOptions::new()
                .min_connections(0)
                .max_connections(settings.max)
                .connect_lazy_with(options);
            Ok(NativePool::Postgres(pool))
        });
        created
    })
}

fn pg(id: &str) -> ConnectionDescriptor {
    ConnectionDescriptor::new(id, "postgres").with_host("127.0.0.1", Some(5432))
}

#[tokio::test]
async fn test_concurrent_get_pool_creates_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let manager = Arc::new(PoolManager::with_factory(
        PoolSettings::default(),
        lazy_factory(calls.clone(), Duration::from_millis(50)),
    ));
    let descriptor = pg("db1");

    let pools = join_all((0..16).map(|_| {
        let manager = manager.clone();
        let descriptor = descriptor.clone();
        async move { manager.get_pool(&descriptor).await }
    }))
    .await;

    let pools: Vec<_> = pools
        .into_iter()
        .map(|p| p.unwrap().expect("postgres is pooled"))
        .collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));
    assert_eq!(manager.pool_count().await, 1);

    let stats = manager.get_stats("db1").await.unwrap();
    assert_eq!(stats.connection_id, "db1");
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn test_distinct_ids_get_distinct_pools() {
    let calls = Arc::new(AtomicUsize::new(0));
    let manager = PoolManager::with_factory(
        PoolSettings::default(),
        lazy_factory(calls.clone(), Duration::ZERO),
    );

    let a = manager.get_pool(&pg("a")).await.unwrap().unwrap();
    let b = manager.get_pool(&pg("b")).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let ids: Vec<_> = manager
        .list_pools()
        .await
        .into_iter()
        .map(|p| p.connection_id)
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    assert!(manager.close_pool("a").await);
    assert!(!manager.close_pool("a").await);
    assert_eq!(manager.close_all_pools().await, 1);
    assert_eq!(manager.pool_count().await, 0);
}

#[tokio::test]
async fn test_close_during_creation_is_a_resource_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let manager = Arc::new(PoolManager::with_factory(
        PoolSettings::default(),
        lazy_factory(calls.clone(), Duration::from_millis(200)),
    ));

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_pool(&pg("db1")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Nothing live yet, but the in-flight marker goes away
    assert!(!manager.close_pool("db1").await);

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "resource");
    assert_eq!(manager.pool_count().await, 0);

    // A later call creates a fresh pool
    assert!(manager.get_pool(&pg("db1")).await.unwrap().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_shutdown_closes_pools() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pools = PoolManager::with_factory(
        PoolSettings::default(),
        lazy_factory(calls, Duration::ZERO),
    );
    let gateway =
        Gateway::with_parts(GatewayConfig::default(), pools, Arc::new(DisabledFallback)).unwrap();

    gateway.get_pool(&pg("a")).await.unwrap();
    gateway.get_pool(&pg("b")).await.unwrap();
    assert_eq!(gateway.list_pools().await.len(), 2);

    let report = gateway.shutdown().await;
    assert_eq!(report.pools_closed, 2);
    assert_eq!(report.transactions_rolled_back, 0);
    assert!(gateway.list_pools().await.is_empty());
    assert_eq!(gateway.get_pool(&pg("a")).await.unwrap_err().kind(), "configuration");
}
