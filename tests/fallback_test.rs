//! Routing for drivers without a native adapter.

use db_gateway::db::{CliFallback, DisabledFallback, PoolManager, PoolSettings};
use db_gateway::models::{ConnectionDescriptor, ExplainFormat, QueryResult};
use db_gateway::{Gateway, GatewayConfig};
use futures_util::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn oracle() -> ConnectionDescriptor {
    ConnectionDescriptor::new("ora", "oracle")
        .with_host("ora.internal", Some(1521))
        .with_user("scott")
        .with_property("password", "tiger")
}

/// Answers every statement with a single row echoing the SQL.
struct EchoFallback {
    calls: AtomicUsize,
}

impl CliFallback for EchoFallback {
    fn execute<'a>(
        &'a self,
        descriptor: &'a ConnectionDescriptor,
        sql: &'a str,
    ) -> BoxFuture<'a, Result<QueryResult, String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(QueryResult::new(
                vec!["connection".to_string(), "sql".to_string()],
                vec![vec![json!(descriptor.id), json!(sql)]],
            ))
        })
    }
}

/// Fails the way a CLI that echoes its command line would.
struct LeakyFallback;

impl CliFallback for LeakyFallback {
    fn execute<'a>(
        &'a self,
        _descriptor: &'a ConnectionDescriptor,
        _sql: &'a str,
    ) -> BoxFuture<'a, Result<QueryResult, String>> {
        Box::pin(async {
            Err("sqlplus exited with status 1: login failed for password=tiger".to_string())
        })
    }
}

fn gateway(fallback: Arc<dyn CliFallback>) -> Arc<Gateway> {
    Gateway::with_parts(
        GatewayConfig::default(),
        PoolManager::new(PoolSettings::default()),
        fallback,
    )
    .unwrap()
}

#[tokio::test]
async fn test_unknown_driver_without_fallback() {
    let gateway = gateway(Arc::new(DisabledFallback));
    let db = oracle();

    let err = gateway.execute(&db, "SELECT 1 FROM dual").await.unwrap_err();
    assert_eq!(err.kind(), "unsupported_driver");
    let message = err.to_string();
    assert!(message.contains("oracle"));
    assert!(message.contains("postgres"));
    assert!(message.contains("sqlite"));
    assert!(message.contains("no CLI fallback is configured"));

    assert_eq!(
        gateway.begin_transaction(&db).await.unwrap_err().kind(),
        "unsupported_driver"
    );
    assert_eq!(
        gateway
            .explain(&db, "SELECT 1 FROM dual", false, ExplainFormat::Text)
            .await
            .unwrap_err()
            .kind(),
        "unsupported_driver"
    );
    assert!(gateway.get_pool(&db).await.unwrap().is_none());
    assert!(gateway.list_transactions().await.is_empty());
}

#[tokio::test]
async fn test_fallback_result_is_passed_through() {
    let fallback = Arc::new(EchoFallback {
        calls: AtomicUsize::new(0),
    });
    let gateway = gateway(fallback.clone());

    let result = gateway.execute(&oracle(), "SELECT 1 FROM dual").await.unwrap();
    assert_eq!(result.columns, vec!["connection", "sql"]);
    assert_eq!(result.value(0, "connection"), Some(&json!("ora")));
    assert_eq!(result.value(0, "sql"), Some(&json!("SELECT 1 FROM dual")));
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_guard_runs_before_fallback() {
    let fallback = Arc::new(EchoFallback {
        calls: AtomicUsize::new(0),
    });
    let gateway = gateway(fallback.clone());

    let err = gateway.execute(&oracle(), "TRUNCATE TABLE emp").await.unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fallback_failure_is_redacted() {
    let gateway = gateway(Arc::new(LeakyFallback));

    let err = gateway.execute(&oracle(), "SELECT 1 FROM dual").await.unwrap_err();
    assert_eq!(err.kind(), "unsupported_driver");
    let message = err.to_string();
    assert!(message.contains("login failed"));
    assert!(!message.contains("tiger"));
}
