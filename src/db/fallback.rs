//! Adapter seam for drivers without a native client.
//!
//! A fallback runs a statement through some external tool (a database CLI, a
//! sidecar process) and hands back a [`QueryResult`]. Its failures are plain
//! strings; the router wraps them into an unsupported-driver error that also
//! lists the native drivers.

use crate::models::{ConnectionDescriptor, QueryResult};
use futures_util::future::BoxFuture;

pub trait CliFallback: Send + Sync {
    fn execute<'a>(
        &'a self,
        descriptor: &'a ConnectionDescriptor,
        sql: &'a str,
    ) -> BoxFuture<'a, Result<QueryResult, String>>;
}

/// Fallback used when no external executor is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFallback;

impl CliFallback for DisabledFallback {
    fn execute<'a>(
        &'a self,
        descriptor: &'a ConnectionDescriptor,
        _sql: &'a str,
    ) -> BoxFuture<'a, Result<QueryResult, String>> {
        let message = format!(
            "no CLI fallback is configured for driver '{}'",
            descriptor.driver
        );
        Box::pin(async move { Err(message) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_fallback_names_the_driver() {
        let descriptor = ConnectionDescriptor::new("ora", "oracle");
        let err = tokio_test::block_on(DisabledFallback.execute(&descriptor, "SELECT 1 FROM dual"))
            .unwrap_err();
        assert_eq!(err, "no CLI fallback is configured for driver 'oracle'");
    }
}
