//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Dialect classification and per-call connect options
//! - Query execution and driver routing, with the CLI fallback seam
//! - Connection pool management
//! - Transaction registry for transactions spanning several calls
//! - Schema introspection
//! - Row decoding into JSON values

pub mod dialect;
pub mod executor;
pub mod fallback;
pub mod options;
pub mod pool;
pub mod schema;
pub mod transaction_registry;
pub mod types;

pub use dialect::{Dialect, NATIVE_DRIVERS};
pub use executor::{DbClient, QueryRouter, apply_row_limit};
pub use fallback::{CliFallback, DisabledFallback};
pub use options::ConnectionContext;
pub use pool::{
    ManagedPool, NativePool, PoolFactory, PoolInfo, PoolManager, PoolSettings, PoolStats,
    native_pool_factory,
};
pub use schema::SchemaInspector;
pub use transaction_registry::{
    AckStatus, TransactionAck, TransactionManager, TransactionMetadata, TransactionStatus,
};
