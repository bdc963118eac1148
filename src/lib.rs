//! Database gateway library.
//!
//! Guarded, pooled and transactional SQL access to PostgreSQL, MySQL/MariaDB,
//! SQL Server and SQLite, with a CLI fallback seam for every other driver.

pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod tools;

pub use config::{ConnectionResolver, GatewayConfig, StaticConnections};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, ShutdownReport};
pub use tools::{ToolCall, ToolDispatcher, ToolResponse};
