//! Database access layer.
//!
//! This module provides:
//! - Bounded connection pools, one per backend
//! - The MySQL/PostgreSQL dialect adapter
//! - Statement execution with time limits and row caps
//! - Schema introspection
//! - Native type mapping and row decoding

pub mod dialect;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod pool;
pub mod schema;
pub mod types;

pub use dialect::{DialectConnection, StatementOutcome, translate_error};
pub use executor::{Execution, StatementExecutor};
pub use manager::{BackendGuard, DialectConnector, PoolManager};
pub use pool::{ConnectionPool, ManageConnection, PoolGuard, PoolSettings, PoolStats};
pub use schema::SchemaInspector;
