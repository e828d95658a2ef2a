//! Data models for the SQL Explorer MCP server.
//!
//! This module re-exports all model types used throughout the application.

pub mod backend;
pub mod result;
pub mod schema;
pub mod statement;

// Re-export commonly used types
pub use backend::{BackendConfig, BackendConfigError, BackendKind, Credentials};
pub use result::{ColumnShape, Failure, NormalizedResult, RowSet, Scalar, Temporal, TypeTag};
pub use schema::{
    ColumnDescription, ForeignKey, IndexInfo, TableDescription, TableSummary, TableType,
};
pub use statement::{
    DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_ROW_LIMIT, MAX_QUERY_TIMEOUT_SECS, MAX_ROW_LIMIT,
    StatementParam, StatementRequest,
};
