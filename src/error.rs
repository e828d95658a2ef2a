//! Error types for the SQL Explorer MCP server.
//!
//! Two layers live here. [`ErrorKind`] is the stable, closed taxonomy that
//! callers branch on; it is what ends up in every error envelope. [`DbError`]
//! is the internal `thiserror` type that carries the detail (native codes,
//! suggestions) while a failure travels through the pool, dialect and
//! executor layers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error category reported to tool callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorKind {
    /// No pooled connection became available within the acquire timeout.
    PoolExhausted,
    /// The backend refused a new connection (auth, network, unknown database).
    ConnectionFailed,
    SyntaxError,
    ConstraintViolation,
    PermissionDenied,
    /// The connection broke while a statement was in flight.
    ConnectionLost,
    Timeout,
    Unknown,
    /// The invocation itself was malformed and never reached a backend.
    InvalidRequest,
    /// Unknown backend id or unknown table.
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "PoolExhausted",
            Self::ConnectionFailed => "ConnectionFailed",
            Self::SyntaxError => "SyntaxError",
            Self::ConstraintViolation => "ConstraintViolation",
            Self::PermissionDenied => "PermissionDenied",
            Self::ConnectionLost => "ConnectionLost",
            Self::Timeout => "Timeout",
            Self::Unknown => "Unknown",
            Self::InvalidRequest => "InvalidRequest",
            Self::NotFound => "NotFound",
        }
    }

    /// True for kinds where the backend (or the router) refused the statement
    /// before running any part of it.
    pub fn rejected_before_execution(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted
                | Self::ConnectionFailed
                | Self::SyntaxError
                | Self::PermissionDenied
                | Self::InvalidRequest
                | Self::NotFound
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection pool for '{backend_id}' exhausted: no connection was released within {waited_ms}ms")]
    PoolExhausted { backend_id: String, waited_ms: u64 },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String, suggestion: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// A statement-level error reported by the backend, already classified.
    #[error("{message}")]
    Database {
        kind: ErrorKind,
        message: String,
        /// SQLSTATE for PostgreSQL, error number for MySQL
        native_code: Option<String>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Permission denied: {operation} - {reason}")]
    Permission { operation: String, reason: String },

    #[error("Backend not found: {backend_id}")]
    BackendNotFound { backend_id: String },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn pool_exhausted(backend_id: impl Into<String>, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            backend_id: backend_id.into(),
            waited_ms,
        }
    }

    /// Create a connection failure with a helpful suggestion.
    pub fn connection_failed(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a classified backend error.
    pub fn database(kind: ErrorKind, message: impl Into<String>, native_code: Option<String>) -> Self {
        Self::Database {
            kind,
            message: message.into(),
            native_code,
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    pub fn permission(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn backend_not_found(backend_id: impl Into<String>) -> Self {
        Self::BackendNotFound {
            backend_id: backend_id.into(),
        }
    }

    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map this error onto the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::Database { kind, .. } => *kind,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Permission { .. } => ErrorKind::PermissionDenied,
            Self::BackendNotFound { .. } | Self::Schema { .. } => ErrorKind::NotFound,
            Self::InvalidInput { .. } | Self::Config { .. } => ErrorKind::InvalidRequest,
            Self::Internal { .. } => ErrorKind::Unknown,
        }
    }

    /// Backend-native error code, if the backend reported one.
    pub fn native_code(&self) -> Option<&str> {
        match self {
            Self::Database { native_code, .. } => native_code.as_deref(),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionFailed { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Retry later or raise max_connections for this backend")
            }
            Self::Timeout { .. } => Some("Increase timeout_secs or narrow the query"),
            Self::BackendNotFound { .. } => {
                Some("Call list_backends to see the configured backend ids")
            }
            _ => None,
        }
    }

    /// True when the error says nothing about the statement itself, so a
    /// fresh attempt on another connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PoolExhausted | ErrorKind::ConnectionFailed | ErrorKind::ConnectionLost
        )
    }

    /// True when the connection that produced this error must not be reused.
    /// A server-side statement timeout leaves the session usable; a client-side
    /// one does not.
    pub fn breaks_connection(&self) -> bool {
        self.kind() == ErrorKind::ConnectionLost || matches!(self, Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError, classifying backend codes per dialect.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        crate::db::dialect::translate_error(&err)
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Build suggestion data as JSON value.
fn suggestion_data(suggestion: Option<&str>) -> Option<serde_json::Value> {
    suggestion.map(|s| serde_json::json!({ "suggestion": s }))
}

/// Convert DbError to MCP ErrorData for protocol-level rejections.
impl From<DbError> for rmcp::ErrorData {
    fn from(err: DbError) -> Self {
        let data = suggestion_data(err.suggestion());
        match err.kind() {
            ErrorKind::InvalidRequest | ErrorKind::PermissionDenied | ErrorKind::SyntaxError => {
                rmcp::ErrorData::invalid_params(err.to_string(), data)
            }
            ErrorKind::NotFound => rmcp::ErrorData::resource_not_found(err.to_string(), data),
            _ => rmcp::ErrorData::internal_error(err.to_string(), data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection_failed("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            DbError::pool_exhausted("pg", 100).kind(),
            ErrorKind::PoolExhausted
        );
        assert_eq!(DbError::timeout("query", 5).kind(), ErrorKind::Timeout);
        assert_eq!(
            DbError::permission("INSERT", "read-only").kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(DbError::backend_not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(DbError::schema("missing", "users").kind(), ErrorKind::NotFound);
        assert_eq!(
            DbError::invalid_input("empty sql").kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(DbError::internal("boom").kind(), ErrorKind::Unknown);
        assert_eq!(
            DbError::database(ErrorKind::SyntaxError, "bad", Some("42601".into())).kind(),
            ErrorKind::SyntaxError
        );
    }

    #[test]
    fn test_native_code_only_on_database_errors() {
        let err = DbError::database(ErrorKind::ConstraintViolation, "dup", Some("1062".into()));
        assert_eq!(err.native_code(), Some("1062"));
        assert_eq!(DbError::timeout("query", 5).native_code(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::connection_lost("reset").is_retryable());
        assert!(DbError::pool_exhausted("pg", 10).is_retryable());
        assert!(!DbError::timeout("query", 30).is_retryable());
        assert!(!DbError::permission("write", "read-only").is_retryable());
    }

    #[test]
    fn test_breaks_connection() {
        assert!(DbError::connection_lost("eof").breaks_connection());
        assert!(DbError::timeout("query", 1).breaks_connection());
        assert!(
            !DbError::database(ErrorKind::SyntaxError, "bad", None).breaks_connection()
        );
        assert!(
            DbError::database(ErrorKind::ConnectionLost, "gone", Some("2013".into()))
                .breaks_connection()
        );
        assert!(
            !DbError::database(ErrorKind::Timeout, "canceled", Some("57014".into()))
                .breaks_connection()
        );
    }

    #[test]
    fn test_rejected_before_execution() {
        assert!(ErrorKind::SyntaxError.rejected_before_execution());
        assert!(ErrorKind::PoolExhausted.rejected_before_execution());
        assert!(!ErrorKind::ConnectionLost.rejected_before_execution());
        assert!(!ErrorKind::Timeout.rejected_before_execution());
    }

    #[test]
    fn test_kind_serializes_as_stable_tag() {
        let json = serde_json::to_string(&ErrorKind::PoolExhausted).unwrap();
        assert_eq!(json, "\"PoolExhausted\"");
        assert_eq!(ErrorKind::SyntaxError.to_string(), "SyntaxError");
    }

    #[test]
    fn test_invalid_input_maps_to_invalid_params() {
        let mcp_err: rmcp::ErrorData = DbError::invalid_input("bad input").into();
        assert_eq!(mcp_err.code.0, -32602);
    }

    #[test]
    fn test_backend_not_found_maps_to_resource_not_found() {
        let mcp_err: rmcp::ErrorData = DbError::backend_not_found("nope").into();
        assert_eq!(mcp_err.code.0, -32002);
        let data = mcp_err.data.unwrap();
        assert!(data["suggestion"].as_str().unwrap().contains("list_backends"));
    }

    #[test]
    fn test_connection_failed_maps_to_internal_error_with_suggestion() {
        let mcp_err: rmcp::ErrorData =
            DbError::connection_failed("refused", "check the host").into();
        assert_eq!(mcp_err.code.0, -32603);
        assert_eq!(mcp_err.data.unwrap()["suggestion"], "check the host");
    }
}
