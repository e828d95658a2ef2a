//! Statement request models.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default row limit for query results.
pub const DEFAULT_ROW_LIMIT: u32 = 100;

/// Maximum allowed row limit.
pub const MAX_ROW_LIMIT: u32 = 10000;

/// Default query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u32 = 30;

/// Maximum allowed query timeout in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u32 = 300;

/// A positional parameter, always sent to the backend as a bound value.
///
/// On the wire parameters are plain JSON scalars. Binary values are objects of
/// the form `{"base64": "..."}` so they can't be confused with text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StatementParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    Text(String),
    Bytes {
        #[serde(with = "base64_bytes")]
        #[schemars(with = "String")]
        base64: Vec<u8>,
    },
}

impl StatementParam {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes {
            base64: data.into(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes { .. } => "bytes",
        }
    }
}

impl From<&str> for StatementParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for StatementParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One statement addressed to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRequest {
    pub backend_id: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<StatementParam>,
}

impl StatementRequest {
    pub fn new(backend_id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter to this statement.
    pub fn with_param(mut self, param: impl Into<StatementParam>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_params(mut self, params: Vec<StatementParam>) -> Self {
        self.params = params;
        self
    }
}

/// Clamp a requested row limit to `[1, MAX_ROW_LIMIT]`.
pub fn effective_row_limit(requested: Option<u32>, default: u32) -> u32 {
    requested.unwrap_or(default).clamp(1, MAX_ROW_LIMIT)
}

/// Clamp a requested timeout to `[1, MAX_QUERY_TIMEOUT_SECS]`.
pub fn effective_timeout_secs(requested: Option<u32>, default: u32) -> u32 {
    requested
        .unwrap_or(default)
        .clamp(1, MAX_QUERY_TIMEOUT_SECS)
}
