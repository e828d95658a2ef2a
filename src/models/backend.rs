//! Backend configuration models.
//!
//! A [`BackendConfig`] describes one database target. It is finalized by the
//! config layer at startup and shared behind `Arc` afterwards.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum connections per backend pool.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 10;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default bounded wait for a free pooled connection.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Default idle time before the reaper closes a pooled connection.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
}

impl BackendKind {
    /// Parse the backend kind from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::PostgreSQL => 5432,
            Self::MySQL => 3306,
        }
    }

    /// URL scheme used when rendering a masked target.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL => "mysql",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Login credentials. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "*****"))
            .finish()
    }
}

/// Configuration for a single backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub id: String,
    pub kind: BackendKind,
    pub host: String,
    pub port: u16,
    /// None for server-level connections
    pub database: Option<String>,
    pub credentials: Credentials,
    pub max_pool_size: u32,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    /// None disables idle reaping
    pub idle_timeout: Option<Duration>,
    pub test_before_acquire: bool,
    /// Default: false for safety
    pub writable: bool,
    /// Passed through as `sslmode` (PostgreSQL) or `ssl-mode` (MySQL)
    pub ssl_mode: Option<String>,
}

impl BackendConfig {
    /// Create a backend configuration with default pool settings.
    pub fn new(
        id: impl Into<String>,
        kind: BackendKind,
        host: impl Into<String>,
        port: u16,
        credentials: Credentials,
    ) -> Result<Self, BackendConfigError> {
        let id = id.into();

        if id.is_empty() {
            return Err(BackendConfigError::EmptyId);
        }
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BackendConfigError::InvalidId(id));
        }

        Ok(Self {
            id,
            kind,
            host: host.into(),
            port,
            database: None,
            credentials,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            test_before_acquire: true,
            writable: false,
            ssl_mode: None,
        })
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_max_pool_size(mut self, size: u32) -> Result<Self, BackendConfigError> {
        if size == 0 {
            return Err(BackendConfigError::InvalidPoolSize);
        }
        self.max_pool_size = size;
        Ok(self)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_test_before_acquire(mut self, test: bool) -> Self {
        self.test_before_acquire = test;
        self
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_ssl_mode(mut self, mode: impl Into<String>) -> Self {
        self.ssl_mode = Some(mode.into());
        self
    }

    /// True if no database was named, so the session lands at server level.
    pub fn is_server_level(&self) -> bool {
        self.database.is_none()
    }

    /// Display-safe target with the password replaced by `*****`.
    pub fn masked_url(&self) -> String {
        let auth = match &self.credentials.password {
            Some(_) => format!("{}:*****@", self.credentials.username),
            None if self.credentials.username.is_empty() => String::new(),
            None => format!("{}@", self.credentials.username),
        };
        let db = self.database.as_deref().unwrap_or("");
        format!(
            "{}://{}{}:{}/{}",
            self.kind.scheme(),
            auth,
            self.host,
            self.port,
            db
        )
    }
}

/// Errors that can occur when creating a backend configuration.
#[derive(Debug, thiserror::Error)]
pub enum BackendConfigError {
    #[error("Backend ID cannot be empty")]
    EmptyId,

    #[error("Backend ID contains invalid characters: {0}")]
    InvalidId(String),

    #[error("max_connections must be at least 1")]
    InvalidPoolSize,
}
