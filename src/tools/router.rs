//! Request routing.
//!
//! [`RequestRouter::handle`] is the single entry point for tool calls. It
//! validates the invocation, resolves the backend, borrows a connection for
//! exactly one operation, and always answers with a [`ResponseEnvelope`]:
//! no error escapes `handle`.
//!
//! Retries are off by default. With a [`RetryPolicy`] of more than one
//! attempt, a call is retried only when the connection failed or broke and
//! the statement provably had no side effect.

use crate::db::{BackendGuard, PoolManager, PoolStats, SchemaInspector, StatementExecutor};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::statement::{effective_row_limit, effective_timeout_secs};
use crate::models::{BackendKind, Failure, NormalizedResult, StatementParam, StatementRequest};
use crate::tools::classify::classify;
use crate::tools::format::OutputFormat;
use crate::tools::marshal::{ResponseEnvelope, ResultMarshaler};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::{Instant, timeout};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

const CATALOG_CANCEL_BUDGET: Duration = Duration::from_secs(5);

/// One tool call addressed to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolInvocation {
    pub backend_id: String,
    #[serde(flatten)]
    pub call: ToolCall,
}

impl ToolInvocation {
    pub fn new(backend_id: impl Into<String>, call: ToolCall) -> Self {
        Self {
            backend_id: backend_id.into(),
            call,
        }
    }
}

/// The operation requested, tagged by `tool` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    RunQuery {
        sql: String,
        #[serde(default)]
        params: Vec<StatementParam>,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        timeout_secs: Option<u32>,
        #[serde(default)]
        format: OutputFormat,
    },
    ListTables {
        #[serde(default)]
        schema: Option<String>,
    },
    DescribeTable {
        table: String,
        #[serde(default)]
        schema: Option<String>,
    },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunQuery { .. } => "run_query",
            Self::ListTables { .. } => "list_tables",
            Self::DescribeTable { .. } => "describe_table",
        }
    }

    /// Plain query with defaults for everything but the SQL.
    pub fn query(sql: impl Into<String>) -> Self {
        Self::RunQuery {
            sql: sql.into(),
            params: Vec::new(),
            limit: None,
            timeout_secs: None,
            format: OutputFormat::Json,
        }
    }
}

/// How many times a call may be attempted in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_attempts: 1 }
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// `attempt` counts from 1.
    pub fn should_retry(&self, failure: &Failure, attempt: u32) -> bool {
        attempt < self.max_attempts
            && !failure.side_effect_possible
            && matches!(
                failure.kind,
                ErrorKind::ConnectionLost | ErrorKind::ConnectionFailed
            )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// One configured backend as reported by `list_backends`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct BackendSummary {
    pub id: String,
    pub kind: BackendKind,
    /// Connection target with the password masked
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub writable: bool,
    /// No default database; qualify table names or pass `schema`
    pub server_level: bool,
    pub pool: PoolStats,
}

/// Routes tool invocations to backends and renders the outcome.
pub struct RequestRouter {
    pools: Arc<PoolManager>,
    executor: StatementExecutor,
    marshaler: ResultMarshaler,
    retry: RetryPolicy,
}

impl RequestRouter {
    pub fn new(
        pools: Arc<PoolManager>,
        executor: StatementExecutor,
        marshaler: ResultMarshaler,
    ) -> Self {
        Self {
            pools,
            executor,
            marshaler,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Handle one invocation. Every outcome, including validation failures,
    /// comes back as an envelope.
    pub async fn handle(&self, invocation: ToolInvocation) -> ResponseEnvelope {
        let span = info_span!(
            "tool_call",
            request_id = %Uuid::new_v4(),
            tool = invocation.call.name(),
            backend_id = %invocation.backend_id,
        );
        async move {
            let start = Instant::now();
            let envelope = match self.dispatch(invocation).await {
                Ok(envelope) => envelope,
                Err(err) => ResponseEnvelope::rejected(&err),
            };
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match envelope.kind() {
                None => info!(elapsed_ms, truncated = envelope.truncated, "Tool call succeeded"),
                Some(kind) => info!(elapsed_ms, %kind, "Tool call failed"),
            }
            envelope
        }
        .instrument(span)
        .await
    }

    /// Validate and route. `Err` means the call never reached a backend.
    async fn dispatch(&self, invocation: ToolInvocation) -> DbResult<ResponseEnvelope> {
        let backend_id = invocation.backend_id.trim();
        if backend_id.is_empty() {
            return Err(DbError::invalid_input(
                "backend_id is required. Call list_backends to see configured backends.",
            ));
        }
        let backend = self.pools.backend(backend_id)?;

        match invocation.call {
            ToolCall::RunQuery {
                sql,
                params,
                limit,
                timeout_secs,
                format,
            } => {
                if sql.trim().is_empty() {
                    return Err(DbError::invalid_input("sql must not be empty"));
                }
                let classification = classify(&sql, backend.kind);
                match classification.statements {
                    Some(0) => return Err(DbError::invalid_input("sql contains no statement")),
                    Some(n) if n > 1 => {
                        return Err(DbError::invalid_input(format!(
                            "Only one statement per call is allowed, found {}",
                            n
                        )));
                    }
                    _ => {}
                }
                let known_write =
                    classification.statements.is_some() && !classification.read_only;
                if !backend.writable && known_write {
                    return Err(DbError::permission(
                        classification.operation.unwrap_or("statement"),
                        format!("backend '{}' is read-only", backend_id),
                    ));
                }

                let request = StatementRequest::new(backend_id, sql).with_params(params);
                let time_limit = self.time_limit(timeout_secs);
                let row_cap = effective_row_limit(limit, self.executor.default_row_cap());
                let envelope = self
                    .run_query(&request, time_limit, row_cap, classification.read_only)
                    .await;
                Ok(self.marshaler.render(envelope, format))
            }
            ToolCall::ListTables { schema } => {
                let schema = non_empty(schema);
                Ok(self.list_tables(backend_id, schema.as_deref()).await)
            }
            ToolCall::DescribeTable { table, schema } => {
                let table = table.trim();
                if table.is_empty() {
                    return Err(DbError::invalid_input("table must not be empty"));
                }
                let schema = non_empty(schema);
                let backend_name = backend.kind.display_name();
                Ok(self
                    .describe_table(backend_id, table, schema.as_deref(), backend_name)
                    .await)
            }
        }
    }

    fn time_limit(&self, requested_secs: Option<u32>) -> Duration {
        let default_secs = self.executor.default_timeout().as_secs() as u32;
        Duration::from_secs(effective_timeout_secs(requested_secs, default_secs) as u64)
    }

    async fn run_query(
        &self,
        request: &StatementRequest,
        time_limit: Duration,
        row_cap: u32,
        read_only: bool,
    ) -> ResponseEnvelope {
        let start = Instant::now();
        let mut attempt = 1;
        loop {
            let failure = match self.pools.acquire(&request.backend_id).await {
                Err(err) => Failure::rejected(&err),
                Ok(mut guard) => {
                    let execution = self
                        .executor
                        .execute(&mut guard, request, Some(time_limit), Some(row_cap), read_only)
                        .await;
                    guard.release(execution.connection_healthy);
                    match execution.result {
                        NormalizedResult::Failure(failure) => failure,
                        result => return self.marshaler.marshal(result, start.elapsed()),
                    }
                }
            };

            if self.retry.should_retry(&failure, attempt) {
                warn!(attempt, kind = %failure.kind, "Retrying after connection failure");
                attempt += 1;
                continue;
            }
            return ResponseEnvelope::failure(failure, start.elapsed());
        }
    }

    async fn list_tables(&self, backend_id: &str, schema: Option<&str>) -> ResponseEnvelope {
        let start = Instant::now();
        let mut guard = match self.pools.acquire(backend_id).await {
            Ok(guard) => guard,
            Err(err) => return ResponseEnvelope::failure(Failure::rejected(&err), start.elapsed()),
        };
        let outcome = timeout(
            self.executor.default_timeout(),
            SchemaInspector::list_tables(&mut guard, schema),
        )
        .await;
        match finish_catalog(guard, outcome, start).await {
            Ok(tables) => self.marshaler.marshal_tables(tables, start.elapsed()),
            Err(failure) => ResponseEnvelope::failure(failure, start.elapsed()),
        }
    }

    async fn describe_table(
        &self,
        backend_id: &str,
        table: &str,
        schema: Option<&str>,
        backend_name: &str,
    ) -> ResponseEnvelope {
        let start = Instant::now();
        let mut guard = match self.pools.acquire(backend_id).await {
            Ok(guard) => guard,
            Err(err) => return ResponseEnvelope::failure(Failure::rejected(&err), start.elapsed()),
        };
        let outcome = timeout(
            self.executor.default_timeout(),
            SchemaInspector::describe_table(&mut guard, table, schema),
        )
        .await;
        match finish_catalog(guard, outcome, start).await {
            Ok(description) => {
                self.marshaler
                    .marshal_table(description, backend_name, start.elapsed())
            }
            Err(failure) => ResponseEnvelope::failure(failure, start.elapsed()),
        }
    }

    /// Configured backends with their pool counters.
    pub fn list_backends(&self) -> Vec<BackendSummary> {
        self.pools
            .backends()
            .map(|config| BackendSummary {
                id: config.id.clone(),
                kind: config.kind,
                target: config.masked_url(),
                database: config.database.clone(),
                writable: config.writable,
                server_level: config.is_server_level(),
                pool: self.pools.stats(&config.id).unwrap_or(PoolStats {
                    open: 0,
                    idle: 0,
                    in_use: 0,
                    max_size: config.max_pool_size as usize,
                    closed: true,
                }),
            })
            .collect()
    }

    /// Close every pool; see [`PoolManager::shutdown`].
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.pools.shutdown(grace).await
    }
}

/// Release a connection used for a catalog query and classify the outcome.
/// Catalog queries only read, so failures never carry a side effect.
async fn finish_catalog<T>(
    guard: BackendGuard,
    outcome: Result<DbResult<T>, Elapsed>,
    start: Instant,
) -> Result<T, Failure> {
    match outcome {
        Ok(Ok(value)) => {
            guard.release(true);
            Ok(value)
        }
        Ok(Err(err)) => {
            debug!(kind = %err.kind(), error = %err, "Catalog query failed");
            guard.release(!err.breaks_connection());
            Err(Failure::from_error(&err, false))
        }
        Err(_) => {
            match timeout(CATALOG_CANCEL_BUDGET, guard.cancel()).await {
                Ok(Err(e)) => debug!(error = %e, "Cancel after catalog timeout failed"),
                Err(_) => debug!("Cancel after catalog timeout timed out"),
                Ok(Ok(())) => {}
            }
            guard.release(false);
            let err = DbError::timeout(
                "schema introspection",
                start.elapsed().as_millis() as u64,
            );
            Err(Failure::from_error(&err, false))
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("pools", &self.pools)
            .field("executor", &self.executor)
            .field("retry", &self.retry)
            .finish()
    }
}
