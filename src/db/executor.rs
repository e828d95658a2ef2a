//! Statement execution.
//!
//! [`StatementExecutor`] runs exactly one statement on a connection it has
//! been lent and reports whether that connection is still fit for reuse.
//! It never retries.
//!
//! - The statement runs under a wall-clock limit. On expiry the in-flight
//!   future is dropped, the backend is asked to cancel, and the connection
//!   is reported unhealthy so the pool destroys it.
//! - Row-producing statements stop decoding one row past the cap and mark
//!   the set truncated. The session is then settled with a ping so unread
//!   rows do not leak into the next checkout.

use crate::db::dialect::{DialectConnection, StatementOutcome};
use crate::error::{DbError, ErrorKind};
use crate::models::{
    DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_ROW_LIMIT, Failure, MAX_QUERY_TIMEOUT_SECS, MAX_ROW_LIMIT,
    NormalizedResult, StatementRequest,
};
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

/// Upper bound on the time spent asking the backend to cancel.
const CANCEL_BUDGET: Duration = Duration::from_secs(5);

/// Lower bound on the time allowed for settling a truncated session.
const MIN_SETTLE_BUDGET: Duration = Duration::from_millis(250);

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: NormalizedResult,
    /// False when the connection must be destroyed instead of reused
    pub connection_healthy: bool,
    pub elapsed: Duration,
}

/// Executes statements with a time limit and a row cap.
#[derive(Debug, Clone)]
pub struct StatementExecutor {
    default_timeout: Duration,
    default_row_cap: u32,
}

impl StatementExecutor {
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS as u64),
            default_row_cap: DEFAULT_ROW_LIMIT,
        }
    }

    /// Create an executor with custom defaults, clamped to the maximums.
    pub fn with_defaults(timeout_secs: u64, row_cap: u32) -> Self {
        Self {
            default_timeout: Duration::from_secs(
                timeout_secs.clamp(1, MAX_QUERY_TIMEOUT_SECS as u64),
            ),
            default_row_cap: row_cap.clamp(1, MAX_ROW_LIMIT),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn default_row_cap(&self) -> u32 {
        self.default_row_cap
    }

    /// Run `request` on `conn`.
    ///
    /// `read_only` is true when the statement is known not to modify data;
    /// it only affects the `side_effect_possible` flag on failures.
    pub async fn execute(
        &self,
        conn: &mut DialectConnection,
        request: &StatementRequest,
        time_limit: Option<Duration>,
        row_cap: Option<u32>,
        read_only: bool,
    ) -> Execution {
        let time_limit = time_limit.unwrap_or(self.default_timeout);
        let row_cap = row_cap
            .map(|c| c.clamp(1, MAX_ROW_LIMIT))
            .unwrap_or(self.default_row_cap) as usize;
        let start = Instant::now();
        let deadline = start + time_limit;

        debug!(
            backend_id = %request.backend_id,
            session_id = ?conn.session_id(),
            params = request.params.len(),
            row_cap,
            timeout_ms = time_limit.as_millis() as u64,
            "Executing statement"
        );

        let outcome = timeout(
            time_limit,
            conn.execute(&request.sql, &request.params, row_cap),
        )
        .await;

        match outcome {
            Err(_) => {
                let elapsed = start.elapsed();
                cancel_in_flight(conn).await;
                let err = DbError::timeout("statement", elapsed.as_millis() as u64);
                warn!(
                    backend_id = %request.backend_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Statement timed out"
                );
                Execution {
                    result: NormalizedResult::Failure(Failure::from_error(
                        &err,
                        side_effect_possible(&err, read_only),
                    )),
                    connection_healthy: false,
                    elapsed,
                }
            }
            Ok(Err(err)) => {
                let elapsed = start.elapsed();
                debug!(
                    backend_id = %request.backend_id,
                    kind = %err.kind(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Statement failed"
                );
                Execution {
                    connection_healthy: !err.breaks_connection(),
                    result: NormalizedResult::Failure(Failure::from_error(
                        &err,
                        side_effect_possible(&err, read_only),
                    )),
                    elapsed,
                }
            }
            Ok(Ok(StatementOutcome::Rows(set))) => {
                let connection_healthy = if set.truncated {
                    settle(conn, deadline).await
                } else {
                    true
                };
                let elapsed = start.elapsed();
                debug!(
                    backend_id = %request.backend_id,
                    rows = set.row_count(),
                    truncated = set.truncated,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Statement returned rows"
                );
                Execution {
                    result: NormalizedResult::Rows(set),
                    connection_healthy,
                    elapsed,
                }
            }
            Ok(Ok(StatementOutcome::Affected {
                rows_affected,
                last_insert_id,
            })) => {
                let elapsed = start.elapsed();
                debug!(
                    backend_id = %request.backend_id,
                    rows = rows_affected,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Statement completed"
                );
                Execution {
                    result: NormalizedResult::Affected {
                        rows_affected,
                        last_insert_id,
                    },
                    connection_healthy: true,
                    elapsed,
                }
            }
        }
    }
}

impl Default for StatementExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a failed statement may have changed data.
pub fn side_effect_possible(err: &DbError, read_only: bool) -> bool {
    let kind = err.kind();
    if kind.rejected_before_execution() {
        return false;
    }
    if matches!(kind, ErrorKind::SyntaxError | ErrorKind::PermissionDenied) {
        return false;
    }
    !read_only
}

async fn cancel_in_flight(conn: &DialectConnection) {
    match timeout(CANCEL_BUDGET, conn.cancel()).await {
        Ok(Ok(())) => debug!(session_id = ?conn.session_id(), "Cancelled in-flight statement"),
        Ok(Err(e)) => warn!(session_id = ?conn.session_id(), error = %e, "Cancel request failed"),
        Err(_) => warn!(session_id = ?conn.session_id(), "Cancel request timed out"),
    }
}

/// Drain what the backend still has queued for a truncated result.
async fn settle(conn: &mut DialectConnection, deadline: Instant) -> bool {
    let budget = deadline
        .saturating_duration_since(Instant::now())
        .max(MIN_SETTLE_BUDGET);
    match timeout(budget, conn.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "Settling truncated session failed");
            false
        }
        Err(_) => {
            debug!("Settling truncated session timed out");
            cancel_in_flight(conn).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_defaults_clamps() {
        let exec = StatementExecutor::with_defaults(0, 0);
        assert_eq!(exec.default_timeout(), Duration::from_secs(1));
        assert_eq!(exec.default_row_cap(), 1);

        let exec = StatementExecutor::with_defaults(10_000, 1_000_000);
        assert_eq!(
            exec.default_timeout(),
            Duration::from_secs(MAX_QUERY_TIMEOUT_SECS as u64)
        );
        assert_eq!(exec.default_row_cap(), MAX_ROW_LIMIT);
    }

    #[test]
    fn test_default_executor() {
        let exec = StatementExecutor::default();
        assert_eq!(exec.default_row_cap(), DEFAULT_ROW_LIMIT);
        assert_eq!(
            exec.default_timeout(),
            Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS as u64)
        );
    }

    #[test]
    fn test_side_effect_flag() {
        let syntax = DbError::database(ErrorKind::SyntaxError, "bad", Some("42601".into()));
        assert!(!side_effect_possible(&syntax, false));

        let denied = DbError::database(ErrorKind::PermissionDenied, "no", Some("42501".into()));
        assert!(!side_effect_possible(&denied, false));

        let exhausted = DbError::pool_exhausted("main", 100);
        assert!(!side_effect_possible(&exhausted, false));

        let lost = DbError::connection_lost("reset");
        assert!(side_effect_possible(&lost, false));
        assert!(!side_effect_possible(&lost, true));

        let timeout = DbError::timeout("statement", 30_000);
        assert!(side_effect_possible(&timeout, false));
        assert!(!side_effect_possible(&timeout, true));

        let constraint =
            DbError::database(ErrorKind::ConstraintViolation, "dup", Some("23505".into()));
        assert!(side_effect_possible(&constraint, false));
    }
}
