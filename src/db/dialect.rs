//! Dialect adapter.
//!
//! [`DialectConnection`] is the closed set of supported backends. Every
//! operation is one `match` through [`dispatch_dialect!`] into a pair of
//! parallel submodules, so differences between MySQL and PostgreSQL stay
//! side by side.
//!
//! SQL text is never interpolated with caller data. Parameters are always
//! bound, and statements are prepared unnamed (`persistent(false)`) so no
//! cached plan outlives a schema change.

use crate::db::types::{RowDecoder, categorize_type};
use crate::dispatch_dialect;
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{BackendConfig, BackendKind, ColumnShape, RowSet, Scalar, StatementParam};
use futures_util::TryStreamExt;
use sqlx::{Column, Connection, Either, Executor, TypeInfo};
use tracing::{debug, warn};

/// Application name reported to the backend.
const APPLICATION_NAME: &str = "sql-explorer-mcp";

/// What a statement produced before normalization into a result envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Rows(RowSet),
    Affected {
        rows_affected: u64,
        last_insert_id: Option<u64>,
    },
}

/// A live session on one backend.
pub enum DialectConnection {
    MySql(mysql::MySqlSession),
    Postgres(postgres::PgSession),
}

impl DialectConnection {
    /// Open a session and apply per-session setup (read-only mode, time zone).
    pub async fn connect(config: &BackendConfig) -> DbResult<Self> {
        match config.kind {
            BackendKind::MySQL => mysql::connect(config).await.map(Self::MySql),
            BackendKind::PostgreSQL => postgres::connect(config).await.map(Self::Postgres),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::MySql(_) => BackendKind::MySQL,
            Self::Postgres(_) => BackendKind::PostgreSQL,
        }
    }

    /// Backend pid (PostgreSQL) or thread id (MySQL).
    pub fn session_id(&self) -> Option<u64> {
        dispatch_dialect!(self, {
            MySql(s) => s.thread_id,
            Postgres(s) => s.backend_pid,
        })
    }

    /// Run one statement, decoding at most `row_cap` rows.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[StatementParam],
        row_cap: usize,
    ) -> DbResult<StatementOutcome> {
        dispatch_dialect!(self, {
            MySql(s) => mysql::execute(s, sql, params, row_cap).await,
            Postgres(s) => postgres::execute(s, sql, params, row_cap).await,
        })
    }

    /// Column names, tags and nullability of a statement's result, without
    /// running it. Empty for statements that return no rows.
    pub async fn describe_result_shape(&mut self, sql: &str) -> DbResult<Vec<ColumnShape>> {
        dispatch_dialect!(self, {
            MySql(s) => mysql::describe_result_shape(s, sql).await,
            Postgres(s) => postgres::describe_result_shape(s, sql).await,
        })
    }

    /// Ask the backend to abandon whatever this session is running. Uses a
    /// short-lived side connection.
    pub async fn cancel(&self) -> DbResult<()> {
        dispatch_dialect!(self, {
            MySql(s) => mysql::cancel(s).await,
            Postgres(s) => postgres::cancel(s).await,
        })
    }

    /// Kill a session by id from a side connection.
    pub async fn terminate(config: &BackendConfig, session_id: u64) -> DbResult<()> {
        match config.kind {
            BackendKind::MySQL => mysql::terminate(config, session_id).await,
            BackendKind::PostgreSQL => postgres::terminate(config, session_id).await,
        }
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        dispatch_dialect!(self, {
            MySql(s) => s.conn.ping().await.map_err(DbError::from),
            Postgres(s) => s.conn.ping().await.map_err(DbError::from),
        })
    }

    pub async fn close(self) {
        let result = dispatch_dialect!(self, {
            MySql(s) => s.conn.close().await,
            Postgres(s) => s.conn.close().await,
        });
        if let Err(e) = result {
            debug!(error = %e, "Connection close was not clean");
        }
    }
}

impl std::fmt::Debug for DialectConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialectConnection")
            .field("kind", &self.kind())
            .field("session_id", &self.session_id())
            .finish()
    }
}

// =============================================================================
// Error Translation
// =============================================================================

/// Classify any sqlx error into the caller-facing taxonomy.
pub fn translate_error(err: &sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db_err) => {
            if let Some(pg) = db_err.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
                let code = pg.code();
                let message = match pg.detail() {
                    Some(detail) => format!("{} ({})", pg.message(), detail),
                    None => pg.message().to_string(),
                };
                return DbError::database(classify_sqlstate(code), message, Some(code.to_string()));
            }
            if let Some(my) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                let number = my.number();
                return DbError::database(
                    classify_mysql_error(number),
                    my.message(),
                    Some(number.to_string()),
                );
            }
            DbError::database(
                ErrorKind::Unknown,
                db_err.message(),
                db_err.code().map(|c| c.to_string()),
            )
        }
        sqlx::Error::Io(e) => DbError::connection_lost(format!("I/O error: {}", e)),
        sqlx::Error::Tls(e) => DbError::connection_lost(format!("TLS error: {}", e)),
        sqlx::Error::Protocol(msg) => DbError::connection_lost(format!("Protocol error: {}", msg)),
        sqlx::Error::WorkerCrashed => DbError::connection_lost("Database driver worker crashed"),
        sqlx::Error::PoolTimedOut => DbError::pool_exhausted("driver", 0),
        other => DbError::internal(other.to_string()),
    }
}

/// Map a PostgreSQL SQLSTATE onto an [`ErrorKind`].
pub fn classify_sqlstate(code: &str) -> ErrorKind {
    match code {
        "42501" | "25006" => ErrorKind::PermissionDenied,
        "57014" => ErrorKind::Timeout,
        "57P01" | "57P02" | "57P03" => ErrorKind::ConnectionLost,
        c if c.starts_with("42") => ErrorKind::SyntaxError,
        c if c.starts_with("23") => ErrorKind::ConstraintViolation,
        c if c.starts_with("28") => ErrorKind::PermissionDenied,
        c if c.starts_with("08") => ErrorKind::ConnectionLost,
        _ => ErrorKind::Unknown,
    }
}

/// Map a MySQL server error number onto an [`ErrorKind`].
pub fn classify_mysql_error(number: u16) -> ErrorKind {
    match number {
        1064 | 1149 | 1054 | 1146 | 1305 | 1128 => ErrorKind::SyntaxError,
        1062 | 1451 | 1452 | 1048 | 1364 | 3819 | 1216 | 1217 => ErrorKind::ConstraintViolation,
        1044 | 1045 | 1142 | 1143 | 1227 | 1792 | 1290 => ErrorKind::PermissionDenied,
        2006 | 2013 | 1053 | 1927 => ErrorKind::ConnectionLost,
        3024 | 1317 | 1205 => ErrorKind::Timeout,
        _ => ErrorKind::Unknown,
    }
}

/// Turn a refused connection into `ConnectionFailed` with a targeted hint.
fn connect_error(config: &BackendConfig, err: sqlx::Error) -> DbError {
    let target = config.masked_url();
    let message = format!("Failed to connect to {}: {}", target, err);

    let code = match &err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    };
    let mysql_number = match &err {
        sqlx::Error::Database(db_err) => db_err
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .map(|e| e.number()),
        _ => None,
    };

    let suggestion = match (&err, code.as_deref(), mysql_number) {
        (_, Some("28P01" | "28000"), _) | (_, _, Some(1045)) => {
            "Authentication failed. Check the username and password".to_string()
        }
        (_, Some("3D000"), _) | (_, _, Some(1049)) => format!(
            "Database '{}' does not exist on the server",
            config.database.as_deref().unwrap_or_default()
        ),
        (sqlx::Error::Io(_), _, _) => format!(
            "Check that {}:{} is reachable and the server is running",
            config.host, config.port
        ),
        (sqlx::Error::Tls(_), _, _) => "TLS negotiation failed. Check the ssl mode".to_string(),
        _ => "Check the connection URL and server status".to_string(),
    };

    DbError::connection_failed(message, suggestion)
}

// =============================================================================
// Shared Row Accumulation
// =============================================================================

/// Collects rows as they stream in, stopping one row past the cap.
#[derive(Default)]
struct Accumulator {
    columns: Option<Vec<ColumnShape>>,
    rows: Vec<Vec<Scalar>>,
    truncated: bool,
    rows_affected: u64,
    last_insert_id: Option<u64>,
}

impl Accumulator {
    /// Returns false once the cap is exceeded and streaming should stop.
    fn push_row<R: RowDecoder>(&mut self, row: &R, row_cap: usize) -> bool {
        if self.columns.is_none() {
            self.columns = Some(row.column_shapes());
        }
        if self.rows.len() >= row_cap {
            self.truncated = true;
            return false;
        }
        self.rows.push(row.to_scalars());
        true
    }

    fn push_done(&mut self, rows_affected: u64, last_insert_id: Option<u64>) {
        self.rows_affected += rows_affected;
        if last_insert_id.is_some() {
            self.last_insert_id = last_insert_id;
        }
    }

    /// True when nothing tells a zero-row result set from a non-row statement.
    fn needs_shape(&self) -> bool {
        self.columns.is_none() && self.rows_affected == 0
    }

    fn finish(self, described: Option<Vec<ColumnShape>>) -> StatementOutcome {
        match self.columns.or(described.filter(|c| !c.is_empty())) {
            Some(columns) => StatementOutcome::Rows(RowSet {
                columns,
                rows: self.rows,
                truncated: self.truncated,
            }),
            None => StatementOutcome::Affected {
                rows_affected: self.rows_affected,
                last_insert_id: self.last_insert_id,
            },
        }
    }
}

fn shapes_from_describe<DB: sqlx::Database>(describe: &sqlx::Describe<DB>) -> Vec<ColumnShape> {
    describe
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let type_name = col.type_info().name();
            ColumnShape::new(col.name(), categorize_type(type_name), type_name)
                .with_nullable(describe.nullable(idx))
        })
        .collect()
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

pub mod mysql {
    use super::*;
    use sqlx::MySqlConnection;
    use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlSslMode};
    use sqlx::query::Query;

    /// Server refuses to prepare this statement type (ER_UNSUPPORTED_PS).
    const ER_UNSUPPORTED_PS: u16 = 1295;

    pub struct MySqlSession {
        pub(crate) conn: MySqlConnection,
        pub(super) thread_id: Option<u64>,
        options: MySqlConnectOptions,
    }

    pub fn connect_options(config: &BackendConfig) -> DbResult<MySqlConnectOptions> {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.credentials.username)
            .charset("utf8mb4")
            .timezone(Some(String::from("+00:00")));
        if let Some(password) = &config.credentials.password {
            options = options.password(password);
        }
        if let Some(database) = &config.database {
            options = options.database(database);
        }
        if let Some(mode) = &config.ssl_mode {
            let mode: MySqlSslMode = mode.parse().map_err(|e| {
                DbError::config(format!("Invalid ssl-mode '{}' for MySQL: {}", mode, e))
            })?;
            options = options.ssl_mode(mode);
        }
        Ok(options)
    }

    pub async fn connect(config: &BackendConfig) -> DbResult<MySqlSession> {
        let options = connect_options(config)?;
        let mut conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| connect_error(config, e))?;

        let thread_id = match sqlx::query_scalar::<_, u64>("SELECT CONNECTION_ID()")
            .fetch_one(&mut conn)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(backend_id = %config.id, error = %e, "Could not read MySQL thread id");
                None
            }
        };

        if !config.writable {
            if let Err(e) = conn.execute("SET SESSION TRANSACTION READ ONLY").await {
                let _ = conn.close().await;
                return Err(translate_error(&e));
            }
        }

        Ok(MySqlSession {
            conn,
            thread_id,
            options,
        })
    }

    pub fn prepare_and_bind<'q>(
        sql: &'q str,
        params: &'q [StatementParam],
    ) -> Query<'q, sqlx::MySql, MySqlArguments> {
        let mut query = sqlx::query(sql).persistent(false);
        for param in params {
            query = bind_param(query, param);
        }
        query
    }

    fn bind_param<'q>(
        query: Query<'q, sqlx::MySql, MySqlArguments>,
        param: &'q StatementParam,
    ) -> Query<'q, sqlx::MySql, MySqlArguments> {
        match param {
            StatementParam::Null => query.bind(None::<String>),
            StatementParam::Bool(v) => query.bind(*v),
            StatementParam::Int(v) => query.bind(*v),
            StatementParam::Float(v) => query.bind(*v),
            StatementParam::Text(v) => query.bind(v.as_str()),
            StatementParam::Bytes { base64 } => query.bind(base64.as_slice()),
        }
    }

    pub async fn execute(
        s: &mut MySqlSession,
        sql: &str,
        params: &[StatementParam],
        row_cap: usize,
    ) -> DbResult<StatementOutcome> {
        let acc = match stream_rows(s, sql, params, row_cap).await {
            Err(e) if params.is_empty() && is_unpreparable(&e) => {
                // Some statements (e.g. LOCK, some admin commands) only run
                // over the text protocol
                debug!("Statement cannot be prepared, retrying over text protocol");
                let acc = stream_text(s, sql, row_cap).await?;
                return Ok(acc.finish(None));
            }
            result => result?,
        };

        let described = if acc.needs_shape() {
            describe_result_shape(s, sql).await.ok()
        } else {
            None
        };
        Ok(acc.finish(described))
    }

    async fn stream_rows(
        s: &mut MySqlSession,
        sql: &str,
        params: &[StatementParam],
        row_cap: usize,
    ) -> Result<Accumulator, sqlx::Error> {
        let mut acc = Accumulator::default();
        let mut stream = (&mut s.conn).fetch_many(prepare_and_bind(sql, params));
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    let id = done.last_insert_id();
                    acc.push_done(done.rows_affected(), (id != 0).then_some(id));
                }
                Either::Right(row) => {
                    if !acc.push_row(&row, row_cap) {
                        break;
                    }
                }
            }
        }
        Ok(acc)
    }

    async fn stream_text(
        s: &mut MySqlSession,
        sql: &str,
        row_cap: usize,
    ) -> Result<Accumulator, sqlx::Error> {
        let mut acc = Accumulator::default();
        let mut stream = (&mut s.conn).fetch_many(sql);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => {
                    let id = done.last_insert_id();
                    acc.push_done(done.rows_affected(), (id != 0).then_some(id));
                }
                Either::Right(row) => {
                    if !acc.push_row(&row, row_cap) {
                        break;
                    }
                }
            }
        }
        Ok(acc)
    }

    fn is_unpreparable(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => db_err
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .is_some_and(|e| e.number() == ER_UNSUPPORTED_PS),
            _ => false,
        }
    }

    pub async fn describe_result_shape(
        s: &mut MySqlSession,
        sql: &str,
    ) -> DbResult<Vec<ColumnShape>> {
        let describe = (&mut s.conn).describe(sql).await?;
        Ok(shapes_from_describe(&describe))
    }

    async fn side_statement(options: &MySqlConnectOptions, sql: &str) -> DbResult<()> {
        let mut side = MySqlConnection::connect_with(options).await?;
        let result = side.execute(sql).await;
        let _ = side.close().await;
        result.map(|_| ()).map_err(DbError::from)
    }

    pub async fn cancel(s: &MySqlSession) -> DbResult<()> {
        let Some(thread_id) = s.thread_id else {
            return Err(DbError::internal("No MySQL thread id to cancel"));
        };
        // KILL takes no placeholders; the id is an integer we read ourselves
        side_statement(&s.options, &format!("KILL QUERY {}", thread_id)).await
    }

    pub async fn terminate(config: &BackendConfig, thread_id: u64) -> DbResult<()> {
        let options = connect_options(config)?;
        side_statement(&options, &format!("KILL CONNECTION {}", thread_id)).await
    }
}

pub mod postgres {
    use super::*;
    use sqlx::PgConnection;
    use sqlx::postgres::{PgArguments, PgConnectOptions, PgSslMode};
    use sqlx::query::Query;

    pub struct PgSession {
        pub(crate) conn: PgConnection,
        pub(super) backend_pid: Option<u64>,
        options: PgConnectOptions,
    }

    pub fn connect_options(config: &BackendConfig) -> DbResult<PgConnectOptions> {
        let mut options = PgConnectOptions::new_without_pgpass()
            .host(&config.host)
            .port(config.port)
            .username(&config.credentials.username)
            .application_name(APPLICATION_NAME);
        if let Some(password) = &config.credentials.password {
            options = options.password(password);
        }
        if let Some(database) = &config.database {
            options = options.database(database);
        }
        if let Some(mode) = &config.ssl_mode {
            let mode: PgSslMode = mode.parse().map_err(|e| {
                DbError::config(format!("Invalid sslmode '{}' for PostgreSQL: {}", mode, e))
            })?;
            options = options.ssl_mode(mode);
        }
        Ok(options)
    }

    pub async fn connect(config: &BackendConfig) -> DbResult<PgSession> {
        let options = connect_options(config)?;
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| connect_error(config, e))?;

        let backend_pid = match sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await
        {
            Ok(pid) => u64::try_from(pid).ok(),
            Err(e) => {
                warn!(backend_id = %config.id, error = %e, "Could not read PostgreSQL backend pid");
                None
            }
        };

        if !config.writable {
            if let Err(e) = conn
                .execute("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                .await
            {
                let _ = conn.close().await;
                return Err(translate_error(&e));
            }
        }

        Ok(PgSession {
            conn,
            backend_pid,
            options,
        })
    }

    pub fn prepare_and_bind<'q>(
        sql: &'q str,
        params: &'q [StatementParam],
    ) -> Query<'q, sqlx::Postgres, PgArguments> {
        let mut query = sqlx::query(sql).persistent(false);
        for param in params {
            query = bind_param(query, param);
        }
        query
    }

    fn bind_param<'q>(
        query: Query<'q, sqlx::Postgres, PgArguments>,
        param: &'q StatementParam,
    ) -> Query<'q, sqlx::Postgres, PgArguments> {
        match param {
            StatementParam::Null => query.bind(None::<String>),
            StatementParam::Bool(v) => query.bind(*v),
            StatementParam::Int(v) => query.bind(*v),
            StatementParam::Float(v) => query.bind(*v),
            StatementParam::Text(v) => query.bind(v.as_str()),
            StatementParam::Bytes { base64 } => query.bind(base64.as_slice()),
        }
    }

    pub async fn execute(
        s: &mut PgSession,
        sql: &str,
        params: &[StatementParam],
        row_cap: usize,
    ) -> DbResult<StatementOutcome> {
        let mut acc = Accumulator::default();
        {
            let mut stream = (&mut s.conn).fetch_many(prepare_and_bind(sql, params));
            while let Some(item) = stream.try_next().await? {
                match item {
                    Either::Left(done) => acc.push_done(done.rows_affected(), None),
                    Either::Right(row) => {
                        if !acc.push_row(&row, row_cap) {
                            break;
                        }
                    }
                }
            }
        }

        let described = if acc.needs_shape() {
            describe_result_shape(s, sql).await.ok()
        } else {
            None
        };
        Ok(acc.finish(described))
    }

    pub async fn describe_result_shape(
        s: &mut PgSession,
        sql: &str,
    ) -> DbResult<Vec<ColumnShape>> {
        let describe = (&mut s.conn).describe(sql).await?;
        Ok(shapes_from_describe(&describe))
    }

    async fn side_call(options: &PgConnectOptions, function: &str, pid: u64) -> DbResult<()> {
        let pid = i32::try_from(pid)
            .map_err(|_| DbError::internal(format!("Backend pid {} out of range", pid)))?;
        let mut side = PgConnection::connect_with(options).await?;
        let sql = format!("SELECT {}($1)", function);
        let result = sqlx::query_scalar::<_, bool>(&sql)
            .bind(pid)
            .fetch_one(&mut side)
            .await;
        let _ = side.close().await;
        match result? {
            true => Ok(()),
            false => Err(DbError::internal(format!(
                "{} found no session with pid {}",
                function, pid
            ))),
        }
    }

    pub async fn cancel(s: &PgSession) -> DbResult<()> {
        let Some(pid) = s.backend_pid else {
            return Err(DbError::internal("No PostgreSQL backend pid to cancel"));
        };
        side_call(&s.options, "pg_cancel_backend", pid).await
    }

    pub async fn terminate(config: &BackendConfig, pid: u64) -> DbResult<()> {
        let options = connect_options(config)?;
        side_call(&options, "pg_terminate_backend", pid).await
    }
}
