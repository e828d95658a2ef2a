//! Statement classification.
//!
//! Parses SQL with [sqlparser](https://docs.rs/sqlparser/) in the backend's
//! dialect to count statements and decide whether a statement can modify
//! data. The result feeds two decisions:
//!
//! - early rejection of writes against read-only backends
//! - the `side_effect_possible` flag on failures
//!
//! Classification is advisory. Text that does not parse is still sent to the
//! backend, which is the authority on syntax, and non-writable backends are
//! enforced by a read-only session regardless.

use crate::models::BackendKind;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

/// Broad category of a parsed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementCategory {
    /// SELECT, SHOW, DESCRIBE, VALUES, EXPLAIN of a read
    Read,
    /// INSERT, UPDATE, DELETE, MERGE, COPY
    DmlWrite,
    /// CREATE, DROP, ALTER, TRUNCATE, COMMENT
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    Transaction,
    /// CALL, EXECUTE, PREPARE
    ProcedureCall,
    /// GRANT, SET, LOCK, VACUUM and friends
    Administrative,
    Unknown,
}

/// What the parser could tell about a piece of SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Number of statements, or `None` when the text did not parse
    pub statements: Option<usize>,
    /// True only when every statement provably leaves data untouched
    pub read_only: bool,
    /// Leading keyword of the first statement that is not read-only
    pub operation: Option<&'static str>,
}

impl Classification {
    fn unparsed() -> Self {
        Self {
            statements: None,
            read_only: false,
            operation: None,
        }
    }

    pub fn is_single_statement(&self) -> bool {
        self.statements.is_none_or(|n| n == 1)
    }
}

fn dialect_for(kind: BackendKind) -> Box<dyn Dialect> {
    match kind {
        BackendKind::PostgreSQL => Box::new(PostgreSqlDialect {}),
        BackendKind::MySQL => Box::new(MySqlDialect {}),
    }
}

/// Classify `sql` as the given backend would parse it.
pub fn classify(sql: &str, kind: BackendKind) -> Classification {
    let dialect = dialect_for(kind);
    let Ok(statements) = Parser::parse_sql(dialect.as_ref(), sql) else {
        return Classification::unparsed();
    };

    let writer = statements
        .iter()
        .map(categorize)
        .find(|(category, _)| *category != StatementCategory::Read);

    Classification {
        statements: Some(statements.len()),
        read_only: !statements.is_empty() && writer.is_none(),
        operation: writer.map(|(_, name)| name),
    }
}

/// A query is read-only unless it writes through a CTE, creates a table with
/// `SELECT INTO`, or takes row locks.
fn query_is_read_only(query: &Query) -> bool {
    let ctes_read_only = query
        .with
        .as_ref()
        .is_none_or(|with| with.cte_tables.iter().all(|cte| query_is_read_only(&cte.query)));
    ctes_read_only && query.locks.is_empty() && set_expr_is_read_only(&query.body)
}

fn set_expr_is_read_only(expr: &SetExpr) -> bool {
    match expr {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => query_is_read_only(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}

/// Categorize a parsed statement and name its leading keyword.
pub fn categorize(stmt: &Statement) -> (StatementCategory, &'static str) {
    use StatementCategory::*;

    match stmt {
        // =====================================================================
        // Reads
        // =====================================================================
        Statement::Query(query) => {
            if query_is_read_only(query) {
                (Read, "SELECT")
            } else {
                (DmlWrite, "SELECT")
            }
        }
        Statement::ShowTables { .. } => (Read, "SHOW TABLES"),
        Statement::ShowColumns { .. } => (Read, "SHOW COLUMNS"),
        Statement::ShowDatabases { .. } => (Read, "SHOW DATABASES"),
        Statement::ShowSchemas { .. } => (Read, "SHOW SCHEMAS"),
        Statement::ShowCreate { .. } => (Read, "SHOW CREATE"),
        Statement::ShowFunctions { .. } => (Read, "SHOW FUNCTIONS"),
        Statement::ShowVariable { .. } => (Read, "SHOW"),
        Statement::ShowVariables { .. } => (Read, "SHOW VARIABLES"),
        Statement::ShowStatus { .. } => (Read, "SHOW STATUS"),
        Statement::ShowCollation { .. } => (Read, "SHOW COLLATION"),
        Statement::ExplainTable { .. } => (Read, "DESCRIBE"),

        // EXPLAIN plans without running; EXPLAIN ANALYZE runs the statement
        Statement::Explain {
            statement, analyze, ..
        } => {
            let (inner, name) = categorize(statement);
            if inner == Read || !*analyze {
                (Read, "EXPLAIN")
            } else {
                (inner, name)
            }
        }

        // =====================================================================
        // DML writes
        // =====================================================================
        Statement::Insert(_) => (DmlWrite, "INSERT"),
        Statement::Update { .. } => (DmlWrite, "UPDATE"),
        Statement::Delete(_) => (DmlWrite, "DELETE"),
        Statement::Merge { .. } => (DmlWrite, "MERGE"),
        Statement::Copy { .. } => (DmlWrite, "COPY"),

        // =====================================================================
        // DDL
        // =====================================================================
        Statement::CreateTable { .. } => (Ddl, "CREATE TABLE"),
        Statement::CreateView { .. } => (Ddl, "CREATE VIEW"),
        Statement::CreateIndex(_) => (Ddl, "CREATE INDEX"),
        Statement::CreateSchema { .. } => (Ddl, "CREATE SCHEMA"),
        Statement::CreateDatabase { .. } => (Ddl, "CREATE DATABASE"),
        Statement::CreateSequence { .. } => (Ddl, "CREATE SEQUENCE"),
        Statement::CreateType { .. } => (Ddl, "CREATE TYPE"),
        Statement::CreateFunction { .. } => (Ddl, "CREATE FUNCTION"),
        Statement::CreateProcedure { .. } => (Ddl, "CREATE PROCEDURE"),
        Statement::CreateTrigger { .. } => (Ddl, "CREATE TRIGGER"),
        Statement::CreateRole { .. } => (Ddl, "CREATE ROLE"),
        Statement::CreateExtension { .. } => (Ddl, "CREATE EXTENSION"),
        Statement::AlterTable { .. } => (Ddl, "ALTER TABLE"),
        Statement::AlterView { .. } => (Ddl, "ALTER VIEW"),
        Statement::AlterIndex { .. } => (Ddl, "ALTER INDEX"),
        Statement::AlterRole { .. } => (Ddl, "ALTER ROLE"),
        Statement::Drop { .. } => (Ddl, "DROP"),
        Statement::DropFunction { .. } => (Ddl, "DROP FUNCTION"),
        Statement::DropProcedure { .. } => (Ddl, "DROP PROCEDURE"),
        Statement::DropTrigger { .. } => (Ddl, "DROP TRIGGER"),
        Statement::Truncate { .. } => (Ddl, "TRUNCATE"),
        Statement::Comment { .. } => (Ddl, "COMMENT"),

        // =====================================================================
        // Transaction control
        // =====================================================================
        Statement::StartTransaction { .. } => (Transaction, "BEGIN"),
        Statement::Commit { .. } => (Transaction, "COMMIT"),
        Statement::Rollback { .. } => (Transaction, "ROLLBACK"),
        Statement::Savepoint { .. } => (Transaction, "SAVEPOINT"),
        Statement::ReleaseSavepoint { .. } => (Transaction, "RELEASE SAVEPOINT"),

        // =====================================================================
        // Procedures (behaviour cannot be verified)
        // =====================================================================
        Statement::Call { .. } => (ProcedureCall, "CALL"),
        Statement::Execute { .. } => (ProcedureCall, "EXECUTE"),
        Statement::Prepare { .. } => (ProcedureCall, "PREPARE"),
        Statement::Deallocate { .. } => (ProcedureCall, "DEALLOCATE"),

        // =====================================================================
        // Administrative
        // =====================================================================
        Statement::Grant { .. } => (Administrative, "GRANT"),
        Statement::Revoke { .. } => (Administrative, "REVOKE"),
        Statement::Set(_) => (Administrative, "SET"),
        Statement::Use(_) => (Administrative, "USE"),
        Statement::Kill { .. } => (Administrative, "KILL"),
        Statement::Vacuum { .. } => (Administrative, "VACUUM"),
        Statement::Analyze { .. } => (Administrative, "ANALYZE"),
        Statement::Discard { .. } => (Administrative, "DISCARD"),
        Statement::LockTables { .. } => (Administrative, "LOCK"),
        Statement::UnlockTables => (Administrative, "UNLOCK"),
        Statement::Flush { .. } => (Administrative, "FLUSH"),
        Statement::OptimizeTable { .. } => (Administrative, "OPTIMIZE"),
        Statement::LISTEN { .. } => (Administrative, "LISTEN"),
        Statement::UNLISTEN { .. } => (Administrative, "UNLISTEN"),
        Statement::NOTIFY { .. } => (Administrative, "NOTIFY"),

        _ => (Unknown, "statement"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PG: BackendKind = BackendKind::PostgreSQL;
    const MY: BackendKind = BackendKind::MySQL;

    #[test]
    fn test_select_is_read_only() {
        let c = classify("SELECT * FROM users WHERE id = $1", PG);
        assert_eq!(c.statements, Some(1));
        assert!(c.read_only);
        assert_eq!(c.operation, None);
    }

    #[test]
    fn test_mysql_placeholders_parse() {
        let c = classify("SELECT name FROM users WHERE id = ? AND active = ?", MY);
        assert_eq!(c.statements, Some(1));
        assert!(c.read_only);
    }

    #[test]
    fn test_writes_are_not_read_only() {
        for sql in [
            "INSERT INTO users VALUES (1)",
            "UPDATE users SET name = 'x'",
            "DELETE FROM users",
            "CREATE TABLE t (id INT)",
            "DROP TABLE users",
            "TRUNCATE TABLE users",
            "GRANT SELECT ON users TO bob",
        ] {
            let c = classify(sql, PG);
            assert!(!c.read_only, "{sql} should not be read-only");
            assert!(c.operation.is_some(), "{sql} should name its operation");
        }
        assert_eq!(classify("INSERT INTO t VALUES (1)", MY).operation, Some("INSERT"));
    }

    #[test]
    fn test_show_and_describe_are_reads() {
        assert!(classify("SHOW TABLES", MY).read_only);
        assert!(classify("DESCRIBE users", MY).read_only);
        assert!(classify("SHOW search_path", PG).read_only);
    }

    #[test]
    fn test_explain() {
        assert!(classify("EXPLAIN SELECT * FROM users", PG).read_only);
        assert!(classify("EXPLAIN DELETE FROM users", PG).read_only);
        assert!(!classify("EXPLAIN ANALYZE DELETE FROM users", PG).read_only);
    }

    #[test]
    fn test_writing_cte_is_not_read_only() {
        let sql = "WITH gone AS (DELETE FROM users RETURNING id) SELECT count(*) FROM gone";
        let c = classify(sql, PG);
        assert_eq!(c.statements, Some(1));
        assert!(!c.read_only);
    }

    #[test]
    fn test_select_into_and_locks_are_not_read_only() {
        assert!(!classify("SELECT * INTO backup FROM users", PG).read_only);
        assert!(!classify("SELECT * FROM users FOR UPDATE", PG).read_only);
    }

    #[test]
    fn test_union_of_reads() {
        assert!(classify("SELECT a FROM t1 UNION ALL SELECT b FROM t2", PG).read_only);
    }

    #[test]
    fn test_statement_count() {
        let c = classify("SELECT 1; SELECT 2", PG);
        assert_eq!(c.statements, Some(2));
        assert!(!c.is_single_statement());

        let c = classify("SELECT 1; INSERT INTO users VALUES (1)", PG);
        assert!(!c.read_only);
        assert_eq!(c.operation, Some("INSERT"));
    }

    #[test]
    fn test_unparseable_is_not_read_only() {
        let c = classify("SELEC * FORM users", PG);
        assert_eq!(c.statements, None);
        assert!(!c.read_only);
        assert!(c.is_single_statement());
    }

    #[test]
    fn test_empty_input_is_not_read_only() {
        let c = classify("", PG);
        assert_eq!(c.statements, Some(0));
        assert!(!c.read_only);
    }
}
