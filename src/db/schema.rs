//! Schema introspection.
//!
//! Lists tables and describes one table through `information_schema` and
//! the system catalogs. Every identifier supplied by a caller is bound as a
//! parameter. Row counts come from catalog estimates, never from `COUNT(*)`.
//!
//! # Architecture
//!
//! SQL queries are organized in the `queries` submodule with constants for
//! each database type. Database-specific implementations are in their
//! respective submodules, each providing the same interface.

use crate::db::dialect::DialectConnection;
use crate::dispatch_dialect;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDescription, ForeignKey, IndexInfo, TableDescription, TableSummary, TableType,
};
use tracing::debug;

/// Schema inspector over a borrowed session.
pub struct SchemaInspector;

impl SchemaInspector {
    /// List tables and views in `schema`, or in the session's default schema.
    pub async fn list_tables(
        conn: &mut DialectConnection,
        schema: Option<&str>,
    ) -> DbResult<Vec<TableSummary>> {
        dispatch_dialect!(conn, {
            MySql(s) => mysql::list_tables(&mut s.conn, schema).await,
            Postgres(s) => postgres::list_tables(&mut s.conn, schema).await,
        })
    }

    /// Describe one table. Unknown tables give a `NotFound` error.
    pub async fn describe_table(
        conn: &mut DialectConnection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableDescription> {
        dispatch_dialect!(conn, {
            MySql(s) => mysql::describe_table(&mut s.conn, table, schema).await,
            Postgres(s) => postgres::describe_table(&mut s.conn, table, schema).await,
        })
    }
}

fn table_not_found(table: &str, schema: Option<&str>) -> DbError {
    let qualified = match schema {
        Some(s) => format!("{}.{}", s, table),
        None => table.to_string(),
    };
    DbError::schema(format!("Table '{}' not found", qualified), qualified)
}

fn primary_keys_of(columns: &[ColumnDescription]) -> Vec<String> {
    columns
        .iter()
        .filter(|c| c.is_primary_key)
        .map(|c| c.name.clone())
        .collect()
}

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub mod postgres {
        pub const LIST_TABLES: &str = r#"
            SELECT
                t.table_name::text AS table_name,
                t.table_type::text AS table_type,
                CASE WHEN c.reltuples >= 0 THEN c.reltuples::bigint END AS estimated_rows
            FROM information_schema.tables t
            LEFT JOIN pg_namespace n ON n.nspname = t.table_schema
            LEFT JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = t.table_name
            WHERE t.table_schema = $1
            AND t.table_type IN ('BASE TABLE', 'VIEW', 'LOCAL TEMPORARY')
            ORDER BY t.table_name
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            c.column_name::text AS column_name,
            format_type(a.atttypid, a.atttypmod) AS column_type,
            c.is_nullable::text AS is_nullable,
            c.column_default::text AS column_default,
            CASE WHEN pk.column_name IS NOT NULL THEN true ELSE false END AS is_primary_key
        FROM information_schema.columns c
        JOIN pg_class t ON t.relname = c.table_name
        JOIN pg_namespace n ON n.oid = t.relnamespace AND n.nspname = c.table_schema
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
        LEFT JOIN (
            SELECT kcu.column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_name = $1
            AND tc.table_schema = $2
            AND tc.constraint_type = 'PRIMARY KEY'
        ) pk ON c.column_name = pk.column_name
        WHERE c.table_name = $1 AND c.table_schema = $2
        ORDER BY c.ordinal_position
        "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
        SELECT
            kcu.column_name::text AS column_name,
            ccu.table_name::text AS foreign_table_name,
            ccu.column_name::text AS foreign_column_name
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        JOIN information_schema.constraint_column_usage ccu
            ON ccu.constraint_name = tc.constraint_name
            AND ccu.table_schema = tc.table_schema
        WHERE tc.table_name = $1
        AND tc.table_schema = $2
        AND tc.constraint_type = 'FOREIGN KEY'
        ORDER BY kcu.ordinal_position
        "#;

        pub const DESCRIBE_INDEXES: &str = r#"
        SELECT
            i.relname::text AS index_name,
            array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum)) AS column_names,
            ix.indisunique AS is_unique,
            ix.indisprimary AS is_primary
        FROM pg_index ix
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_class t ON t.oid = ix.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE t.relname = $1 AND n.nspname = $2
        GROUP BY i.relname, ix.indisunique, ix.indisprimary
        ORDER BY i.relname
        "#;

        pub const ESTIMATED_ROWS: &str = r#"
        SELECT CASE WHEN c.reltuples >= 0 THEN c.reltuples::bigint END
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE c.relname = $1 AND n.nspname = $2
        "#;
    }

    pub mod mysql {
        pub const LIST_TABLES: &str = r#"
            SELECT
                CONVERT(TABLE_NAME USING utf8mb4) AS TABLE_NAME,
                CONVERT(TABLE_TYPE USING utf8mb4) AS TABLE_TYPE,
                CONVERT(TABLE_SCHEMA USING utf8mb4) AS TABLE_SCHEMA,
                TABLE_ROWS AS ESTIMATED_ROWS
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND TABLE_TYPE IN ('BASE TABLE', 'VIEW')
            ORDER BY TABLE_NAME
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8mb4) AS COLUMN_NAME,
            CONVERT(COLUMN_TYPE USING utf8mb4) AS COLUMN_TYPE,
            CONVERT(IS_NULLABLE USING utf8mb4) AS IS_NULLABLE,
            CONVERT(COLUMN_DEFAULT USING utf8mb4) AS COLUMN_DEFAULT,
            CONVERT(COLUMN_KEY USING utf8mb4) AS COLUMN_KEY,
            CONVERT(TABLE_SCHEMA USING utf8mb4) AS TABLE_SCHEMA
        FROM information_schema.COLUMNS
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = COALESCE(?, DATABASE())
        ORDER BY ORDINAL_POSITION
        "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8mb4) AS COLUMN_NAME,
            CONVERT(REFERENCED_TABLE_NAME USING utf8mb4) AS REFERENCED_TABLE_NAME,
            CONVERT(REFERENCED_COLUMN_NAME USING utf8mb4) AS REFERENCED_COLUMN_NAME
        FROM information_schema.KEY_COLUMN_USAGE
        WHERE TABLE_NAME = ?
        AND TABLE_SCHEMA = COALESCE(?, DATABASE())
        AND REFERENCED_TABLE_NAME IS NOT NULL
        ORDER BY ORDINAL_POSITION
        "#;

        pub const DESCRIBE_INDEXES: &str = r#"
        SELECT
            CONVERT(INDEX_NAME USING utf8mb4) AS INDEX_NAME,
            CONVERT(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX) USING utf8mb4) AS COLUMN_NAMES,
            MIN(NON_UNIQUE) AS NON_UNIQUE
        FROM information_schema.STATISTICS
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = COALESCE(?, DATABASE())
        GROUP BY INDEX_NAME
        ORDER BY INDEX_NAME
        "#;

        pub const ESTIMATED_ROWS: &str = r#"
        SELECT TABLE_ROWS
        FROM information_schema.TABLES
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = COALESCE(?, DATABASE())
        "#;
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod postgres {
    use super::*;
    use sqlx::{PgConnection, Row};

    const DEFAULT_SCHEMA: &str = "public";

    pub async fn list_tables(
        conn: &mut PgConnection,
        schema: Option<&str>,
    ) -> DbResult<Vec<TableSummary>> {
        let schema_name = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = sqlx::query(queries::postgres::LIST_TABLES)
            .bind(schema_name)
            .fetch_all(&mut *conn)
            .await?;

        let tables = rows
            .iter()
            .filter_map(|row| {
                let name: String = row.try_get("table_name").ok()?;
                let table_type: String = row.try_get("table_type").unwrap_or_default();
                let estimated: Option<i64> = row.try_get("estimated_rows").ok().flatten();
                Some(
                    TableSummary::new(name, TableType::parse(&table_type))
                        .with_schema(schema_name)
                        .with_estimated_rows(estimated.and_then(|n| u64::try_from(n).ok())),
                )
            })
            .collect::<Vec<_>>();

        debug!(
            count = tables.len(),
            schema = schema_name,
            "Listed PostgreSQL tables"
        );
        Ok(tables)
    }

    pub async fn describe_table(
        conn: &mut PgConnection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableDescription> {
        let schema_name = schema.unwrap_or(DEFAULT_SCHEMA);

        let columns = fetch_columns(conn, table, schema_name).await?;
        if columns.is_empty() {
            return Err(table_not_found(table, Some(schema_name)));
        }

        let foreign_keys = fetch_foreign_keys(conn, table, schema_name).await?;
        let indexes = fetch_indexes(conn, table, schema_name).await;
        let estimated_rows = sqlx::query_scalar::<_, Option<i64>>(queries::postgres::ESTIMATED_ROWS)
            .bind(table)
            .bind(schema_name)
            .fetch_optional(&mut *conn)
            .await?
            .flatten()
            .and_then(|n| u64::try_from(n).ok());

        let mut description = TableDescription::new(table);
        description.schema = Some(schema_name.to_string());
        description.primary_keys = primary_keys_of(&columns);
        description.columns = columns;
        description.foreign_keys = foreign_keys;
        description.indexes = indexes;
        description.estimated_rows = estimated_rows;
        Ok(description)
    }

    async fn fetch_columns(
        conn: &mut PgConnection,
        table: &str,
        schema_name: &str,
    ) -> DbResult<Vec<ColumnDescription>> {
        let rows = sqlx::query(queries::postgres::DESCRIBE_COLUMNS)
            .bind(table)
            .bind(schema_name)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.try_get("column_name").unwrap_or_default();
                let column_type: String = row.try_get("column_type").unwrap_or_default();
                let nullable: String = row.try_get("is_nullable").unwrap_or_default();
                let default: Option<String> = row.try_get("column_default").ok().flatten();
                let is_pk: bool = row.try_get("is_primary_key").unwrap_or(false);

                ColumnDescription::new(name, column_type, nullable == "YES")
                    .with_default(default)
                    .with_primary_key(is_pk)
            })
            .collect())
    }

    async fn fetch_foreign_keys(
        conn: &mut PgConnection,
        table: &str,
        schema_name: &str,
    ) -> DbResult<Vec<ForeignKey>> {
        let rows = sqlx::query(queries::postgres::DESCRIBE_FOREIGN_KEYS)
            .bind(table)
            .bind(schema_name)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let column: String = row.try_get("column_name").unwrap_or_default();
                let ref_table: String = row.try_get("foreign_table_name").unwrap_or_default();
                let ref_column: String = row.try_get("foreign_column_name").unwrap_or_default();
                ForeignKey::new(column, ref_table, ref_column)
            })
            .collect())
    }

    /// Index metadata is best effort; a failure leaves the list empty.
    async fn fetch_indexes(conn: &mut PgConnection, table: &str, schema_name: &str) -> Vec<IndexInfo> {
        let rows = match sqlx::query(queries::postgres::DESCRIBE_INDEXES)
            .bind(table)
            .bind(schema_name)
            .fetch_all(&mut *conn)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!(table, error = %e, "Could not read PostgreSQL indexes");
                return Vec::new();
            }
        };

        rows.iter()
            .filter_map(|row| {
                let name: String = row.try_get("index_name").ok()?;
                let columns: Vec<String> = row.try_get("column_names").ok()?;
                let is_unique: bool = row.try_get("is_unique").unwrap_or(false);
                let is_primary: bool = row.try_get("is_primary").unwrap_or(false);
                if columns.is_empty() {
                    return None;
                }
                Some(
                    IndexInfo::new(name, columns)
                        .with_unique(is_unique)
                        .with_primary(is_primary),
                )
            })
            .collect()
    }
}

mod mysql {
    use super::*;
    use sqlx::mysql::MySqlRow;
    use sqlx::{MySqlConnection, Row};

    /// MySQL 5.x reports BIGINT, 8.x reports BIGINT UNSIGNED.
    fn try_get_u64(row: &MySqlRow, column: &str) -> Option<u64> {
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(column) {
            return Some(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(column) {
            return u64::try_from(v).ok();
        }
        None
    }

    /// Catalog columns may arrive as VARBINARY depending on the server charset.
    fn get_optional_string(row: &MySqlRow, column: &str) -> Option<String> {
        row.try_get::<Option<String>, _>(column)
            .ok()
            .flatten()
            .or_else(|| {
                row.try_get::<Option<Vec<u8>>, _>(column)
                    .ok()
                    .flatten()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
    }

    fn get_string(row: &MySqlRow, column: &str) -> String {
        get_optional_string(row, column).unwrap_or_default()
    }

    pub async fn list_tables(
        conn: &mut MySqlConnection,
        schema: Option<&str>,
    ) -> DbResult<Vec<TableSummary>> {
        let rows = sqlx::query(queries::mysql::LIST_TABLES)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await?;

        let tables = rows
            .iter()
            .filter_map(|row| {
                let name = get_string(row, "TABLE_NAME");
                if name.is_empty() {
                    return None;
                }
                let table_type = get_string(row, "TABLE_TYPE");
                let mut table = TableSummary::new(name, TableType::parse(&table_type))
                    .with_estimated_rows(try_get_u64(row, "ESTIMATED_ROWS"));
                if let Some(s) = get_optional_string(row, "TABLE_SCHEMA") {
                    table = table.with_schema(s);
                }
                Some(table)
            })
            .collect::<Vec<_>>();

        debug!(count = tables.len(), schema = ?schema, "Listed MySQL tables");
        Ok(tables)
    }

    pub async fn describe_table(
        conn: &mut MySqlConnection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<TableDescription> {
        let rows = sqlx::query(queries::mysql::DESCRIBE_COLUMNS)
            .bind(table)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await?;
        if rows.is_empty() {
            return Err(table_not_found(table, schema));
        }

        let resolved_schema = rows
            .first()
            .and_then(|row| get_optional_string(row, "TABLE_SCHEMA"));
        let columns: Vec<ColumnDescription> = rows
            .iter()
            .map(|row| {
                let nullable = get_string(row, "IS_NULLABLE");
                ColumnDescription::new(
                    get_string(row, "COLUMN_NAME"),
                    get_string(row, "COLUMN_TYPE"),
                    nullable == "YES",
                )
                .with_default(get_optional_string(row, "COLUMN_DEFAULT"))
                .with_primary_key(get_string(row, "COLUMN_KEY") == "PRI")
            })
            .collect();

        let foreign_keys = fetch_foreign_keys(conn, table, schema).await?;
        let indexes = fetch_indexes(conn, table, schema).await;
        let estimated_rows = sqlx::query(queries::mysql::ESTIMATED_ROWS)
            .bind(table)
            .bind(schema)
            .fetch_optional(&mut *conn)
            .await?
            .and_then(|row| try_get_u64(&row, "TABLE_ROWS"));

        let mut description = TableDescription::new(table);
        description.schema = resolved_schema;
        description.primary_keys = primary_keys_of(&columns);
        description.columns = columns;
        description.foreign_keys = foreign_keys;
        description.indexes = indexes;
        description.estimated_rows = estimated_rows;
        Ok(description)
    }

    async fn fetch_foreign_keys(
        conn: &mut MySqlConnection,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<ForeignKey>> {
        let rows = sqlx::query(queries::mysql::DESCRIBE_FOREIGN_KEYS)
            .bind(table)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                ForeignKey::new(
                    get_string(row, "COLUMN_NAME"),
                    get_string(row, "REFERENCED_TABLE_NAME"),
                    get_string(row, "REFERENCED_COLUMN_NAME"),
                )
            })
            .collect())
    }

    async fn fetch_indexes(
        conn: &mut MySqlConnection,
        table: &str,
        schema: Option<&str>,
    ) -> Vec<IndexInfo> {
        let rows = match sqlx::query(queries::mysql::DESCRIBE_INDEXES)
            .bind(table)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                debug!(table, error = %e, "Could not read MySQL indexes");
                return Vec::new();
            }
        };

        rows.iter()
            .map(|row| {
                let name = get_string(row, "INDEX_NAME");
                let columns: Vec<String> = get_string(row, "COLUMN_NAMES")
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                let non_unique = try_get_u64(row, "NON_UNIQUE").unwrap_or(1);
                let is_primary = name == "PRIMARY";
                IndexInfo::new(name, columns)
                    .with_unique(non_unique == 0)
                    .with_primary(is_primary)
            })
            .collect()
    }
}
