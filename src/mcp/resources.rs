//! MCP resources keyed by backend id.
//!
//! - `sql://schema/{backend_id}`: markdown description of every table
//! - `sql://query/{backend_id}/{query}`: result of a percent-encoded query,
//!   capped at [`QUERY_RESOURCE_ROW_LIMIT`] rows
//!
//! Both go through the [`RequestRouter`], so pooling, time limits and the
//! read-only guard apply exactly as they do for tools.

use crate::error::{DbError, DbResult};
use crate::models::TableSummary;
use crate::tools::format::OutputFormat;
use crate::tools::{RequestRouter, ResponseEnvelope, ResultPayload, ToolCall, ToolInvocation};

pub const SCHEMA_URI_PREFIX: &str = "sql://schema/";
pub const QUERY_URI_PREFIX: &str = "sql://query/";
pub const SCHEMA_URI_TEMPLATE: &str = "sql://schema/{backend_id}";
pub const QUERY_URI_TEMPLATE: &str = "sql://query/{backend_id}/{query}";

pub const QUERY_RESOURCE_ROW_LIMIT: u32 = 20;
/// Tables described in one schema resource; the rest are listed by name.
pub const MAX_SCHEMA_TABLES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceTarget {
    Schema { backend_id: String },
    Query { backend_id: String, sql: String },
}

impl ResourceTarget {
    pub fn parse(uri: &str) -> DbResult<Self> {
        if let Some(rest) = uri.strip_prefix(SCHEMA_URI_PREFIX) {
            let backend_id = decode(rest)?;
            if backend_id.trim().is_empty() || backend_id.contains('/') {
                return Err(DbError::invalid_input(format!(
                    "Expected {SCHEMA_URI_TEMPLATE}, got '{uri}'"
                )));
            }
            return Ok(Self::Schema { backend_id });
        }
        if let Some(rest) = uri.strip_prefix(QUERY_URI_PREFIX) {
            let Some((id, query)) = rest.split_once('/') else {
                return Err(DbError::invalid_input(format!(
                    "Expected {QUERY_URI_TEMPLATE}, got '{uri}'"
                )));
            };
            let sql = decode(query)?;
            if id.trim().is_empty() || sql.trim().is_empty() {
                return Err(DbError::invalid_input(format!(
                    "Expected {QUERY_URI_TEMPLATE}, got '{uri}'"
                )));
            }
            return Ok(Self::Query {
                backend_id: decode(id)?,
                sql,
            });
        }
        Err(DbError::invalid_input(format!("Unknown resource URI: {uri}")))
    }

    pub fn backend_id(&self) -> &str {
        match self {
            Self::Schema { backend_id } | Self::Query { backend_id, .. } => backend_id,
        }
    }
}

fn decode(text: &str) -> DbResult<String> {
    urlencoding::decode(text)
        .map(|s| s.into_owned())
        .map_err(|e| DbError::invalid_input(format!("Resource URI is not valid UTF-8: {e}")))
}

pub fn schema_uri(backend_id: &str) -> String {
    format!("{SCHEMA_URI_PREFIX}{}", urlencoding::encode(backend_id))
}

pub fn query_uri(backend_id: &str, sql: &str) -> String {
    format!(
        "{QUERY_URI_PREFIX}{}/{}",
        urlencoding::encode(backend_id),
        urlencoding::encode(sql)
    )
}

/// Render a resource as markdown. Unknown backends are an error; failures
/// on a known backend are reported inside the text.
pub async fn read(router: &RequestRouter, target: &ResourceTarget) -> DbResult<String> {
    let backend = router.pools().backend(target.backend_id())?;
    let kind = backend.kind.display_name();

    match target {
        ResourceTarget::Schema { backend_id } => {
            let listed = router
                .handle(ToolInvocation::new(
                    backend_id.as_str(),
                    ToolCall::ListTables { schema: None },
                ))
                .await;
            let tables = match listed.result {
                Some(ResultPayload::Tables { tables, .. }) => tables,
                _ => return Ok(render_error("# Error Reading Schema", &listed)),
            };

            let mut sections = Vec::with_capacity(tables.len().min(MAX_SCHEMA_TABLES));
            for table in tables.iter().take(MAX_SCHEMA_TABLES) {
                let described = router
                    .handle(ToolInvocation::new(
                        backend_id.as_str(),
                        ToolCall::DescribeTable {
                            table: table.name.clone(),
                            schema: table.schema.clone(),
                        },
                    ))
                    .await;
                sections.push(match described.formatted {
                    Some(markdown) if described.ok => markdown,
                    _ => format!(
                        "### {}\n\n*{}*\n",
                        table.name,
                        error_message(&described)
                    ),
                });
            }
            Ok(render_schema(kind, &tables, &sections))
        }
        ResourceTarget::Query { backend_id, sql } => {
            let envelope = router
                .handle(ToolInvocation::new(
                    backend_id.as_str(),
                    ToolCall::RunQuery {
                        sql: sql.clone(),
                        params: Vec::new(),
                        limit: Some(QUERY_RESOURCE_ROW_LIMIT),
                        timeout_secs: None,
                        format: OutputFormat::Markdown,
                    },
                ))
                .await;
            Ok(render_query(sql, &envelope))
        }
    }
}

pub fn render_schema(kind: &str, tables: &[TableSummary], sections: &[String]) -> String {
    let mut out = format!("# {kind} Database Schema\n\n## Tables ({})\n\n", tables.len());
    if tables.is_empty() {
        out.push_str("No tables found.\n");
        return out;
    }
    for section in sections {
        out.push_str(section);
        out.push('\n');
    }
    if tables.len() > sections.len() {
        out.push_str("## Not described\n\n");
        for table in &tables[sections.len()..] {
            out.push_str(&format!("- `{}`\n", table.name));
        }
        out.push_str("\nUse the describe_table tool for these.\n");
    }
    out
}

pub fn render_query(sql: &str, envelope: &ResponseEnvelope) -> String {
    if !envelope.ok {
        return render_error("# Error Executing Query", envelope);
    }
    let mut out = format!("# SQL Query Results\n\n```sql\n{sql}\n```\n\n");
    match &envelope.result {
        Some(ResultPayload::Rows { .. }) => {
            out.push_str(envelope.formatted.as_deref().unwrap_or("No results returned."));
            out.push('\n');
            if envelope.truncated {
                out.push_str(&format!(
                    "\n*Limited to {QUERY_RESOURCE_ROW_LIMIT} rows. Use the run_query tool for more.*\n"
                ));
            }
        }
        Some(ResultPayload::Affected { rows_affected, .. }) => {
            out.push_str(&format!("**Affected rows:** {rows_affected}\n"));
        }
        _ => {}
    }
    out
}

fn error_message(envelope: &ResponseEnvelope) -> String {
    match &envelope.error {
        Some(error) => format!("{}: {}", error.kind, error.message),
        None => "no result".to_string(),
    }
}

fn render_error(title: &str, envelope: &ResponseEnvelope) -> String {
    let mut out = format!("{title}\n\n{}\n", error_message(envelope));
    if let Some(suggestion) = envelope
        .error
        .as_ref()
        .and_then(|e| e.detail.suggestion.as_deref())
    {
        out.push_str(&format!("\n{suggestion}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{ColumnShape, NormalizedResult, RowSet, Scalar, TableType, TypeTag};
    use crate::tools::ResultMarshaler;
    use std::time::Duration;

    #[test]
    fn test_parse_schema_uri() {
        assert_eq!(
            ResourceTarget::parse("sql://schema/shop").unwrap(),
            ResourceTarget::Schema {
                backend_id: "shop".into()
            }
        );
        assert!(ResourceTarget::parse("sql://schema/").is_err());
        assert!(ResourceTarget::parse("sql://schema/a/b").is_err());
    }

    #[test]
    fn test_parse_query_uri_decodes() {
        let uri = query_uri("shop", "SELECT name FROM users WHERE id = '7'");
        assert_eq!(
            ResourceTarget::parse(&uri).unwrap(),
            ResourceTarget::Query {
                backend_id: "shop".into(),
                sql: "SELECT name FROM users WHERE id = '7'".into()
            }
        );
        // A slash inside the encoded query belongs to the query
        let target = ResourceTarget::parse("sql://query/shop/SELECT%201%20/%202").unwrap();
        assert_eq!(target.backend_id(), "shop");
        assert!(matches!(target, ResourceTarget::Query { sql, .. } if sql == "SELECT 1 / 2"));
    }

    #[test]
    fn test_parse_rejects_unknown_and_incomplete() {
        for uri in ["file:///etc/passwd", "sql://query/shop", "sql://query/shop/", "sql://tables/x"] {
            let err = ResourceTarget::parse(uri).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{uri}");
        }
    }

    #[test]
    fn test_schema_uri_round_trips_odd_ids() {
        let uri = schema_uri("my db");
        assert_eq!(uri, "sql://schema/my%20db");
        assert_eq!(ResourceTarget::parse(&uri).unwrap().backend_id(), "my db");
    }

    #[test]
    fn test_render_query_rows() {
        let marshaler = ResultMarshaler::default();
        let env = marshaler.marshal(
            NormalizedResult::Rows(RowSet {
                columns: vec![ColumnShape::new("n", TypeTag::Integer, "INT")],
                rows: vec![vec![Scalar::Integer(1)]],
                truncated: true,
            }),
            Duration::ZERO,
        );
        let env = marshaler.render(env, OutputFormat::Markdown);
        let out = render_query("SELECT n FROM t", &env);
        assert!(out.starts_with("# SQL Query Results\n\n```sql\nSELECT n FROM t\n```"));
        assert!(out.contains("| n |"));
        assert!(out.contains("Limited to 20 rows"));
    }

    #[test]
    fn test_render_query_failure() {
        let env = ResponseEnvelope::rejected(&DbError::permission("INSERT", "backend 'shop' is read-only"));
        let out = render_query("INSERT INTO t VALUES (1)", &env);
        assert!(out.starts_with("# Error Executing Query"));
        assert!(out.contains("PermissionDenied"));
        assert!(out.contains("read-only"));
    }

    #[test]
    fn test_render_schema_lists_overflow() {
        let tables: Vec<TableSummary> = ["a", "b", "c"]
            .iter()
            .map(|n| TableSummary::new(*n, TableType::Table))
            .collect();
        let sections = vec!["### a\n".to_string()];
        let out = render_schema("PostgreSQL", &tables, &sections);
        assert!(out.starts_with("# PostgreSQL Database Schema\n\n## Tables (3)"));
        assert!(out.contains("### a"));
        assert!(out.contains("- `b`\n- `c`"));

        assert!(render_schema("MySQL", &[], &[]).contains("No tables found."));
    }
}
