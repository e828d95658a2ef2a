//! MCP service implementation using rmcp.
//!
//! This module defines the SqlService struct with the SQL tools exposed via
//! the MCP protocol. Each tool builds a [`ToolInvocation`] and hands it to the
//! shared [`RequestRouter`]; database failures come back as ordinary error
//! envelopes, never as protocol errors.
//!
//! Resources (`sql://schema/...`, `sql://query/...`) and prompts go through
//! the same router.

use crate::mcp::prompts::{self, BackendPromptArgs};
use crate::mcp::resources::{self, ResourceTarget};
use crate::models::StatementParam;
use crate::tools::format::OutputFormat;
use crate::tools::{BackendSummary, RequestRouter, ResponseEnvelope, ToolCall, ToolInvocation};
use rmcp::Json;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::router::prompt::PromptRouter,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{
        AnnotateAble, GetPromptRequestParam, GetPromptResult, Implementation, ListPromptsResult,
        ListResourceTemplatesResult, ListResourcesResult,
        PaginatedRequestParam, PromptMessage, PromptMessageRole, ProtocolVersion, RawResource,
        RawResourceTemplate, ReadResourceRequestParam, ReadResourceResult, ResourceContents,
        ServerCapabilities, ServerInfo,
    },
    prompt, prompt_handler, prompt_router,
    schemars::JsonSchema,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Input for the run_query tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RunQueryInput {
    /// Backend ID from list_backends
    pub backend_id: String,
    /// One SQL statement. Use ? (MySQL) or $1, $2 (PostgreSQL) placeholders.
    pub sql: String,
    /// Positional parameters bound to the placeholders
    #[serde(default)]
    pub params: Vec<StatementParam>,
    /// Maximum rows to return (default: 100, max: 10000)
    #[serde(default)]
    pub limit: Option<u32>,
    /// Statement timeout in seconds (default: 30, max: 300)
    #[serde(default)]
    pub timeout_secs: Option<u32>,
    /// Extra rendering: json (default), table, or markdown
    #[serde(default)]
    pub format: OutputFormat,
}

/// Input for the list_tables tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListTablesInput {
    /// Backend ID from list_backends
    pub backend_id: String,
    /// Schema (PostgreSQL) or database (MySQL); defaults to the connection's own
    #[serde(default)]
    pub schema: Option<String>,
}

/// Input for the describe_table tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DescribeTableInput {
    /// Backend ID from list_backends
    pub backend_id: String,
    /// Table name
    pub table: String,
    /// Schema (PostgreSQL) or database (MySQL); defaults to the connection's own
    #[serde(default)]
    pub schema: Option<String>,
}

/// Output for the list_backends tool.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ListBackendsOutput {
    pub backends: Vec<BackendSummary>,
    pub count: usize,
}

#[derive(Clone)]
pub struct SqlService {
    router: Arc<RequestRouter>,
    /// Tool router for MCP tool dispatch (auto-generated)
    tool_router: ToolRouter<Self>,
    prompt_router: PromptRouter<Self>,
}

impl SqlService {
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self {
            router,
            tool_router: Self::tool_router(),
            prompt_router: Self::prompt_router(),
        }
    }

    /// Validate backend ID - ensure it is provided and non-empty.
    ///
    /// Returns the trimmed ID if valid, otherwise returns an error
    /// guiding the caller to list_backends first.
    fn validate_backend_id(&self, provided: &str) -> Result<String, McpError> {
        let trimmed = provided.trim();
        if trimmed.is_empty() {
            Err(McpError::invalid_params(
                "backend_id is required. Call list_backends first to get available backend IDs.",
                None,
            ))
        } else {
            Ok(trimmed.to_string())
        }
    }

    async fn invoke(
        &self,
        backend_id: &str,
        call: ToolCall,
    ) -> Result<Json<ResponseEnvelope>, McpError> {
        let backend_id = self.validate_backend_id(backend_id)?;
        let envelope = self
            .router
            .handle(ToolInvocation::new(backend_id, call))
            .await;
        Ok(Json(envelope))
    }

    /// Markdown body of a resource. Unknown URIs and backends are protocol
    /// errors; database failures are described in the text.
    async fn read_resource_text(&self, uri: &str) -> Result<String, McpError> {
        let target = ResourceTarget::parse(uri)?;
        Ok(resources::read(&self.router, &target).await?)
    }
}

#[prompt_router]
impl SqlService {
    #[prompt(
        name = "connect_database_prompt",
        description = "Start working with a database backend, or choose one of the configured backends"
    )]
    async fn connect_database_prompt(
        &self,
        Parameters(args): Parameters<BackendPromptArgs>,
    ) -> Vec<PromptMessage> {
        let backends = self.router.list_backends();
        vec![PromptMessage::new_text(
            PromptMessageRole::User,
            prompts::connect_text(&backends, args.backend_id.as_deref()),
        )]
    }

    #[prompt(
        name = "explore_database_prompt",
        description = "Explore the tables and data of a database backend"
    )]
    async fn explore_database_prompt(
        &self,
        Parameters(args): Parameters<BackendPromptArgs>,
    ) -> Vec<PromptMessage> {
        let backends = self.router.list_backends();
        vec![PromptMessage::new_text(
            PromptMessageRole::User,
            prompts::explore_text(&backends, args.backend_id.as_deref()),
        )]
    }
}

#[tool_router]
impl SqlService {
    #[tool(
        description = "List configured database backends.\nReturns backend IDs, kinds (MySQL/PostgreSQL), writable flag, and pool usage."
    )]
    async fn list_backends(&self) -> Json<ListBackendsOutput> {
        let backends = self.router.list_backends();
        let count = backends.len();
        Json(ListBackendsOutput { backends, count })
    }

    #[tool(
        description = "Run one SQL statement and return rows or the affected-row count.\nUse placeholders with `params` instead of inlining values.\nResults are capped by `limit`; `truncated: true` means more rows existed.\nErrors come back in the envelope with a `kind` such as SyntaxError, Timeout, or PermissionDenied.\nOn non-writable backends only read statements are allowed."
    )]
    async fn run_query(
        &self,
        Parameters(input): Parameters<RunQueryInput>,
    ) -> Result<Json<ResponseEnvelope>, McpError> {
        let call = ToolCall::RunQuery {
            sql: input.sql,
            params: input.params,
            limit: input.limit,
            timeout_secs: input.timeout_secs,
            format: input.format,
        };
        self.invoke(&input.backend_id, call).await
    }

    #[tool(
        description = "List tables and views with their type and estimated row count.\nServer-level backends (no database in the URL) need the `schema` parameter."
    )]
    async fn list_tables(
        &self,
        Parameters(input): Parameters<ListTablesInput>,
    ) -> Result<Json<ResponseEnvelope>, McpError> {
        let call = ToolCall::ListTables {
            schema: input.schema,
        };
        self.invoke(&input.backend_id, call).await
    }

    #[tool(
        description = "Describe a table: columns, primary keys, foreign keys, indexes, and estimated rows.\nAlso returns a markdown summary in `formatted`."
    )]
    async fn describe_table(
        &self,
        Parameters(input): Parameters<DescribeTableInput>,
    ) -> Result<Json<ResponseEnvelope>, McpError> {
        let call = ToolCall::DescribeTable {
            table: input.table,
            schema: input.schema,
        };
        self.invoke(&input.backend_id, call).await
    }
}

#[tool_handler]
#[prompt_handler]
impl ServerHandler for SqlService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder()
                .enable_prompts()
                .enable_resources()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "sql-explorer-mcp".to_owned(),
                title: Some("SQL Explorer MCP".to_owned()),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "SQL tools for MySQL and PostgreSQL databases.\n\
                \n\
                ## Workflow\n\
                1. Call `list_backends` to get available backend IDs\n\
                2. Explore with `list_tables` and `describe_table`\n\
                3. Run statements with `run_query`, passing values through `params`\n\
                \n\
                ## Results\n\
                Every call answers with an envelope: `ok`, `result` or `error`, \
                `execution_time_ms` and `truncated`. An error has a `kind` \
                (SyntaxError, ConstraintViolation, Timeout, PermissionDenied, ...) \
                and the backend's message. Fix the statement and try again.\n\
                \n\
                ## Limits\n\
                - One statement per `run_query` call\n\
                - Rows are capped by `limit` (default 100); narrow the query when `truncated` is true\n\
                - Backends are read-only unless listed with `writable: true`\n\
                \n\
                ## Server-Level Backends\n\
                For backends with `server_level: true`, qualify table names (`db.table`) \
                and pass `schema` to `list_tables` and `describe_table`.\n\
                \n\
                ## Resources\n\
                - `sql://schema/{backend_id}`: markdown schema of a backend\n\
                - `sql://query/{backend_id}/{query}`: first rows of a percent-encoded query"
                    .to_string(),
            ),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let resources = self
            .router
            .list_backends()
            .into_iter()
            .map(|backend| {
                let mut raw = RawResource::new(
                    resources::schema_uri(&backend.id),
                    format!("{} schema", backend.id),
                );
                raw.description = Some(format!(
                    "Tables of the {} backend at {}",
                    backend.kind.display_name(),
                    backend.target
                ));
                raw.mime_type = Some("text/markdown".to_string());
                raw.no_annotation()
            })
            .collect();
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let templates = vec![
            RawResourceTemplate {
                uri_template: resources::SCHEMA_URI_TEMPLATE.to_string(),
                name: "schema".to_string(),
                title: Some("Database schema".to_string()),
                description: Some("Markdown description of every table of a backend".to_string()),
                mime_type: Some("text/markdown".to_string()),
            }
            .no_annotation(),
            RawResourceTemplate {
                uri_template: resources::QUERY_URI_TEMPLATE.to_string(),
                name: "query".to_string(),
                title: Some("Query result".to_string()),
                description: Some(format!(
                    "First {} rows of a percent-encoded SQL query",
                    resources::QUERY_RESOURCE_ROW_LIMIT
                )),
                mime_type: Some("text/markdown".to_string()),
            }
            .no_annotation(),
        ];
        Ok(ListResourceTemplatesResult::with_all_items(templates))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let text = self.read_resource_text(&request.uri).await?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: request.uri,
                mime_type: Some("text/markdown".to_string()),
                text,
                meta: None,
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PoolManager, StatementExecutor};
    use crate::error::ErrorKind;
    use crate::models::{BackendConfig, BackendKind, Credentials};
    use crate::tools::ResultMarshaler;

    fn create_test_service() -> SqlService {
        let backend = BackendConfig::new(
            "shop",
            BackendKind::PostgreSQL,
            "127.0.0.1",
            1,
            Credentials::new("app", Some("pw".into())),
        )
        .unwrap()
        .with_database("shop");
        let pools = Arc::new(PoolManager::new(vec![backend]).unwrap());
        let router = RequestRouter::new(pools, StatementExecutor::new(), ResultMarshaler::default());
        SqlService::new(Arc::new(router))
    }

    #[test]
    fn test_validate_backend_id_with_valid() {
        let service = create_test_service();
        assert_eq!(service.validate_backend_id("shop").unwrap(), "shop");
        assert_eq!(service.validate_backend_id("  shop  ").unwrap(), "shop");
    }

    #[test]
    fn test_validate_backend_id_rejects_blank() {
        let service = create_test_service();
        for input in ["", "   "] {
            let err = service.validate_backend_id(input).unwrap_err();
            assert!(err.to_string().contains("backend_id is required"));
        }
    }

    #[tokio::test]
    async fn test_list_backends_counts() {
        let service = create_test_service();
        let Json(output) = service.list_backends().await;
        assert_eq!(output.count, 1);
        assert_eq!(output.backends[0].id, "shop");
        assert!(!output.backends[0].writable);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_an_envelope() {
        let service = create_test_service();
        let Json(envelope) = service
            .invoke("missing", ToolCall::query("SELECT 1"))
            .await
            .unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.kind(), Some(ErrorKind::NotFound));
    }

    #[test]
    fn test_run_query_input_defaults() {
        let input: RunQueryInput =
            serde_json::from_value(serde_json::json!({"backend_id": "shop", "sql": "SELECT 1"}))
                .unwrap();
        assert!(input.params.is_empty());
        assert_eq!(input.limit, None);
        assert_eq!(input.format, OutputFormat::Json);
    }

    #[test]
    fn test_server_info() {
        let service = create_test_service();
        let info = service.get_info();
        assert_eq!(info.server_info.name, "sql-explorer-mcp");
        assert!(info.capabilities.tools.is_some());
        assert!(info.capabilities.prompts.is_some());
        assert!(info.capabilities.resources.is_some());
        let instructions = info.instructions.unwrap();
        assert!(instructions.contains("list_backends"));
        assert!(instructions.contains("sql://schema/{backend_id}"));
    }

    fn prompt_text(messages: Vec<PromptMessage>) -> String {
        assert_eq!(messages.len(), 1);
        match &messages[0].content {
            rmcp::model::PromptMessageContent::Text { text } => text.clone(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prompts_name_the_backend() {
        let service = create_test_service();
        assert_eq!(service.prompt_router.list_all().len(), 2);

        let text = prompt_text(
            service
                .connect_database_prompt(Parameters(BackendPromptArgs {
                    backend_id: Some("shop".into()),
                }))
                .await,
        );
        assert!(text.contains("backend_id \"shop\""));

        let text = prompt_text(
            service
                .explore_database_prompt(Parameters(BackendPromptArgs::default()))
                .await,
        );
        assert!(text.contains("- `shop`: PostgreSQL"));
    }

    #[tokio::test]
    async fn test_read_resource_unknown_backend_is_an_error() {
        let service = create_test_service();
        let err = service
            .read_resource_text("sql://schema/missing")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));

        assert!(service.read_resource_text("sql://nothing/here").await.is_err());
    }

    #[tokio::test]
    async fn test_read_schema_resource_reports_connection_failure() {
        let service = create_test_service();
        let text = service
            .read_resource_text("sql://schema/shop")
            .await
            .unwrap();
        assert!(text.starts_with("# Error Reading Schema"), "{text}");
        assert!(text.contains("ConnectionFailed"), "{text}");
    }

    #[tokio::test]
    async fn test_read_query_resource_keeps_read_only_guard() {
        let service = create_test_service();
        let uri = resources::query_uri("shop", "INSERT INTO users (name) VALUES ('x')");
        let text = service.read_resource_text(&uri).await.unwrap();
        assert!(text.starts_with("# Error Executing Query"), "{text}");
        assert!(text.contains("PermissionDenied"), "{text}");
    }
}
