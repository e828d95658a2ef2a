//! Prompt texts for picking and exploring a backend.

use crate::mcp::resources::schema_uri;
use crate::tools::BackendSummary;
use rmcp::schemars::JsonSchema;
use serde::Deserialize;

/// Arguments shared by the backend prompts.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct BackendPromptArgs {
    /// Backend ID from list_backends
    #[serde(default)]
    pub backend_id: Option<String>,
}

fn find<'a>(backends: &'a [BackendSummary], backend_id: Option<&str>) -> Option<&'a BackendSummary> {
    let id = backend_id.map(str::trim).filter(|s| !s.is_empty())?;
    backends.iter().find(|b| b.id == id)
}

fn backend_line(b: &BackendSummary) -> String {
    let access = if b.writable { "writable" } else { "read-only" };
    format!("- `{}`: {} at {} ({})", b.id, b.kind.display_name(), b.target, access)
}

/// Ask to start working with one backend, or to choose among them.
pub fn connect_text(backends: &[BackendSummary], backend_id: Option<&str>) -> String {
    if let Some(b) = find(backends, backend_id) {
        return format!(
            "I'd like to work with the {} database `{}` at {}.\n\n\
             Please call `list_tables` with backend_id \"{}\" and show me what tables are available.\n",
            b.kind.display_name(),
            b.id,
            b.target,
            b.id
        );
    }

    let mut out = String::new();
    if let Some(id) = backend_id.map(str::trim).filter(|s| !s.is_empty()) {
        out.push_str(&format!("There is no backend `{id}`.\n\n"));
    }
    out.push_str("I'd like to connect to a SQL database.\n\n");
    if backends.is_empty() {
        out.push_str(
            "No backends are configured. Start the server with `--database <url>` \
             (mysql://... or postgres://...).\n",
        );
        return out;
    }
    out.push_str("These backends are configured:\n");
    for b in backends {
        out.push_str(&backend_line(b));
        out.push('\n');
    }
    out.push_str("\nPick one, then call `list_tables` with its backend_id.\n");
    out
}

/// Lay out what can be done once a backend is chosen.
pub fn explore_text(backends: &[BackendSummary], backend_id: Option<&str>) -> String {
    let Some(b) = find(backends, backend_id) else {
        return connect_text(backends, backend_id);
    };
    let mut out = format!(
        "I'm working with the {} database `{}`.\n\n\
         Let's explore it. You can:\n\
         1. List all tables with `list_tables`\n\
         2. Describe specific tables with `describe_table`\n\
         3. Run SQL with `run_query`, passing values through `params`\n\
         4. Read the whole schema from the `{}` resource\n",
        b.kind.display_name(),
        b.id,
        schema_uri(&b.id)
    );
    if !b.writable {
        out.push_str("\nThis backend is read-only, so only read statements will run.\n");
    }
    out.push_str("\nWhat would you like to do first?\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PoolStats;
    use crate::models::BackendKind;

    fn summary(id: &str, kind: BackendKind, writable: bool) -> BackendSummary {
        BackendSummary {
            id: id.to_string(),
            kind,
            target: format!("{}://app:*****@db:5432/{id}", kind.scheme()),
            database: Some(id.to_string()),
            writable,
            server_level: false,
            pool: PoolStats {
                open: 0,
                idle: 0,
                in_use: 0,
                max_size: 5,
                closed: false,
            },
        }
    }

    #[test]
    fn test_connect_text_known_backend() {
        let backends = vec![summary("shop", BackendKind::PostgreSQL, false)];
        let text = connect_text(&backends, Some(" shop "));
        assert!(text.contains("PostgreSQL database `shop`"));
        assert!(text.contains("backend_id \"shop\""));
        assert!(!text.contains("configured"));
    }

    #[test]
    fn test_connect_text_lists_backends() {
        let backends = vec![
            summary("shop", BackendKind::PostgreSQL, false),
            summary("logs", BackendKind::MySQL, true),
        ];
        let text = connect_text(&backends, Some("nope"));
        assert!(text.starts_with("There is no backend `nope`."));
        assert!(text.contains("- `shop`: PostgreSQL at postgres://app:*****@db:5432/shop (read-only)"));
        assert!(text.contains("(writable)"));

        assert!(connect_text(&[], None).contains("No backends are configured"));
    }

    #[test]
    fn test_explore_text() {
        let backends = vec![summary("shop", BackendKind::MySQL, false)];
        let text = explore_text(&backends, Some("shop"));
        assert!(text.contains("MySQL database `shop`"));
        assert!(text.contains("sql://schema/shop"));
        assert!(text.contains("read-only"));

        // Without a usable id it falls back to choosing one
        assert!(explore_text(&backends, None).contains("These backends are configured"));
    }
}
