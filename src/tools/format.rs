//! Text renderings of results.
//!
//! The JSON envelope is always produced; these renderings are optional
//! extras for clients that show results to a person. Column widths use
//! display width, so CJK text and emoji line up.

use crate::models::TableDescription;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Output format for row results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// JSON only (default)
    #[default]
    Json,
    /// ASCII table, like the MySQL CLI
    Table,
    /// Markdown table
    Markdown,
}

pub fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Widest display width a rendered cell may take before it is cut.
pub const MAX_CELL_WIDTH: usize = 256;

/// Cut `text` to [`MAX_CELL_WIDTH`] display columns, marking the cut with `...`.
fn clip_cell(text: String) -> String {
    if text.width() <= MAX_CELL_WIDTH {
        return text;
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > MAX_CELL_WIDTH - 3 {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push_str("...");
    out
}

/// Markdown cells cannot contain raw pipes or newlines.
fn escape_markdown_cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

pub fn format_as_table(
    columns: &[String],
    rows: &[Vec<JsonValue>],
    truncated: bool,
    execution_time_ms: u64,
) -> String {
    if columns.is_empty() {
        return "Empty set".to_string();
    }

    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(|v| clip_cell(format_value(v))).collect())
        .collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.width()).collect();
    for row in &cells {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.width());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    let mut output = String::new();
    output.push_str(&separator);
    for (name, w) in columns.iter().zip(&widths) {
        output.push_str(&format!("| {} ", pad(name, *w, Align::Center)));
    }
    output.push_str("|\n");
    output.push_str(&separator);

    for (row, raw) in cells.iter().zip(rows) {
        for (i, w) in widths.iter().enumerate() {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            let align = match raw.get(i) {
                Some(JsonValue::Number(_)) => Align::Right,
                _ => Align::Left,
            };
            output.push_str(&format!("| {} ", pad(cell, *w, align)));
        }
        output.push_str("|\n");
    }
    output.push_str(&separator);

    let row_text = if rows.len() == 1 { "row" } else { "rows" };
    output.push_str(&format!(
        "{} {} in set ({:.2} sec)",
        rows.len(),
        row_text,
        execution_time_ms as f64 / 1000.0
    ));
    if truncated {
        output.push_str(", truncated");
    }
    output.push('\n');

    output
}

pub fn format_as_markdown(columns: &[String], rows: &[Vec<JsonValue>], truncated: bool) -> String {
    if columns.is_empty() {
        return "*Empty set*".to_string();
    }
    if rows.is_empty() {
        return "No results returned.".to_string();
    }

    let mut output = String::new();
    let header: String = columns
        .iter()
        .map(|c| format!("| {} ", escape_markdown_cell(c)))
        .collect::<String>()
        + "|\n";
    output.push_str(&header);
    output.push_str(&("|---".repeat(columns.len()) + "|\n"));

    for row in rows {
        let line: String = row
            .iter()
            .map(|v| format!("| {} ", escape_markdown_cell(&clip_cell(format_value(v)))))
            .collect::<String>()
            + "|\n";
        output.push_str(&line);
    }

    output.push_str(&format!("\n*{} rows*", rows.len()));
    if truncated {
        output.push_str("\n\n*Results truncated. Narrow the query or raise `limit`.*");
    }
    output
}

/// Markdown summary of one table, column list first.
pub fn describe_table_markdown(table: &TableDescription, backend: &str) -> String {
    let mut output = format!("### {}\n\n", table.qualified_name());
    output.push_str(&format!("*{} table", backend));
    if let Some(rows) = table.estimated_rows {
        output.push_str(&format!(", about {} rows", rows));
    }
    output.push_str("*\n\n");

    output.push_str("| Column | Type | Nullable | Default | Key |\n");
    output.push_str("|--------|------|----------|---------|-----|\n");
    for col in &table.columns {
        output.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            escape_markdown_cell(&col.name),
            escape_markdown_cell(&col.native_type),
            if col.nullable { "YES" } else { "NO" },
            escape_markdown_cell(col.default.as_deref().unwrap_or("")),
            if col.is_primary_key { "PK" } else { "" },
        ));
    }

    if !table.foreign_keys.is_empty() {
        output.push_str("\n**Foreign keys**\n\n");
        for fk in &table.foreign_keys {
            output.push_str(&format!(
                "- `{}` → `{}.{}`\n",
                fk.column, fk.referenced_table, fk.referenced_column
            ));
        }
    }

    if !table.indexes.is_empty() {
        output.push_str("\n**Indexes**\n\n");
        for idx in &table.indexes {
            let flag = if idx.primary {
                " (primary)"
            } else if idx.unique {
                " (unique)"
            } else {
                ""
            };
            output.push_str(&format!(
                "- `{}` on ({}){}\n",
                idx.name,
                idx.columns.join(", "),
                flag
            ));
        }
    }

    output
}

#[derive(Clone, Copy)]
enum Align {
    Left,
    Right,
    Center,
}

/// Pad by display width; `format!` width counts chars, not columns.
fn pad(text: &str, width: usize, align: Align) -> String {
    let fill = width.saturating_sub(text.width());
    match align {
        Align::Left => format!("{}{}", text, " ".repeat(fill)),
        Align::Right => format!("{}{}", " ".repeat(fill), text),
        Align::Center => {
            let left = fill / 2;
            format!("{}{}{}", " ".repeat(left), text, " ".repeat(fill - left))
        }
    }
}
