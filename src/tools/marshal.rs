//! Result marshaling.
//!
//! Turns a [`NormalizedResult`] into the JSON [`ResponseEnvelope`] returned
//! to callers. Exactly one of `result` or `error` is set, and a failure
//! never carries rows.
//!
//! Scalars render as follows:
//! - binary as standard base64
//! - date/time values in one ISO-8601 form, zoned values in UTC with `Z`
//! - exact decimals as strings
//! - integers and finite floats as numbers, non-finite floats as strings
//!
//! Row payloads are capped at a byte ceiling measured as serialized JSON.
//! An optional text rendering shares that ceiling with the rows.

use crate::error::{DbError, ErrorKind};
use crate::models::{
    ColumnShape, Failure, NormalizedResult, RowSet, Scalar, TableDescription, TableSummary,
};
use crate::tools::format::{
    OutputFormat, describe_table_markdown, format_as_markdown, format_as_table,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use humansize::{BINARY, format_size};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// Default ceiling on the serialized row payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Successful payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultPayload {
    Rows {
        columns: Vec<ColumnShape>,
        /// One array per row, in column order
        rows: Vec<Vec<JsonValue>>,
        row_count: usize,
    },
    Affected {
        rows_affected: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_insert_id: Option<u64>,
    },
    Tables {
        tables: Vec<TableSummary>,
        count: usize,
    },
    Table {
        table: TableDescription,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_code: Option<String>,
    /// False only when the statement provably changed nothing
    pub side_effect_possible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorBody {
    /// Branch on this, not on `message`
    pub kind: ErrorKind,
    pub message: String,
    pub detail: ErrorDetail,
}

/// The response every tool call produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseEnvelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub execution_time_ms: u64,
    /// Rows were dropped because of the row cap or the payload ceiling
    pub truncated: bool,
    /// Optional human-readable rendering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
}

impl ResponseEnvelope {
    fn success(result: ResultPayload, elapsed: Duration, truncated: bool) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            execution_time_ms: elapsed.as_millis() as u64,
            truncated,
            formatted: None,
        }
    }

    pub fn failure(failure: Failure, elapsed: Duration) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: failure.kind,
                message: failure.message,
                detail: ErrorDetail {
                    native_code: failure.native_code,
                    side_effect_possible: failure.side_effect_possible,
                    suggestion: failure.suggestion,
                },
            }),
            execution_time_ms: elapsed.as_millis() as u64,
            truncated: false,
            formatted: None,
        }
    }

    /// Envelope for a request refused before reaching any backend.
    pub fn rejected(err: &DbError) -> Self {
        Self::failure(Failure::rejected(err), Duration::ZERO)
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

}

/// Renders normalized results into envelopes.
#[derive(Debug, Clone)]
pub struct ResultMarshaler {
    max_payload_bytes: usize,
}

impl ResultMarshaler {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self {
            max_payload_bytes: max_payload_bytes.max(1),
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    pub fn marshal(&self, result: NormalizedResult, elapsed: Duration) -> ResponseEnvelope {
        match result {
            NormalizedResult::Rows(set) => self.marshal_rows(set, elapsed),
            NormalizedResult::Affected {
                rows_affected,
                last_insert_id,
            } => ResponseEnvelope::success(
                ResultPayload::Affected {
                    rows_affected,
                    last_insert_id,
                },
                elapsed,
                false,
            ),
            NormalizedResult::Failure(failure) => ResponseEnvelope::failure(failure, elapsed),
        }
    }

    fn marshal_rows(&self, set: RowSet, elapsed: Duration) -> ResponseEnvelope {
        let RowSet {
            columns,
            rows,
            mut truncated,
        } = set;

        // Column metadata counts against the ceiling too
        let mut used = json_len(&columns);
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let rendered: Vec<JsonValue> = row.into_iter().map(scalar_to_json).collect();
            let size = json_len(&rendered) + 1;
            if used + size > self.max_payload_bytes {
                truncated = true;
                warn!(
                    rows = out.len(),
                    ceiling = %format_size(self.max_payload_bytes, BINARY),
                    "Result exceeds payload ceiling, truncating"
                );
                break;
            }
            used += size;
            out.push(rendered);
        }

        ResponseEnvelope::success(
            ResultPayload::Rows {
                row_count: out.len(),
                columns,
                rows: out,
            },
            elapsed,
            truncated,
        )
    }

    /// Attach a text rendering of row results. Other payloads are unchanged.
    ///
    /// The rendering and the JSON rows together stay under the payload
    /// ceiling. Trailing rows are dropped from both until they fit, and the
    /// rendering is left out when not even the header fits.
    pub fn render(&self, mut envelope: ResponseEnvelope, format: OutputFormat) -> ResponseEnvelope {
        if format == OutputFormat::Json {
            return envelope;
        }
        if let ResponseEnvelope {
            result: Some(ResultPayload::Rows {
                columns,
                rows,
                row_count,
            }),
            truncated,
            formatted,
            execution_time_ms,
            ..
        } = &mut envelope
        {
            let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
            let mut shown = rows.len();
            loop {
                let cut = shown < rows.len();
                let text = match format {
                    OutputFormat::Table => format_as_table(
                        &names,
                        &rows[..shown],
                        *truncated || cut,
                        *execution_time_ms,
                    ),
                    _ => format_as_markdown(&names, &rows[..shown], *truncated || cut),
                };
                let json_rows: usize = rows[..shown].iter().map(|r| json_len(r) + 1).sum();
                let total = json_len(columns) + json_rows + json_len(&text);
                if total <= self.max_payload_bytes {
                    if cut {
                        warn!(
                            rows = shown,
                            ceiling = %format_size(self.max_payload_bytes, BINARY),
                            "Rendered result exceeds payload ceiling, truncating"
                        );
                        rows.truncate(shown);
                        *row_count = shown;
                        *truncated = true;
                    }
                    *formatted = Some(text);
                    break;
                }
                if shown == 0 {
                    break;
                }
                // Shrink in proportion to the overshoot
                shown = (shown * self.max_payload_bytes / total).min(shown - 1);
            }
        }
        envelope
    }

    pub fn marshal_tables(&self, tables: Vec<TableSummary>, elapsed: Duration) -> ResponseEnvelope {
        ResponseEnvelope::success(
            ResultPayload::Tables {
                count: tables.len(),
                tables,
            },
            elapsed,
            false,
        )
    }

    /// Table descriptions always carry a markdown rendering.
    pub fn marshal_table(
        &self,
        table: TableDescription,
        backend: &str,
        elapsed: Duration,
    ) -> ResponseEnvelope {
        let markdown = describe_table_markdown(&table, backend);
        let mut envelope =
            ResponseEnvelope::success(ResultPayload::Table { table }, elapsed, false);
        envelope.formatted = Some(markdown);
        envelope
    }
}

impl Default for ResultMarshaler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

/// Serialized JSON size in bytes.
fn json_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

pub fn scalar_to_json(value: Scalar) -> JsonValue {
    match value {
        Scalar::Null => JsonValue::Null,
        Scalar::Integer(v) => JsonValue::from(v),
        Scalar::Unsigned(v) => JsonValue::from(v),
        Scalar::Float(v) => match serde_json::Number::from_f64(v) {
            Some(n) => JsonValue::Number(n),
            None if v.is_nan() => JsonValue::String("NaN".into()),
            None if v > 0.0 => JsonValue::String("Infinity".into()),
            None => JsonValue::String("-Infinity".into()),
        },
        Scalar::Decimal(s) | Scalar::Text(s) => JsonValue::String(s),
        Scalar::Boolean(b) => JsonValue::Bool(b),
        Scalar::Datetime(t) => JsonValue::String(t.to_canonical()),
        Scalar::Binary(bytes) => JsonValue::String(STANDARD.encode(bytes)),
    }
}
