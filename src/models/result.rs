//! Normalized statement results.
//!
//! Every backend result is reduced to these dialect-independent shapes before
//! the marshaler turns them into JSON.

use crate::error::{DbError, ErrorKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Closed set of column type categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    Integer,
    Float,
    /// Exact numeric, rendered as a string
    Decimal,
    Text,
    Boolean,
    Datetime,
    Binary,
    /// The native type can only hold NULL
    Null,
}

impl TypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Datetime => "datetime",
            Self::Binary => "binary",
            Self::Null => "null",
        }
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A date/time value before canonical rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Temporal {
    Date(NaiveDate),
    Time(NaiveTime),
    Naive(NaiveDateTime),
    Utc(DateTime<Utc>),
    /// MySQL `TIME` outside a time of day: negative, or 24 hours and up.
    Span {
        negative: bool,
        hours: u32,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
    },
}

impl Temporal {
    /// Render as ISO-8601 extended format. Zoned values always end in `Z`.
    pub fn to_canonical(&self) -> String {
        match self {
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Self::Naive(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Self::Utc(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.fZ").to_string(),
            Self::Span {
                negative,
                hours,
                minutes,
                seconds,
                microseconds,
            } => {
                let sign = if *negative { "-" } else { "" };
                let mut out = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
                // Same fraction widths chrono's %.f uses
                if *microseconds % 1000 == 0 && *microseconds > 0 {
                    out.push_str(&format!(".{:03}", microseconds / 1000));
                } else if *microseconds > 0 {
                    out.push_str(&format!(".{microseconds:06}"));
                }
                out
            }
        }
    }

    /// A signed hours/minutes/seconds value. Plain times of day stay
    /// [`Temporal::Time`].
    pub fn from_time_parts(
        negative: bool,
        hours: u32,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
    ) -> Self {
        let is_zero = hours == 0 && minutes == 0 && seconds == 0 && microseconds == 0;
        if (!negative || is_zero) && hours < 24 {
            if let Some(t) = NaiveTime::from_hms_micro_opt(
                hours,
                minutes.into(),
                seconds.into(),
                microseconds,
            ) {
                return Self::Time(t);
            }
        }
        Self::Span {
            negative,
            hours,
            minutes,
            seconds,
            microseconds,
        }
    }
}

/// A single decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Integer(i64),
    /// MySQL unsigned values above `i64::MAX`
    Unsigned(u64),
    Float(f64),
    Decimal(String),
    Text(String),
    Boolean(bool),
    Datetime(Temporal),
    Binary(Vec<u8>),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Tag this value would carry as a column of its own.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Null => TypeTag::Null,
            Self::Integer(_) | Self::Unsigned(_) => TypeTag::Integer,
            Self::Float(_) => TypeTag::Float,
            Self::Decimal(_) => TypeTag::Decimal,
            Self::Text(_) => TypeTag::Text,
            Self::Boolean(_) => TypeTag::Boolean,
            Self::Datetime(_) => TypeTag::Datetime,
            Self::Binary(_) => TypeTag::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnShape {
    pub name: String,
    pub type_tag: TypeTag,
    /// Backend type name (e.g., "INT8", "VARCHAR")
    pub native_type: String,
    /// None when the backend cannot tell
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
}

impl ColumnShape {
    pub fn new(name: impl Into<String>, type_tag: TypeTag, native_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag,
            native_type: native_type.into(),
            nullable: None,
        }
    }

    pub fn with_nullable(mut self, nullable: Option<bool>) -> Self {
        self.nullable = nullable;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowSet {
    pub columns: Vec<ColumnShape>,
    pub rows: Vec<Vec<Scalar>>,
    /// True if rows were dropped to honour the row cap
    pub truncated: bool,
}

impl RowSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A classified failure, ready for the error envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub native_code: Option<String>,
    pub message: String,
    /// False only when the statement provably changed nothing
    pub side_effect_possible: bool,
    pub suggestion: Option<String>,
}

impl Failure {
    pub fn from_error(err: &DbError, side_effect_possible: bool) -> Self {
        Self {
            kind: err.kind(),
            native_code: err.native_code().map(str::to_string),
            message: err.to_string(),
            side_effect_possible,
            suggestion: err.suggestion().map(str::to_string),
        }
    }

    /// Failure raised before anything reached a backend.
    pub fn rejected(err: &DbError) -> Self {
        Self::from_error(err, false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedResult {
    Rows(RowSet),
    Affected {
        rows_affected: u64,
        last_insert_id: Option<u64>,
    },
    Failure(Failure),
}

impl NormalizedResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(f) => Some(f),
            _ => None,
        }
    }
}
