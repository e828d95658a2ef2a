//! Native type classification and row decoding.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. [`categorize_type`] maps a native type name onto the closed [`TypeTag`] set
//! 2. Dialect-specific decoders pull each cell out as a [`Scalar`]
//!
//! Decoders never fail a whole row. A cell the driver can't decode falls back
//! to its text form, then to an `<unsupported TYPE>` marker.

use crate::models::{ColumnShape, Scalar, Temporal, TypeTag};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use std::fmt::Write as _;

// =============================================================================
// Type Classification
// =============================================================================

/// Classify a native type name into a [`TypeTag`].
pub fn categorize_type(type_name: &str) -> TypeTag {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeTag::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeTag::Boolean;
    }

    // Names that merely contain "int"
    if lower.ends_with("[]")
        || lower.contains("interval")
        || lower.contains("point")
        || lower.contains("range")
    {
        return TypeTag::Text;
    }

    if lower.contains("int") || lower.contains("serial") || lower == "year" || lower == "bit" {
        return TypeTag::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeTag::Float;
    }

    if lower.starts_with("date") || lower.starts_with("time") {
        return TypeTag::Datetime;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeTag::Binary;
    }

    if lower == "null" || lower == "void" {
        return TypeTag::Null;
    }

    TypeTag::Text
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        // MySQL sends DECIMAL as text in both protocols
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(decode_pg_numeric(value.as_bytes()?)?)),
        }
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render PostgreSQL's binary NUMERIC (base-10000 digit groups) as exact text.
///
/// Layout: ndigits, weight, sign, dscale (all big-endian 16-bit) followed by
/// `ndigits` groups. `weight` is the power of 10000 of the first group.
pub fn decode_pg_numeric(buf: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    if buf.len() < 8 {
        return Err("NUMERIC value shorter than its header".into());
    }
    let read_u16 = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);

    let ndigits = read_u16(0) as usize;
    let weight = read_u16(2) as i16 as i32;
    let sign = read_u16(4);
    let dscale = read_u16(6) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    if buf.len() < 8 + ndigits * 2 {
        return Err("NUMERIC value truncated".into());
    }
    let digits: Vec<u16> = (0..ndigits).map(|i| read_u16(8 + i * 2)).collect();
    let digit_at = |i: i32| -> u16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                let _ = write!(out, "{}", digit_at(i));
            } else {
                let _ = write!(out, "{:04}", digit_at(i));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit_at(i));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Trait for converting database rows into normalized cells.
pub trait RowDecoder {
    /// Column shapes as far as the row itself can tell (no nullability).
    fn column_shapes(&self) -> Vec<ColumnShape>;
    fn to_scalars(&self) -> Vec<Scalar>;
}

impl RowDecoder for MySqlRow {
    fn column_shapes(&self) -> Vec<ColumnShape> {
        shapes_of(self)
    }

    fn to_scalars(&self) -> Vec<Scalar> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                mysql::decode_column(self, idx, type_name, categorize_type(type_name))
            })
            .collect()
    }
}

impl RowDecoder for PgRow {
    fn column_shapes(&self) -> Vec<ColumnShape> {
        shapes_of(self)
    }

    fn to_scalars(&self) -> Vec<Scalar> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                postgres::decode_column(self, idx, type_name, categorize_type(type_name))
            })
            .collect()
    }
}

fn shapes_of<R: Row>(row: &R) -> Vec<ColumnShape> {
    row.columns()
        .iter()
        .map(|col| {
            let type_name = col.type_info().name();
            ColumnShape::new(col.name(), categorize_type(type_name), type_name)
        })
        .collect()
}

fn unsupported(type_name: &str) -> Scalar {
    tracing::warn!(native_type = %type_name, "Could not decode column value");
    Scalar::Text(format!("<unsupported {}>", type_name))
}

fn unsigned_scalar(v: u64) -> Scalar {
    match i64::try_from(v) {
        Ok(i) => Scalar::Integer(i),
        Err(_) => Scalar::Unsigned(v),
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
    use sqlx::mysql::types::MySqlTime;

    pub fn decode_column(row: &MySqlRow, idx: usize, type_name: &str, tag: TypeTag) -> Scalar {
        match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return Scalar::Null,
            Ok(_) => {}
            Err(_) => return unsupported(type_name),
        }

        let decoded = match tag {
            TypeTag::Decimal => decode_decimal(row, idx),
            TypeTag::Integer => decode_integer(row, idx),
            TypeTag::Boolean => decode_boolean(row, idx),
            TypeTag::Float => decode_float(row, idx),
            TypeTag::Datetime => decode_datetime(row, idx, type_name),
            TypeTag::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(Scalar::Binary),
            TypeTag::Null => Some(Scalar::Null),
            TypeTag::Text => None,
        };
        decoded.unwrap_or_else(|| decode_text(row, idx, type_name))
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> Option<Scalar> {
        row.try_get::<RawDecimal, _>(idx)
            .ok()
            .map(|v| Scalar::Decimal(v.0))
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<Scalar> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(Scalar::Integer(v));
        }
        if let Ok(v) = row.try_get::<u64, _>(idx) {
            return Some(unsigned_scalar(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(Scalar::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return Some(Scalar::Integer(v.into()));
        }
        // YEAR and BIT carry integer payloads under their own column types
        row.try_get_unchecked::<u64, _>(idx)
            .ok()
            .map(unsigned_scalar)
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> Option<Scalar> {
        if let Ok(v) = row.try_get::<bool, _>(idx) {
            return Some(Scalar::Boolean(v));
        }
        // BOOLEAN is TINYINT(1) on the wire
        row.try_get::<i8, _>(idx).ok().map(|v| Scalar::Boolean(v != 0))
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Option<Scalar> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(Scalar::Float(v));
        }
        row.try_get::<f32, _>(idx)
            .ok()
            .map(|v| Scalar::Float(v.into()))
    }

    fn decode_datetime(row: &MySqlRow, idx: usize, type_name: &str) -> Option<Scalar> {
        let temporal = match type_name.to_uppercase().as_str() {
            "DATE" => row.try_get::<NaiveDate, _>(idx).ok().map(Temporal::Date),
            // TIME is a signed span of up to 838 hours
            "TIME" => row.try_get::<MySqlTime, _>(idx).ok().map(|t| {
                Temporal::from_time_parts(
                    t.sign().is_negative(),
                    t.hours(),
                    t.minutes(),
                    t.seconds(),
                    t.microseconds(),
                )
            }),
            // Sessions run with time_zone = '+00:00'
            "TIMESTAMP" => row
                .try_get::<DateTime<Utc>, _>(idx)
                .ok()
                .map(Temporal::Utc),
            _ => row
                .try_get::<NaiveDateTime, _>(idx)
                .ok()
                .map(Temporal::Naive),
        };
        temporal.map(Scalar::Datetime)
    }

    fn decode_text(row: &MySqlRow, idx: usize, type_name: &str) -> Scalar {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Scalar::Text(v);
        }
        if let Ok(v) = row.try_get::<serde_json::Value, _>(idx) {
            return Scalar::Text(v.to_string());
        }
        // Text protocol rows always carry UTF-8 text
        if let Ok(v) = row.try_get_unchecked::<String, _>(idx) {
            return Scalar::Text(v);
        }
        unsupported(type_name)
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use sqlx::postgres::types::PgTimeTz;

    pub fn decode_column(row: &PgRow, idx: usize, type_name: &str, tag: TypeTag) -> Scalar {
        match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return Scalar::Null,
            Ok(_) => {}
            Err(_) => return unsupported(type_name),
        }

        let decoded = match tag {
            TypeTag::Decimal => decode_decimal(row, idx),
            TypeTag::Integer => decode_integer(row, idx),
            TypeTag::Boolean => row.try_get::<bool, _>(idx).ok().map(Scalar::Boolean),
            TypeTag::Float => decode_float(row, idx),
            TypeTag::Datetime => decode_datetime(row, idx),
            TypeTag::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(Scalar::Binary),
            TypeTag::Null => Some(Scalar::Null),
            TypeTag::Text => None,
        };
        decoded.unwrap_or_else(|| decode_text(row, idx, type_name))
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> Option<Scalar> {
        row.try_get::<RawDecimal, _>(idx)
            .ok()
            .map(|v| Scalar::Decimal(v.0))
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<Scalar> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(Scalar::Integer(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(Scalar::Integer(v.into()));
        }
        row.try_get::<i16, _>(idx)
            .ok()
            .map(|v| Scalar::Integer(v.into()))
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<Scalar> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(Scalar::Float(v));
        }
        row.try_get::<f32, _>(idx)
            .ok()
            .map(|v| Scalar::Float(v.into()))
    }

    fn decode_datetime(row: &PgRow, idx: usize) -> Option<Scalar> {
        if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
            return Some(Scalar::Datetime(Temporal::Utc(v)));
        }
        if let Ok(v) = row.try_get::<NaiveDateTime, _>(idx) {
            return Some(Scalar::Datetime(Temporal::Naive(v)));
        }
        if let Ok(v) = row.try_get::<NaiveDate, _>(idx) {
            return Some(Scalar::Datetime(Temporal::Date(v)));
        }
        if let Ok(v) = row.try_get::<NaiveTime, _>(idx) {
            return Some(Scalar::Datetime(Temporal::Time(v)));
        }
        // TIMETZ has no UTC normal form; keep its offset
        row.try_get::<PgTimeTz<NaiveTime, FixedOffset>, _>(idx)
            .ok()
            .map(|v| {
                Scalar::Text(format!(
                    "{}{}",
                    Temporal::Time(v.time).to_canonical(),
                    v.offset
                ))
            })
    }

    fn decode_text(row: &PgRow, idx: usize, type_name: &str) -> Scalar {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Scalar::Text(v);
        }
        if let Ok(v) = row.try_get::<uuid::Uuid, _>(idx) {
            return Scalar::Text(v.to_string());
        }
        if let Ok(v) = row.try_get::<serde_json::Value, _>(idx) {
            return Scalar::Text(v.to_string());
        }
        if let Ok(raw) = row.try_get_raw(idx) {
            if raw.format() == PgValueFormat::Text {
                if let Ok(s) = raw.as_str() {
                    return Scalar::Text(s.to_string());
                }
            }
        }
        unsupported(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(ndigits: u16, weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ndigits.to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&sign.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            buf.extend_from_slice(&d.to_be_bytes());
        }
        buf
    }

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(categorize_type("INT"), TypeTag::Integer);
        assert_eq!(categorize_type("BIGINT UNSIGNED"), TypeTag::Integer);
        assert_eq!(categorize_type("INT8"), TypeTag::Integer);
        assert_eq!(categorize_type("SERIAL"), TypeTag::Integer);
        assert_eq!(categorize_type("YEAR"), TypeTag::Integer);
        assert_eq!(categorize_type("BIT"), TypeTag::Integer);
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(categorize_type("DECIMAL"), TypeTag::Decimal);
        assert_eq!(categorize_type("NUMERIC"), TypeTag::Decimal);
        assert_eq!(categorize_type("numeric(10,2)"), TypeTag::Decimal);
    }

    #[test]
    fn test_categorize_type_datetime() {
        assert_eq!(categorize_type("DATE"), TypeTag::Datetime);
        assert_eq!(categorize_type("DATETIME"), TypeTag::Datetime);
        assert_eq!(categorize_type("TIMESTAMPTZ"), TypeTag::Datetime);
        assert_eq!(categorize_type("time"), TypeTag::Datetime);
    }

    #[test]
    fn test_categorize_type_misc() {
        assert_eq!(categorize_type("BOOL"), TypeTag::Boolean);
        assert_eq!(categorize_type("FLOAT8"), TypeTag::Float);
        assert_eq!(categorize_type("DOUBLE"), TypeTag::Float);
        assert_eq!(categorize_type("BYTEA"), TypeTag::Binary);
        assert_eq!(categorize_type("VARBINARY"), TypeTag::Binary);
        assert_eq!(categorize_type("MEDIUMBLOB"), TypeTag::Binary);
        assert_eq!(categorize_type("NULL"), TypeTag::Null);
        assert_eq!(categorize_type("VARCHAR"), TypeTag::Text);
        assert_eq!(categorize_type("JSONB"), TypeTag::Text);
    }

    #[test]
    fn test_categorize_type_int_lookalikes_are_text() {
        assert_eq!(categorize_type("INTERVAL"), TypeTag::Text);
        assert_eq!(categorize_type("POINT"), TypeTag::Text);
        assert_eq!(categorize_type("INT4RANGE"), TypeTag::Text);
        assert_eq!(categorize_type("INT4[]"), TypeTag::Text);
    }

    #[test]
    fn test_pg_numeric_fraction() {
        // 12.50
        let buf = numeric(2, 0, 0, 2, &[12, 5000]);
        assert_eq!(decode_pg_numeric(&buf).unwrap(), "12.50");
    }

    #[test]
    fn test_pg_numeric_small_and_negative() {
        // 0.001
        let buf = numeric(1, -1, 0, 3, &[10]);
        assert_eq!(decode_pg_numeric(&buf).unwrap(), "0.001");
        // -10000.5
        let buf = numeric(3, 1, NUMERIC_NEG, 1, &[1, 0, 5000]);
        assert_eq!(decode_pg_numeric(&buf).unwrap(), "-10000.5");
    }

    #[test]
    fn test_pg_numeric_trailing_zero_groups() {
        // 1000000 is stored as a single group with weight 1
        let buf = numeric(1, 1, 0, 0, &[100]);
        assert_eq!(decode_pg_numeric(&buf).unwrap(), "1000000");
        let buf = numeric(0, 0, 0, 0, &[]);
        assert_eq!(decode_pg_numeric(&buf).unwrap(), "0");
    }

    #[test]
    fn test_pg_numeric_special_values() {
        assert_eq!(
            decode_pg_numeric(&numeric(0, 0, NUMERIC_NAN, 0, &[])).unwrap(),
            "NaN"
        );
        assert_eq!(
            decode_pg_numeric(&numeric(0, 0, NUMERIC_NINF, 0, &[])).unwrap(),
            "-Infinity"
        );
    }

    #[test]
    fn test_pg_numeric_rejects_short_input() {
        assert!(decode_pg_numeric(&[0, 1]).is_err());
        assert!(decode_pg_numeric(&numeric(2, 0, 0, 0, &[1])).is_err());
    }

    #[test]
    fn test_unsigned_scalar_overflow() {
        assert_eq!(unsigned_scalar(5), Scalar::Integer(5));
        assert_eq!(unsigned_scalar(u64::MAX), Scalar::Unsigned(u64::MAX));
    }
}
