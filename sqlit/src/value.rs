//! # Value Module
//!
//! Scalar values as they travel between documents, records and SQL parameters,
//! plus the coercion rules applied when a value is assigned to a column.

// ============================================================================
// External Crate Imports
// ============================================================================

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Number, Value as JsonValue};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{schema::SimpleField, Error, Result};

/// A JSON object, the shape every row and filter takes on the public API.
pub type Document = Map<String, JsonValue>;

// ============================================================================
// Value Enum
// ============================================================================

/// A scalar column value.
///
/// Floats compare and hash by bit pattern so values can key identity maps.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => b.hash(state),
            // integral floats hash like the equal integer
            Value::Int(i) => i.hash(state),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => (*f as i64).hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts a JSON scalar. Objects and arrays are not values.
    pub fn from_json(value: &JsonValue) -> Option<Value> {
        match value {
            JsonValue::Null => Some(Value::Null),
            JsonValue::Bool(b) => Some(Value::Bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            JsonValue::String(s) => Some(Value::Text(s.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::Number((*i).into()),
            Value::Float(f) => Number::from_f64(*f).map(JsonValue::Number).unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Returns true for JSON values that are scalars (including null).
pub fn is_value(value: &JsonValue) -> bool {
    !matches!(value, JsonValue::Array(_) | JsonValue::Object(_))
}

// ============================================================================
// Column Kinds
// ============================================================================

/// Coarse classification of a column's declared SQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Uuid,
    Text,
    DateTime,
    Integer,
    Float,
    Boolean,
    Other,
}

impl ColumnKind {
    /// Classifies a declared SQL type by its words, so `POINT` is not read as
    /// an integer. Trailing width digits are ignored (`INT8`, `FLOAT4`). The
    /// first matching kind wins, in the order the checks are written:
    /// `TIMESTAMP WITH TIME ZONE` is a date and `CHARACTER VARYING` is text.
    pub fn classify(sql_type: &str) -> ColumnKind {
        const UUID: &[&str] = &["uuid", "uniqueidentifier"];
        const TEXT: &[&str] = &[
            "text", "tinytext", "mediumtext", "longtext", "ntext", "citext", "string", "char", "nchar", "varchar",
            "nvarchar", "character", "clob", "nclob",
        ];
        const DATE_TIME: &[&str] = &["date", "time", "datetime", "timestamp", "timestamptz", "timetz", "smalldatetime"];
        const INTEGER: &[&str] = &[
            "int", "integer", "tinyint", "smallint", "mediumint", "bigint", "serial", "smallserial", "bigserial", "long",
        ];
        const FLOAT: &[&str] = &["float", "double", "real", "decimal", "dec", "numeric"];
        const BOOLEAN: &[&str] = &["bool", "boolean"];

        let t = sql_type.to_ascii_lowercase();
        let words: Vec<&str> = t
            .split(|c: char| !c.is_ascii_alphanumeric())
            .map(|word| word.trim_end_matches(|c: char| c.is_ascii_digit()))
            .filter(|word| !word.is_empty())
            .collect();
        let any_of = |kind: &[&str]| words.iter().any(|word| kind.contains(word));

        if any_of(UUID) {
            ColumnKind::Uuid
        } else if any_of(TEXT) {
            ColumnKind::Text
        } else if any_of(DATE_TIME) {
            ColumnKind::DateTime
        } else if any_of(INTEGER) {
            ColumnKind::Integer
        } else if any_of(FLOAT) {
            ColumnKind::Float
        } else if any_of(BOOLEAN) {
            ColumnKind::Boolean
        } else {
            ColumnKind::Other
        }
    }
}

// ============================================================================
// Coercion
// ============================================================================

fn invalid(field: &SimpleField, value: &Value) -> Error {
    Error::InvalidValue { field: field.name.clone(), value: value.to_string() }
}

/// Parses the date formats accepted on input. Naive values are taken as UTC.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Text(s) => parse_datetime(s),
        Value::Int(ms) => DateTime::from_timestamp_millis(*ms),
        Value::Float(ms) => DateTime::from_timestamp_millis(*ms as i64),
        _ => None,
    }
}

/// `parseInt` semantics: optional sign followed by leading digits.
fn parse_leading_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let digits = s.strip_prefix(&['-', '+'][..]).unwrap_or(s);
    let len = digits.chars().take_while(|c| c.is_ascii_digit()).count();
    if len == 0 {
        return None;
    }
    let end = s.len() - digits.len() + len;
    s[..end].parse().ok()
}

/// Normalizes a value assigned to `field` into its in-memory form.
pub fn normalize(value: Value, field: &SimpleField) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match field.column.kind {
        ColumnKind::Uuid => match &value {
            Value::Text(s) => Uuid::parse_str(s.trim())
                .map(|id| Value::Text(id.hyphenated().to_string()))
                .map_err(|_| invalid(field, &value)),
            _ => Err(invalid(field, &value)),
        },
        ColumnKind::Text => {
            let text = match value {
                Value::Text(s) => s,
                other => other.to_string(),
            };
            Ok(Value::Text(if field.unique { text.trim().to_string() } else { text }))
        }
        ColumnKind::DateTime => to_datetime(&value)
            .map(|dt| Value::Text(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()))
            .ok_or_else(|| invalid(field, &value)),
        ColumnKind::Integer => match &value {
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Int(_) => Ok(value),
            Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
            Value::Text(s) => parse_leading_int(s).map(Value::Int).ok_or_else(|| invalid(field, &value)),
            Value::Null => Ok(Value::Null),
        },
        ColumnKind::Float => match &value {
            Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Float(_) => Ok(value),
            Value::Text(s) => s.trim().parse().map(Value::Float).map_err(|_| invalid(field, &value)),
            Value::Null => Ok(Value::Null),
        },
        ColumnKind::Boolean => Ok(Value::Bool(match &value {
            Value::Bool(b) => *b,
            Value::Text(s) => {
                let s = s.trim();
                !(s.eq_ignore_ascii_case("false") || s == "0")
            }
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Null => false,
        })),
        ColumnKind::Other => match value {
            Value::Text(s) if field.unique => Ok(Value::Text(s.trim().to_string())),
            other => Ok(other),
        },
    }
}

/// Converts an in-memory value into the form written to the database.
pub fn to_row(value: &Value, field: &SimpleField) -> Value {
    if field.column.kind == ColumnKind::DateTime {
        if let Some(dt) = to_datetime(value) {
            return Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string());
        }
    }
    value.clone()
}
