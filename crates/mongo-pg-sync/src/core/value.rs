//! Warehouse-side value types produced by the transformer.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

/// Type hint for NULL values so the loader can emit a typed NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I32,
    I64,
    F64,
    String,
    Decimal,
    DateTime,
    Date,
}

/// A single column value headed for the warehouse.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint.
    Null(SqlNullType),

    /// Boolean value.
    Bool(bool),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 64-bit floating point (double precision).
    F64(f64),

    /// Text.
    String(String),

    /// Money and quantities.
    Decimal(Decimal),

    /// Timestamp without timezone (UTC wall clock).
    DateTime(NaiveDateTime),

    /// Date without time component.
    Date(NaiveDate),
}

impl SqlValue {
    /// Whether this is a NULL of any type.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Borrow the text payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Wrap an optional string, typing the NULL as text.
    pub fn opt_string(value: Option<String>) -> Self {
        value.map_or(SqlValue::Null(SqlNullType::String), SqlValue::String)
    }

    /// Wrap an optional timestamp.
    pub fn opt_datetime(value: Option<NaiveDateTime>) -> Self {
        value.map_or(SqlValue::Null(SqlNullType::DateTime), SqlValue::DateTime)
    }
}

/// One transformed source document ready for upsert.
///
/// `values` line up with [`EntityType::columns`](crate::core::EntityType::columns).
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Natural key taken from the source document `_id`.
    pub origin_id: String,
    pub values: Vec<SqlValue>,
}

impl Row {
    pub fn new(origin_id: impl Into<String>, values: Vec<SqlValue>) -> Self {
        Self {
            origin_id: origin_id.into(),
            values,
        }
    }
}
