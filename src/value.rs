//! Typed column values.
//!
//! A [`TypedValue`] boxes one column value together with its SQL type tag and
//! the column name it belongs to. The type tag is fixed at construction; any
//! attempt to store a value of another runtime kind fails with a Sql-kind
//! error. Conversions to and from JSON and plain text use the tag to pick the
//! encoding (numbers stay numbers, bytes become base64, dates become ISO
//! strings).

use crate::error::{DbError, DbResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;

/// SQL type tag for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Bool,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Double,
    Bytes,
    Text,
    Date,
    Timestamp,
}

impl SqlType {
    /// Lowercase name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::TinyInt => "tinyint",
            Self::SmallInt => "smallint",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Real => "real",
            Self::Double => "double",
            Self::Bytes => "bytes",
            Self::Text => "text",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
        }
    }

    /// DDL fragment for this type, portable across the supported vendors.
    pub fn ddl(&self) -> &'static str {
        match self {
            Self::Bool => "BOOLEAN",
            Self::TinyInt | Self::SmallInt => "SMALLINT",
            Self::Int => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Real => "REAL",
            Self::Double => "DOUBLE PRECISION",
            Self::Bytes => "BLOB",
            Self::Text => "TEXT",
            Self::Date => "DATE",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One column value. `Null` is valid for every type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Bytes(Vec<u8>),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Check whether this value is storable under the given type tag.
    pub fn matches(&self, sql_type: SqlType) -> bool {
        matches!(
            (self, sql_type),
            (Self::Null, _)
                | (Self::Bool(_), SqlType::Bool)
                | (Self::TinyInt(_), SqlType::TinyInt)
                | (Self::SmallInt(_), SqlType::SmallInt)
                | (Self::Int(_), SqlType::Int)
                | (Self::BigInt(_), SqlType::BigInt)
                | (Self::Real(_), SqlType::Real)
                | (Self::Double(_), SqlType::Double)
                | (Self::Bytes(_), SqlType::Bytes)
                | (Self::Text(_), SqlType::Text)
                | (Self::Date(_), SqlType::Date)
                | (Self::Timestamp(_), SqlType::Timestamp)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Runtime kind name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::TinyInt(_) => "tinyint",
            Self::SmallInt(_) => "smallint",
            Self::Int(_) => "int",
            Self::BigInt(_) => "bigint",
            Self::Real(_) => "real",
            Self::Double(_) => "double",
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

/// One column value paired with its fixed SQL type tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    column: String,
    sql_type: SqlType,
    value: SqlValue,
}

impl TypedValue {
    /// Create a null value for the given column and type.
    pub fn null(column: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            column: column.into(),
            sql_type,
            value: SqlValue::Null,
        }
    }

    /// Create a value, verifying the runtime kind against the tag.
    pub fn new(
        column: impl Into<String>,
        sql_type: SqlType,
        value: SqlValue,
    ) -> DbResult<Self> {
        let mut tv = Self::null(column, sql_type);
        tv.set(value)?;
        Ok(tv)
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    pub fn value(&self) -> &SqlValue {
        &self.value
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Replace the stored value. The runtime kind must match the type tag.
    pub fn set(&mut self, value: SqlValue) -> DbResult<()> {
        if !value.matches(self.sql_type) {
            return Err(DbError::sql(format!(
                "type mismatch for column '{}': expected {}, got {}",
                self.column,
                self.sql_type,
                value.kind_name()
            )));
        }
        self.value = value;
        Ok(())
    }

    /// Encode as a JSON value.
    pub fn to_json(&self) -> JsonValue {
        match &self.value {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(v) => JsonValue::Bool(*v),
            SqlValue::TinyInt(v) => JsonValue::Number((*v).into()),
            SqlValue::SmallInt(v) => JsonValue::Number((*v).into()),
            SqlValue::Int(v) => JsonValue::Number((*v).into()),
            SqlValue::BigInt(v) => JsonValue::Number((*v).into()),
            SqlValue::Real(v) => serde_json::Number::from_f64(*v as f64)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            SqlValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(v.to_string())),
            SqlValue::Bytes(v) => JsonValue::String(STANDARD.encode(v)),
            SqlValue::Text(v) => JsonValue::String(v.clone()),
            SqlValue::Date(v) => JsonValue::String(v.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(v) => JsonValue::String(v.to_rfc3339()),
        }
    }

    /// Decode from a JSON value, guided by the type tag.
    pub fn set_from_json(&mut self, json: &JsonValue) -> DbResult<()> {
        if json.is_null() {
            self.value = SqlValue::Null;
            return Ok(());
        }
        let value = decode_json(self.sql_type, json).ok_or_else(|| {
            DbError::sql(format!(
                "cannot decode {} into column '{}' of type {}",
                json, self.column, self.sql_type
            ))
        })?;
        self.set(value)
    }

    /// Textual encoding; `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match &self.value {
            SqlValue::Null => None,
            SqlValue::Bool(v) => Some(v.to_string()),
            SqlValue::TinyInt(v) => Some(v.to_string()),
            SqlValue::SmallInt(v) => Some(v.to_string()),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::BigInt(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
            SqlValue::Double(v) => Some(v.to_string()),
            SqlValue::Bytes(v) => Some(STANDARD.encode(v)),
            SqlValue::Text(v) => Some(v.clone()),
            SqlValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(v) => Some(v.to_rfc3339()),
        }
    }

    /// Parse the textual encoding produced by [`TypedValue::to_text`].
    pub fn set_from_text(&mut self, text: &str) -> DbResult<()> {
        let value = decode_text(self.sql_type, text).ok_or_else(|| {
            DbError::sql(format!(
                "cannot parse '{}' into column '{}' of type {}",
                text, self.column, self.sql_type
            ))
        })?;
        self.set(value)
    }
}

fn decode_json(sql_type: SqlType, json: &JsonValue) -> Option<SqlValue> {
    match sql_type {
        SqlType::Bool => json.as_bool().map(SqlValue::Bool),
        SqlType::TinyInt => json
            .as_i64()
            .and_then(|v| i8::try_from(v).ok())
            .map(SqlValue::TinyInt),
        SqlType::SmallInt => json
            .as_i64()
            .and_then(|v| i16::try_from(v).ok())
            .map(SqlValue::SmallInt),
        SqlType::Int => json
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(SqlValue::Int),
        SqlType::BigInt => json.as_i64().map(SqlValue::BigInt),
        SqlType::Real => json.as_f64().map(|v| SqlValue::Real(v as f32)),
        SqlType::Double => json.as_f64().map(SqlValue::Double),
        SqlType::Bytes => json
            .as_str()
            .and_then(|s| STANDARD.decode(s).ok())
            .map(SqlValue::Bytes),
        SqlType::Text => json.as_str().map(|s| SqlValue::Text(s.to_string())),
        SqlType::Date => json.as_str().and_then(|s| decode_text(SqlType::Date, s)),
        SqlType::Timestamp => json
            .as_str()
            .and_then(|s| decode_text(SqlType::Timestamp, s)),
    }
}

fn decode_text(sql_type: SqlType, text: &str) -> Option<SqlValue> {
    match sql_type {
        SqlType::Bool => text.parse().ok().map(SqlValue::Bool),
        SqlType::TinyInt => text.parse().ok().map(SqlValue::TinyInt),
        SqlType::SmallInt => text.parse().ok().map(SqlValue::SmallInt),
        SqlType::Int => text.parse().ok().map(SqlValue::Int),
        SqlType::BigInt => text.parse().ok().map(SqlValue::BigInt),
        SqlType::Real => text.parse().ok().map(SqlValue::Real),
        SqlType::Double => text.parse().ok().map(SqlValue::Double),
        SqlType::Bytes => STANDARD.decode(text).ok().map(SqlValue::Bytes),
        SqlType::Text => Some(SqlValue::Text(text.to_string())),
        SqlType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(SqlValue::Date),
        SqlType::Timestamp => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| SqlValue::Timestamp(dt.with_timezone(&Utc))),
    }
}
