//! Physical database connections.
//!
//! [`DbConnection`] wraps one vendor-specific sqlx connection (not a pool:
//! the Session is the arbiter of this single handle) and provides unified
//! parameterized execution, typed row fetching, and JSON row fetching.
//!
//! # Architecture
//!
//! Parameter binding and row decoding are organized in per-vendor submodules
//! with intentionally parallel shape, so the differences between drivers stay
//! obvious. Raw sqlx errors are converted at every exit point and each
//! statement-kind failure carries the offending SQL text.

use crate::error::{DbError, DbResult};
use crate::value::{SqlType, SqlValue};
use serde_json::Value as JsonValue;
use sqlx::{Connection, Executor, MySqlConnection, PgConnection, SqliteConnection};
use tracing::debug;

/// Supported database vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorKind {
    Postgres,
    /// Includes MariaDB
    MySql,
    Sqlite,
}

impl VendorKind {
    /// Detect the vendor from a connection-string scheme prefix.
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySql)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
        }
    }
}

impl std::fmt::Display for VendorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One vendor-specific physical connection.
#[derive(Debug)]
pub enum DbConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

impl DbConnection {
    /// Get the vendor for this connection.
    pub fn vendor(&self) -> VendorKind {
        match self {
            Self::Postgres(_) => VendorKind::Postgres,
            Self::MySql(_) => VendorKind::MySql,
            Self::Sqlite(_) => VendorKind::Sqlite,
        }
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        debug!(sql = %sql, params = params.len(), "executing statement");
        let rows = match self {
            Self::Postgres(conn) => postgres::execute(conn, sql, params).await,
            Self::MySql(conn) => mysql::execute(conn, sql, params).await,
            Self::Sqlite(conn) => sqlite::execute(conn, sql, params).await,
        };
        rows.map_err(|e| DbError::from(e).with_statement(sql))
    }

    /// Fetch all rows, decoding each column by the expected SQL type.
    ///
    /// The expected slice must match the statement's column order.
    pub async fn fetch_typed(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        debug!(sql = %sql, params = params.len(), "fetching typed rows");
        let rows = match self {
            Self::Postgres(conn) => postgres::fetch_typed(conn, sql, params, expected).await,
            Self::MySql(conn) => mysql::fetch_typed(conn, sql, params, expected).await,
            Self::Sqlite(conn) => sqlite::fetch_typed(conn, sql, params, expected).await,
        };
        rows.map_err(|e| e.with_statement(sql))
    }

    /// Fetch all rows as flat column-name to JSON maps, decoding by the
    /// driver-reported column type. Used for ad hoc statements where no
    /// declared column metadata exists.
    pub async fn fetch_json(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Vec<serde_json::Map<String, JsonValue>>> {
        debug!(sql = %sql, params = params.len(), "fetching json rows");
        let rows = match self {
            Self::Postgres(conn) => postgres::fetch_json(conn, sql, params).await,
            Self::MySql(conn) => mysql::fetch_json(conn, sql, params).await,
            Self::Sqlite(conn) => sqlite::fetch_json(conn, sql, params).await,
        };
        rows.map_err(|e| DbError::from(e).with_statement(sql))
    }

    /// Compile a statement on this connection without executing it. Warms the
    /// driver statement cache and surfaces syntax errors early.
    pub async fn prepare(&mut self, sql: &str) -> DbResult<()> {
        let result = match self {
            Self::Postgres(conn) => conn.prepare(sql).await.map(|_| ()),
            Self::MySql(conn) => conn.prepare(sql).await.map(|_| ()),
            Self::Sqlite(conn) => conn.prepare(sql).await.map(|_| ()),
        };
        result.map_err(|e| DbError::from(e).with_statement(sql))
    }

    /// Run the liveness probe.
    pub async fn ping(&mut self) -> DbResult<()> {
        let result = match self {
            Self::Postgres(conn) => conn.ping().await,
            Self::MySql(conn) => conn.ping().await,
            Self::Sqlite(conn) => conn.ping().await,
        };
        result.map_err(DbError::from)
    }

    /// Gracefully close the connection.
    pub async fn close(self) -> DbResult<()> {
        let result = match self {
            Self::Postgres(conn) => conn.close().await,
            Self::MySql(conn) => conn.close().await,
            Self::Sqlite(conn) => conn.close().await,
        };
        result.map_err(DbError::from)
    }
}

// =============================================================================
// Vendor-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its driver's type
// support. Integer widths are widened on bind where the driver lacks a native
// encoding and narrowed back on decode.

mod postgres {
    use super::*;
    use sqlx::Row;
    use sqlx::postgres::{PgArguments, PgRow};

    pub async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        Ok(query.execute(conn).await?.rows_affected())
    }

    pub async fn fetch_typed(
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(conn).await.map_err(DbError::from)?;
        rows.iter().map(|row| decode_row(row, expected)).collect()
    }

    pub async fn fetch_json(
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<serde_json::Map<String, JsonValue>>, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(conn).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
        param: &'q SqlValue,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
        match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            // PostgreSQL has no one-byte integer; widen to SMALLINT
            SqlValue::TinyInt(v) => query.bind(*v as i16),
            SqlValue::SmallInt(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::BigInt(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Double(v) => query.bind(*v),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Date(v) => query.bind(*v),
            SqlValue::Timestamp(v) => query.bind(*v),
        }
    }

    fn decode_row(row: &PgRow, expected: &[SqlType]) -> DbResult<Vec<SqlValue>> {
        expected
            .iter()
            .enumerate()
            .map(|(idx, sql_type)| decode_column(row, idx, *sql_type))
            .collect()
    }

    fn decode_column(row: &PgRow, idx: usize, sql_type: SqlType) -> DbResult<SqlValue> {
        macro_rules! get {
            ($ty:ty, $variant:expr) => {
                row.try_get::<Option<$ty>, _>(idx)
                    .map(|opt| opt.map($variant).unwrap_or(SqlValue::Null))
                    .map_err(DbError::from)
            };
        }
        match sql_type {
            SqlType::Bool => get!(bool, SqlValue::Bool),
            SqlType::TinyInt => row
                .try_get::<Option<i16>, _>(idx)
                .map_err(DbError::from)?
                .map(|v| {
                    i8::try_from(v).map(SqlValue::TinyInt).map_err(|_| {
                        DbError::sql(format!("value {v} out of range for tinyint column {idx}"))
                    })
                })
                .unwrap_or(Ok(SqlValue::Null)),
            SqlType::SmallInt => get!(i16, SqlValue::SmallInt),
            SqlType::Int => get!(i32, SqlValue::Int),
            SqlType::BigInt => get!(i64, SqlValue::BigInt),
            SqlType::Real => get!(f32, SqlValue::Real),
            SqlType::Double => get!(f64, SqlValue::Double),
            SqlType::Bytes => get!(Vec<u8>, SqlValue::Bytes),
            SqlType::Text => get!(String, SqlValue::Text),
            SqlType::Date => get!(chrono::NaiveDate, SqlValue::Date),
            SqlType::Timestamp => get!(chrono::DateTime<chrono::Utc>, SqlValue::Timestamp),
        }
    }

    fn row_to_json(row: &PgRow) -> serde_json::Map<String, JsonValue> {
        use sqlx::{Column, TypeInfo};
        row.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name().to_lowercase();
                let value = if type_name.contains("int") || type_name.contains("serial") {
                    row.try_get::<Option<i64>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|v| JsonValue::Number(v.into()))
                } else if type_name == "bool" {
                    row.try_get::<Option<bool>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::Bool)
                } else if type_name.contains("float") || type_name == "real" || type_name == "numeric"
                {
                    row.try_get::<Option<f64>, _>(idx)
                        .ok()
                        .flatten()
                        .and_then(|v| serde_json::Number::from_f64(v).map(JsonValue::Number))
                } else if type_name == "bytea" {
                    row.try_get::<Option<Vec<u8>>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|v| JsonValue::String(super::encode_bytes(&v)))
                } else {
                    row.try_get::<Option<String>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::String)
                };
                (col.name().to_string(), value.unwrap_or(JsonValue::Null))
            })
            .collect()
    }
}

mod mysql {
    use super::*;
    use sqlx::Row;
    use sqlx::mysql::{MySqlArguments, MySqlRow};

    pub async fn execute(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, sqlx::Error> {
        // Statements like CREATE PROCEDURE reject the prepared path; run raw
        // when there is nothing to bind.
        if params.is_empty() {
            return Ok(conn.execute(sql).await?.rows_affected());
        }
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        Ok(query.execute(conn).await?.rows_affected())
    }

    pub async fn fetch_typed(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(conn).await.map_err(DbError::from)?;
        rows.iter().map(|row| decode_row(row, expected)).collect()
    }

    pub async fn fetch_json(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<serde_json::Map<String, JsonValue>>, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(conn).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
        param: &'q SqlValue,
    ) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
        match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::TinyInt(v) => query.bind(*v),
            SqlValue::SmallInt(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::BigInt(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Double(v) => query.bind(*v),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Date(v) => query.bind(*v),
            SqlValue::Timestamp(v) => query.bind(*v),
        }
    }

    fn decode_row(row: &MySqlRow, expected: &[SqlType]) -> DbResult<Vec<SqlValue>> {
        expected
            .iter()
            .enumerate()
            .map(|(idx, sql_type)| decode_column(row, idx, *sql_type))
            .collect()
    }

    fn decode_column(row: &MySqlRow, idx: usize, sql_type: SqlType) -> DbResult<SqlValue> {
        macro_rules! get {
            ($ty:ty, $variant:expr) => {
                row.try_get::<Option<$ty>, _>(idx)
                    .map(|opt| opt.map($variant).unwrap_or(SqlValue::Null))
                    .map_err(DbError::from)
            };
        }
        match sql_type {
            SqlType::Bool => get!(bool, SqlValue::Bool),
            SqlType::TinyInt => get!(i8, SqlValue::TinyInt),
            SqlType::SmallInt => get!(i16, SqlValue::SmallInt),
            SqlType::Int => get!(i32, SqlValue::Int),
            SqlType::BigInt => get!(i64, SqlValue::BigInt),
            SqlType::Real => get!(f32, SqlValue::Real),
            SqlType::Double => get!(f64, SqlValue::Double),
            SqlType::Bytes => get!(Vec<u8>, SqlValue::Bytes),
            SqlType::Text => get!(String, SqlValue::Text),
            SqlType::Date => get!(chrono::NaiveDate, SqlValue::Date),
            SqlType::Timestamp => get!(chrono::DateTime<chrono::Utc>, SqlValue::Timestamp),
        }
    }

    fn row_to_json(row: &MySqlRow) -> serde_json::Map<String, JsonValue> {
        use sqlx::{Column, TypeInfo};
        row.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name().to_lowercase();
                let value = if type_name.contains("int") {
                    row.try_get::<Option<i64>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|v| JsonValue::Number(v.into()))
                } else if type_name == "boolean" {
                    row.try_get::<Option<bool>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::Bool)
                } else if type_name.contains("float") || type_name.contains("double") {
                    row.try_get::<Option<f64>, _>(idx)
                        .ok()
                        .flatten()
                        .and_then(|v| serde_json::Number::from_f64(v).map(JsonValue::Number))
                } else if type_name.contains("blob") || type_name.contains("binary") {
                    row.try_get::<Option<Vec<u8>>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|v| JsonValue::String(super::encode_bytes(&v)))
                } else {
                    row.try_get::<Option<String>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::String)
                };
                (col.name().to_string(), value.unwrap_or(JsonValue::Null))
            })
            .collect()
    }
}

mod sqlite {
    use super::*;
    use sqlx::Row;
    use sqlx::sqlite::{SqliteArguments, SqliteRow};

    pub async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        Ok(query.execute(conn).await?.rows_affected())
    }

    pub async fn fetch_typed(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(conn).await.map_err(DbError::from)?;
        rows.iter().map(|row| decode_row(row, expected)).collect()
    }

    pub async fn fetch_json(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<serde_json::Map<String, JsonValue>>, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(conn).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
        param: &'q SqlValue,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
        match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            // SQLite stores one integer class; widen everything
            SqlValue::TinyInt(v) => query.bind(*v as i64),
            SqlValue::SmallInt(v) => query.bind(*v as i64),
            SqlValue::Int(v) => query.bind(*v as i64),
            SqlValue::BigInt(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v as f64),
            SqlValue::Double(v) => query.bind(*v),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Date(v) => query.bind(*v),
            SqlValue::Timestamp(v) => query.bind(*v),
        }
    }

    fn decode_row(row: &SqliteRow, expected: &[SqlType]) -> DbResult<Vec<SqlValue>> {
        expected
            .iter()
            .enumerate()
            .map(|(idx, sql_type)| decode_column(row, idx, *sql_type))
            .collect()
    }

    fn narrow<T: TryFrom<i64>>(v: i64, idx: usize, target: SqlType) -> DbResult<T> {
        T::try_from(v).map_err(|_| {
            DbError::sql(format!(
                "value {v} out of range for {target} column {idx}"
            ))
        })
    }

    fn decode_column(row: &SqliteRow, idx: usize, sql_type: SqlType) -> DbResult<SqlValue> {
        macro_rules! get {
            ($ty:ty, $variant:expr) => {
                row.try_get::<Option<$ty>, _>(idx)
                    .map(|opt| opt.map($variant).unwrap_or(SqlValue::Null))
                    .map_err(DbError::from)
            };
        }
        macro_rules! get_narrowed {
            ($variant:expr) => {
                row.try_get::<Option<i64>, _>(idx)
                    .map_err(DbError::from)?
                    .map(|v| narrow(v, idx, sql_type).map($variant))
                    .unwrap_or(Ok(SqlValue::Null))
            };
        }
        match sql_type {
            SqlType::Bool => get!(bool, SqlValue::Bool),
            SqlType::TinyInt => get_narrowed!(SqlValue::TinyInt),
            SqlType::SmallInt => get_narrowed!(SqlValue::SmallInt),
            SqlType::Int => get_narrowed!(SqlValue::Int),
            SqlType::BigInt => get!(i64, SqlValue::BigInt),
            SqlType::Real => row
                .try_get::<Option<f64>, _>(idx)
                .map(|opt| opt.map(|v| SqlValue::Real(v as f32)).unwrap_or(SqlValue::Null))
                .map_err(DbError::from),
            SqlType::Double => get!(f64, SqlValue::Double),
            SqlType::Bytes => get!(Vec<u8>, SqlValue::Bytes),
            SqlType::Text => get!(String, SqlValue::Text),
            SqlType::Date => get!(chrono::NaiveDate, SqlValue::Date),
            SqlType::Timestamp => get!(chrono::DateTime<chrono::Utc>, SqlValue::Timestamp),
        }
    }

    fn row_to_json(row: &SqliteRow) -> serde_json::Map<String, JsonValue> {
        use sqlx::{Column, TypeInfo};
        row.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name().to_lowercase();
                let value = if type_name.contains("int") {
                    row.try_get::<Option<i64>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|v| JsonValue::Number(v.into()))
                } else if type_name == "boolean" {
                    row.try_get::<Option<bool>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::Bool)
                } else if type_name == "real" || type_name == "numeric" {
                    row.try_get::<Option<f64>, _>(idx)
                        .ok()
                        .flatten()
                        .and_then(|v| serde_json::Number::from_f64(v).map(JsonValue::Number))
                } else if type_name == "blob" {
                    row.try_get::<Option<Vec<u8>>, _>(idx)
                        .ok()
                        .flatten()
                        .map(|v| JsonValue::String(super::encode_bytes(&v)))
                } else {
                    row.try_get::<Option<String>, _>(idx)
                        .ok()
                        .flatten()
                        .map(JsonValue::String)
                };
                (col.name().to_string(), value.unwrap_or(JsonValue::Null))
            })
            .collect()
    }
}

fn encode_bytes(bytes: &[u8]) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_from_url() {
        assert_eq!(
            VendorKind::from_url("postgres://localhost/db"),
            Some(VendorKind::Postgres)
        );
        assert_eq!(
            VendorKind::from_url("postgresql://localhost/db"),
            Some(VendorKind::Postgres)
        );
        assert_eq!(
            VendorKind::from_url("mysql://localhost/db"),
            Some(VendorKind::MySql)
        );
        assert_eq!(
            VendorKind::from_url("mariadb://localhost/db"),
            Some(VendorKind::MySql)
        );
        assert_eq!(
            VendorKind::from_url("sqlite:test.db"),
            Some(VendorKind::Sqlite)
        );
        assert_eq!(VendorKind::from_url("unknown://localhost"), None);
    }

    #[test]
    fn test_vendor_display() {
        assert_eq!(VendorKind::Postgres.to_string(), "PostgreSQL");
        assert_eq!(VendorKind::Sqlite.to_string(), "SQLite");
    }
}
