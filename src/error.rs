//! Error types for the access layer.
//!
//! This module defines the three-kind error taxonomy using `thiserror`.
//! Every raw driver error is translated into exactly one of these kinds at
//! the request boundary; callers never see a `sqlx::Error`.

use thiserror::Error;

/// Coarse classification of a [`DbError`], used when one representative
/// failure must be chosen out of several (statement replay after reconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The connection could not be obtained or used.
    NoConnection,
    /// The connection is live but a specific statement was rejected.
    Sql,
    /// A query expected to affect or return at least one row did not.
    NoData,
}

#[derive(Error, Debug)]
pub enum DbError {
    /// Unreachable server, closed handle, or absent session. The Session
    /// attempts a renew before surfacing this kind.
    #[error("no connection: {message}")]
    NoConnection { message: String },

    /// Statement-level failure (syntax, constraint, type mismatch). Never
    /// auto-retried; carries the offending statement text when known.
    #[error("sql error: {message}{}", statement_suffix(.statement))]
    Sql {
        message: String,
        /// The statement that was rejected, when the failure is tied to one.
        statement: Option<String>,
        /// Vendor SQLSTATE, e.g. "42P01" for undefined table.
        sql_state: Option<String>,
    },

    /// No row where at least one was required. Distinguished from [`DbError::Sql`]
    /// because it is often a legitimate business outcome.
    #[error("no data: {message}")]
    NoData { message: String },
}

fn statement_suffix(statement: &Option<String>) -> String {
    match statement {
        Some(s) => format!(" (statement: {s})"),
        None => String::new(),
    }
}

impl DbError {
    /// Create a connection-kind error.
    pub fn no_connection(message: impl Into<String>) -> Self {
        Self::NoConnection {
            message: message.into(),
        }
    }

    /// Create a statement-kind error without an attached statement text.
    pub fn sql(message: impl Into<String>) -> Self {
        Self::Sql {
            message: message.into(),
            statement: None,
            sql_state: None,
        }
    }

    /// Create a statement-kind error carrying the offending statement.
    pub fn sql_with_statement(message: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::Sql {
            message: message.into(),
            statement: Some(statement.into()),
            sql_state: None,
        }
    }

    /// Create a no-data error.
    pub fn no_data(message: impl Into<String>) -> Self {
        Self::NoData {
            message: message.into(),
        }
    }

    /// Attach (or replace) the statement text on a Sql-kind error.
    /// Other kinds pass through unchanged.
    pub fn with_statement(self, statement: &str) -> Self {
        match self {
            Self::Sql {
                message, sql_state, ..
            } => Self::Sql {
                message,
                statement: Some(statement.to_string()),
                sql_state,
            },
            other => other,
        }
    }

    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoConnection { .. } => ErrorKind::NoConnection,
            Self::Sql { .. } => ErrorKind::Sql,
            Self::NoData { .. } => ErrorKind::NoData,
        }
    }

    /// Check if this error is recoverable by reconnecting.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::NoConnection
    }
}

/// Convert sqlx errors into the taxonomy. This is the only place raw driver
/// errors are interpreted.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                DbError::no_connection(format!("invalid connection configuration: {msg}"))
            }
            sqlx::Error::Io(io_err) => DbError::no_connection(format!("i/o error: {io_err}")),
            sqlx::Error::Tls(tls_err) => DbError::no_connection(format!("tls error: {tls_err}")),
            sqlx::Error::Protocol(msg) => DbError::no_connection(format!("protocol error: {msg}")),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DbError::no_connection("connection handle is closed")
            }
            sqlx::Error::WorkerCrashed => DbError::no_connection("database worker crashed"),
            sqlx::Error::AnyDriverError(e) => DbError::no_connection(format!("driver error: {e}")),
            sqlx::Error::Database(db_err) => {
                let sql_state = db_err.code().map(|c| c.to_string());
                DbError::Sql {
                    message: db_err.message().to_string(),
                    statement: None,
                    sql_state,
                }
            }
            sqlx::Error::RowNotFound => DbError::no_data("no rows returned"),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::sql(format!("type not found: {type_name}"))
            }
            sqlx::Error::ColumnNotFound(col) => DbError::sql(format!("column not found: {col}")),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => {
                DbError::sql(format!("column index {index} out of bounds (len: {len})"))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::sql(format!("failed to decode column {index}: {source}"))
            }
            sqlx::Error::Decode(source) => DbError::sql(format!("decode error: {source}")),
            other => DbError::sql(format!("unexpected database error: {other}")),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_statement() {
        let err = DbError::sql_with_statement("syntax error", "SELECT * FORM t");
        let text = err.to_string();
        assert!(text.contains("syntax error"));
        assert!(text.contains("SELECT * FORM t"));
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            DbError::no_connection("down").kind(),
            ErrorKind::NoConnection
        );
        assert_eq!(DbError::sql("bad").kind(), ErrorKind::Sql);
        assert_eq!(DbError::no_data("empty").kind(), ErrorKind::NoData);
    }

    #[test]
    fn test_retryable() {
        assert!(DbError::no_connection("down").is_retryable());
        assert!(!DbError::sql("bad").is_retryable());
        assert!(!DbError::no_data("empty").is_retryable());
    }

    #[test]
    fn test_with_statement_only_touches_sql_kind() {
        let err = DbError::sql("constraint violated").with_statement("INSERT INTO t VALUES (1)");
        assert!(err.to_string().contains("INSERT INTO t"));

        let err = DbError::no_data("empty").with_statement("SELECT 1");
        assert!(!err.to_string().contains("SELECT 1"));
    }

    #[test]
    fn test_row_not_found_maps_to_no_data() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::NoData);
    }

    #[test]
    fn test_pool_closed_maps_to_no_connection() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert_eq!(err.kind(), ErrorKind::NoConnection);
    }
}
