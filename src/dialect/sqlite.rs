//! SQLite dialect.
//!
//! Read-only mode is a connect option here rather than a SQL statement, and
//! the identifier sequence is a one-row table (SQLite has no sequence
//! objects). There is no cross-process coordination; the sequence is only
//! monotonic within one process, which is all this layer promises.

use crate::config::{ConnectTarget, SessionOptions};
use crate::connection::{DbConnection, VendorKind};
use crate::dialect::{Dialect, SEQUENCE_NAME};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::ConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::sync::Once;
use tracing::debug;

static DRIVER_INIT: Once = Once::new();

pub struct SqliteDialect;

#[async_trait]
impl Dialect for SqliteDialect {
    fn kind(&self) -> VendorKind {
        VendorKind::Sqlite
    }

    fn ensure_driver(&self) {
        DRIVER_INIT.call_once(|| debug!("SQLite driver initialized"));
    }

    async fn open(
        &self,
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> DbResult<DbConnection> {
        let mut opts = SqliteConnectOptions::from_str(&target.url)
            .map_err(|e| DbError::no_connection(format!("invalid SQLite connection string: {e}")))?;
        if options.read_only {
            opts = opts.read_only(true);
        } else {
            opts = opts.create_if_missing(true);
        }

        let connect = opts.connect();
        let conn = tokio::time::timeout(options.connect_timeout_or_default(), connect)
            .await
            .map_err(|_| {
                DbError::no_connection(format!("connect to {} timed out", target.masked()))
            })?
            .map_err(DbError::from)?;
        Ok(DbConnection::Sqlite(conn))
    }

    fn sequence_bump_sql(&self) -> Option<&'static str> {
        Some("UPDATE steady_db_seq SET value = value + 1")
    }

    fn sequence_fetch_sql(&self) -> &'static str {
        "SELECT value FROM steady_db_seq"
    }

    fn sequence_reset_sql(&self, new_value: i64) -> String {
        // The bump adds one before the fetch
        format!("UPDATE {SEQUENCE_NAME} SET value = {}", new_value - 1)
    }

    fn create_schema_sql(&self) -> Vec<String> {
        vec![
            format!("CREATE TABLE IF NOT EXISTS {SEQUENCE_NAME} (value BIGINT NOT NULL)"),
            format!(
                "INSERT INTO {SEQUENCE_NAME} (value) \
                 SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {SEQUENCE_NAME})"
            ),
        ]
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn read_only_sql(&self) -> Option<&'static str> {
        // Handled by the read_only connect option
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_templates() {
        let d = SqliteDialect;
        assert!(d.sequence_bump_sql().unwrap().contains("value + 1"));
        assert!(d.sequence_fetch_sql().contains("SELECT value"));
        assert_eq!(d.sequence_reset_sql(1), "UPDATE steady_db_seq SET value = 0");
    }

    #[test]
    fn test_probe_is_trivial() {
        assert_eq!(SqliteDialect.validation_probe(), "SELECT 1");
    }
}
