//! MySQL / MariaDB dialect.
//!
//! MySQL has no sequence objects; the identifier sequence is a one-row table
//! advanced through `LAST_INSERT_ID()`, which is connection-local and safe
//! under concurrent sessions.

use crate::config::{ConnectTarget, SessionOptions};
use crate::connection::{DbConnection, VendorKind};
use crate::dialect::{Dialect, SEQUENCE_NAME};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::ConnectOptions;
use sqlx::mysql::MySqlConnectOptions;
use std::str::FromStr;
use std::sync::Once;
use tracing::debug;

static DRIVER_INIT: Once = Once::new();

pub struct MySqlDialect;

#[async_trait]
impl Dialect for MySqlDialect {
    fn kind(&self) -> VendorKind {
        VendorKind::MySql
    }

    fn ensure_driver(&self) {
        DRIVER_INIT.call_once(|| debug!("MySQL driver initialized"));
    }

    async fn open(
        &self,
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> DbResult<DbConnection> {
        let mut opts = MySqlConnectOptions::from_str(&target.url)
            .map_err(|e| DbError::no_connection(format!("invalid MySQL connection string: {e}")))?
            .charset("utf8mb4");
        if let Some(user) = &target.user {
            opts = opts.username(user);
        }
        if let Some(password) = &target.password {
            opts = opts.password(password);
        }

        let connect = opts.connect();
        let conn = tokio::time::timeout(options.connect_timeout_or_default(), connect)
            .await
            .map_err(|_| {
                DbError::no_connection(format!("connect to {} timed out", target.masked()))
            })?
            .map_err(DbError::from)?;
        Ok(DbConnection::MySql(conn))
    }

    fn sequence_bump_sql(&self) -> Option<&'static str> {
        Some("UPDATE steady_db_seq SET value = LAST_INSERT_ID(value + 1)")
    }

    fn sequence_fetch_sql(&self) -> &'static str {
        // LAST_INSERT_ID() is BIGINT UNSIGNED; cast so it decodes as i64
        "SELECT CAST(LAST_INSERT_ID() AS SIGNED)"
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
                 SELECT 0 FROM DUAL WHERE NOT EXISTS (SELECT 1 FROM {SEQUENCE_NAME})"
            ),
        ]
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn read_only_sql(&self) -> Option<&'static str> {
        Some("SET SESSION TRANSACTION READ ONLY")
    }
}
