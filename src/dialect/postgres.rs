//! PostgreSQL dialect.

use crate::config::{ConnectTarget, SessionOptions};
use crate::connection::{DbConnection, VendorKind};
use crate::dialect::{Dialect, SEQUENCE_NAME};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::ConnectOptions;
use sqlx::postgres::PgConnectOptions;
use std::str::FromStr;
use std::sync::Once;
use tracing::debug;

static DRIVER_INIT: Once = Once::new();

pub struct PostgresDialect;

#[async_trait]
impl Dialect for PostgresDialect {
    fn kind(&self) -> VendorKind {
        VendorKind::Postgres
    }

    fn ensure_driver(&self) {
        DRIVER_INIT.call_once(|| debug!("PostgreSQL driver initialized"));
    }

    async fn open(
        &self,
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> DbResult<DbConnection> {
        let mut opts = PgConnectOptions::from_str(&target.url).map_err(|e| {
            DbError::no_connection(format!("invalid PostgreSQL connection string: {e}"))
        })?;
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
        Ok(DbConnection::Postgres(conn))
    }

    fn sequence_bump_sql(&self) -> Option<&'static str> {
        // nextval advances on fetch
        None
    }

    fn sequence_fetch_sql(&self) -> &'static str {
        "SELECT nextval('steady_db_seq')"
    }

    fn sequence_reset_sql(&self, new_value: i64) -> String {
        format!("SELECT setval('{SEQUENCE_NAME}', {new_value}, false)")
    }

    fn create_schema_sql(&self) -> Vec<String> {
        vec![format!(
            "CREATE SEQUENCE IF NOT EXISTS {SEQUENCE_NAME} START 1"
        )]
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn read_only_sql(&self) -> Option<&'static str> {
        Some("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_templates() {
        let d = PostgresDialect;
        assert!(d.sequence_bump_sql().is_none());
        assert!(d.sequence_fetch_sql().contains("nextval"));
        assert_eq!(
            d.sequence_reset_sql(42),
            "SELECT setval('steady_db_seq', 42, false)"
        );
        assert!(d.create_schema_sql()[0].contains("CREATE SEQUENCE"));
    }
}
