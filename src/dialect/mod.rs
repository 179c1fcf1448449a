//! Vendor dialect abstraction.
//!
//! A [`Dialect`] supplies everything vendor-specific this layer needs: the
//! native driver binding (connect-option construction), the liveness probe,
//! the identifier-sequence templates, schema DDL, row-limit wrapping, and
//! parameter placeholder syntax. One implementation exists per supported
//! vendor; the factory selects it by the connection-string scheme prefix.
//!
//! Raw driver errors never cross this boundary - `open` wraps every failure
//! into the three-kind taxonomy.

use crate::config::{ConnectTarget, SessionOptions};
use crate::connection::{DbConnection, VendorKind};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::sync::Arc;

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// Name of the reserved identifier sequence owned by each Admin.
pub const SEQUENCE_NAME: &str = "steady_db_seq";

#[async_trait]
pub trait Dialect: Send + Sync {
    /// The vendor this dialect drives.
    fn kind(&self) -> VendorKind;

    /// Idempotent once-per-process driver initialization. sqlx drivers are
    /// compiled in, so this only gates a first-use log line, but callers must
    /// invoke it before `open`.
    fn ensure_driver(&self);

    /// Open a physical connection to the target. Applies the connect timeout
    /// and wraps every driver failure as `NoConnection`.
    async fn open(
        &self,
        target: &ConnectTarget,
        options: &SessionOptions,
    ) -> DbResult<DbConnection>;

    /// Trivial liveness statement.
    fn validation_probe(&self) -> &'static str {
        "SELECT 1"
    }

    /// Statement advancing the identifier sequence, for vendors where the
    /// fetch itself does not advance it.
    fn sequence_bump_sql(&self) -> Option<&'static str>;

    /// Query returning the next sequence value as a single BIGINT row.
    fn sequence_fetch_sql(&self) -> &'static str;

    /// Statement resetting the sequence to the given value, so the next fetch
    /// returns `new_value`.
    fn sequence_reset_sql(&self, new_value: i64) -> String;

    /// DDL creating the objects this layer owns (the identifier sequence).
    /// Each statement is idempotent.
    fn create_schema_sql(&self) -> Vec<String>;

    /// Wrap a field list and base query with the vendor's row-limit syntax.
    fn limit_clause(&self, fields: &str, base_query: &str, n: u32) -> String {
        format!("SELECT {fields} {base_query} LIMIT {n}")
    }

    /// Parameter placeholder for the 1-based position `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Statement putting the session into read-only mode, when the vendor
    /// does this with SQL rather than a connect option.
    fn read_only_sql(&self) -> Option<&'static str>;
}

/// Select a dialect by connection-string scheme prefix.
pub fn dialect_for(url: &str) -> DbResult<Arc<dyn Dialect>> {
    match VendorKind::from_url(url) {
        Some(VendorKind::Postgres) => Ok(Arc::new(PostgresDialect)),
        Some(VendorKind::MySql) => Ok(Arc::new(MySqlDialect)),
        Some(VendorKind::Sqlite) => Ok(Arc::new(SqliteDialect)),
        None => Err(DbError::no_connection(format!(
            "unsupported database url scheme: {url}"
        ))),
    }
}
