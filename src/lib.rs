//! Resilient SQL access layer.
//!
//! This library manages long-lived database connections (SQLite, PostgreSQL,
//! MySQL) that survive connection loss: sessions renew themselves, tracked
//! prepared statements are replayed after a reconnect, and a generic record
//! layer maps typed rows over any supported vendor.

pub mod admin;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod record;
pub mod request;
pub mod session;
pub mod value;

pub use admin::{Admin, SessionRegistry};
pub use config::{ConnectTarget, SessionOptions};
pub use connection::VendorKind;
pub use dialect::{Dialect, dialect_for};
pub use error::{DbError, DbResult, ErrorKind};
pub use record::{Backing, ColumnSpec, MemoryIndex, Record, RecordOps};
pub use request::{PreparedRequest, SimpleRequest};
pub use session::Session;
pub use value::{SqlType, SqlValue, TypedValue};
