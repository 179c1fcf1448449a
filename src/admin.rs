//! Connection administration.
//!
//! [`Admin`] is the entry point of the crate: it resolves the vendor dialect
//! from the connection URL, hands out [`Session`]s, and runs housekeeping
//! that spans sessions (shutdown, health sweeps, the shared sequence).
//!
//! [`SessionRegistry`] tracks every open session by id through weak handles,
//! so the registry never keeps a session alive on its own.

use crate::config::{ConnectTarget, SessionOptions};
use crate::dialect::{dialect_for, Dialect};
use crate::error::{DbError, DbResult};
use crate::session::Session;
use crate::value::{SqlType, SqlValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: StdMutex<HashMap<Uuid, Weak<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, id: Uuid, session: Weak<Session>) {
        let mut map = self.sessions.lock().expect("session registry poisoned");
        map.insert(id, session);
    }

    pub(crate) fn deregister(&self, id: Uuid) {
        let mut map = self.sessions.lock().expect("session registry poisoned");
        map.remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        let map = self.sessions.lock().expect("session registry poisoned");
        map.get(&id).and_then(Weak::upgrade)
    }

    /// All registered sessions that are still alive. Dead entries are pruned
    /// as a side effect.
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        let mut map = self.sessions.lock().expect("session registry poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.values().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.live_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Admin {
    dialect: Arc<dyn Dialect>,
    target: ConnectTarget,
    default_options: SessionOptions,
    registry: Arc<SessionRegistry>,
    /// Lazily opened session used for admin statements (schema, sequence).
    primary: Mutex<Option<Arc<Session>>>,
}

impl Admin {
    /// Build an admin for the given connection URL.
    pub fn connect(url: impl Into<String>) -> DbResult<Self> {
        Self::with_options(ConnectTarget::new(url)?, SessionOptions::default())
    }

    /// Build an admin with explicit credentials and session defaults.
    pub fn with_options(target: ConnectTarget, default_options: SessionOptions) -> DbResult<Self> {
        let dialect = dialect_for(&target.url)?;
        info!(vendor = %dialect.kind(), target = %target.masked(), "admin created");
        Ok(Self {
            dialect,
            target,
            default_options,
            registry: SessionRegistry::new(),
            primary: Mutex::new(None),
        })
    }

    pub fn vendor(&self) -> crate::connection::VendorKind {
        self.dialect.kind()
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create a session with the admin's default options. The connection is
    /// not opened until the session is first used.
    pub fn new_session(&self) -> Arc<Session> {
        self.new_session_with(self.default_options.clone())
    }

    /// Create a session with explicit options.
    pub fn new_session_with(&self, options: SessionOptions) -> Arc<Session> {
        Session::new(
            Arc::clone(&self.dialect),
            self.target.clone(),
            options,
            Arc::clone(&self.registry),
        )
    }

    /// Create and open a session in one step.
    pub async fn open_session(&self) -> DbResult<Arc<Session>> {
        let session = self.new_session();
        session.open().await?;
        Ok(session)
    }

    /// The admin's own session, opened on first use.
    pub async fn primary_session(&self) -> DbResult<Arc<Session>> {
        let mut slot = self.primary.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }
        let session = self.new_session_with(SessionOptions::default());
        session.open().await?;
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Force-close every registered session. Per-session failures are logged
    /// and swallowed; this never raises.
    pub async fn close_all(&self) {
        let mut slot = self.primary.lock().await;
        slot.take();
        drop(slot);

        for session in self.registry.live_sessions() {
            if let Err(e) = session.force_disconnect().await {
                warn!(session_id = ?session.id(), error = %e, "close failed during shutdown");
            }
        }
        info!("all sessions closed");
    }

    /// Ping every registered session, renewing the ones whose connection has
    /// gone away. Failures are logged, never raised; the number of sessions
    /// that could not be validated is returned.
    pub async fn check_all(&self) -> usize {
        let mut failures = 0;
        for session in self.registry.live_sessions() {
            if let Err(e) = session.validate().await {
                warn!(session_id = ?session.id(), error = %e, "health check failed");
                failures += 1;
            }
        }
        failures
    }

    /// Create the vendor-specific backing objects (the shared sequence).
    /// Statements use IF NOT EXISTS forms, so this is safe to repeat.
    pub async fn create_schema(&self) -> DbResult<()> {
        let session = self.primary_session().await?;
        for statement in self.dialect.create_schema_sql() {
            session.execute(&statement, &[]).await?;
        }
        Ok(())
    }

    /// Atomically advance the shared sequence and return the new value.
    /// The bump and the fetch run under one session lock acquisition, so
    /// concurrent callers never read the same value.
    pub async fn next_sequence_value(&self) -> DbResult<i64> {
        let session = self.primary_session().await?;
        let rows = session
            .execute_and_query(
                self.dialect.sequence_bump_sql(),
                self.dialect.sequence_fetch_sql(),
                &[SqlType::BigInt],
            )
            .await?;
        match rows.into_iter().next().and_then(|mut r| {
            if r.is_empty() {
                None
            } else {
                Some(r.swap_remove(0))
            }
        }) {
            Some(SqlValue::BigInt(value)) => Ok(value),
            Some(other) => Err(DbError::sql(format!(
                "sequence returned unexpected value: {}",
                other.kind_name()
            ))),
            None => Err(DbError::no_data("sequence returned no value")),
        }
    }

    /// Reset the shared sequence so the next fetched value is `value`.
    pub async fn reset_sequence(&self, value: i64) -> DbResult<()> {
        let session = self.primary_session().await?;
        session
            .execute(&self.dialect.sequence_reset_sql(value), &[])
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Admin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admin")
            .field("vendor", &self.dialect.kind())
            .field("target", &self.target.masked())
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}
