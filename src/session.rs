//! Managed database sessions.
//!
//! A [`Session`] owns one physical connection and arbitrates concurrent
//! logical use of it: a reference count tracks logical users, connection
//! state transitions run inside a per-session async mutex, and a dropped
//! connection is renewed transparently, replaying every tracked prepared
//! statement in registration order.
//!
//! sqlx connections require `&mut` access, so statement execution serializes
//! on the same mutex that guards state transitions; the reference count stays
//! an atomic outside it so `use_connection`/`end_use_connection` are cheap.

use crate::admin::SessionRegistry;
use crate::config::{ConnectTarget, SessionOptions};
use crate::connection::DbConnection;
use crate::dialect::Dialect;
use crate::error::{DbError, DbResult, ErrorKind};
use crate::request::PreparedRequest;
use crate::value::{SqlType, SqlValue};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct SessionState {
    conn: Option<DbConnection>,
    disconnected: bool,
    /// Bumped on every successful open; prepared statements compiled at an
    /// older epoch are stale.
    epoch: u64,
    savepoint_seq: u64,
}

pub struct Session {
    dialect: Arc<dyn Dialect>,
    target: ConnectTarget,
    options: SessionOptions,
    registry: Arc<SessionRegistry>,
    /// Assigned on first successful open; renew reuses the same slot.
    id: OnceLock<Uuid>,
    ref_count: AtomicI64,
    state: Mutex<SessionState>,
    tracked: StdMutex<Vec<Weak<PreparedRequest>>>,
}

impl Session {
    /// Create a session. No connection is opened until `open` or the first
    /// `use_connection`.
    pub fn new(
        dialect: Arc<dyn Dialect>,
        target: ConnectTarget,
        options: SessionOptions,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialect,
            target,
            options,
            registry,
            id: OnceLock::new(),
            ref_count: AtomicI64::new(0),
            state: Mutex::new(SessionState {
                conn: None,
                disconnected: true,
                epoch: 0,
                savepoint_seq: 0,
            }),
            tracked: StdMutex::new(Vec::new()),
        })
    }

    /// The session id, present once the session has been opened.
    pub fn id(&self) -> Option<Uuid> {
        self.id.get().copied()
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn auto_commit(&self) -> bool {
        self.options.auto_commit_or_default()
    }

    pub fn read_only(&self) -> bool {
        self.options.read_only
    }

    /// Current number of logical users.
    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub async fn is_disconnected(&self) -> bool {
        self.state.lock().await.disconnected
    }

    /// Open the physical connection if it is not already open.
    pub async fn open(self: &Arc<Self>) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if state.conn.is_some() && !state.disconnected {
            return Ok(());
        }
        self.open_locked(&mut state).await
    }

    async fn open_locked(self: &Arc<Self>, state: &mut SessionState) -> DbResult<()> {
        self.dialect.ensure_driver();
        let mut conn = self.dialect.open(&self.target, &self.options).await?;

        // Half-open handles are discarded when flag setup fails; the caller
        // sees a connection-kind failure either way.
        if let Err(e) = self.apply_session_flags(&mut conn).await {
            let _ = conn.close().await;
            return Err(DbError::no_connection(format!(
                "failed to configure session: {e}"
            )));
        }

        let id = *self.id.get_or_init(Uuid::new_v4);
        state.conn = Some(conn);
        state.disconnected = false;
        state.epoch += 1;
        self.registry.register(id, Arc::downgrade(self));
        info!(
            session_id = %id,
            vendor = %self.dialect.kind(),
            target = %self.target.masked(),
            "session opened"
        );
        Ok(())
    }

    async fn apply_session_flags(&self, conn: &mut DbConnection) -> DbResult<()> {
        if self.options.read_only {
            if let Some(sql) = self.dialect.read_only_sql() {
                conn.execute(sql, &[]).await?;
            }
        }
        if !self.auto_commit() {
            conn.execute("BEGIN", &[]).await?;
        }
        Ok(())
    }

    /// Run the liveness probe. Success clears the disconnected flag; failure
    /// sets it and renews the connection.
    pub async fn validate(self: &Arc<Self>) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if !state.disconnected {
            if let Some(conn) = state.conn.as_mut() {
                match conn.execute(self.dialect.validation_probe(), &[]).await {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        warn!(session_id = ?self.id(), error = %e, "liveness probe failed");
                        state.disconnected = true;
                    }
                }
            }
        }
        self.renew_locked(&mut state).await
    }

    /// Discard the stale handle, reopen under the same id, and replay every
    /// tracked prepared request in registration order. Replay is best-effort
    /// across entries; one representative failure is re-raised, preferring a
    /// connection-kind failure over a statement-kind one.
    pub async fn renew(self: &Arc<Self>) -> DbResult<()> {
        let mut state = self.state.lock().await;
        self.renew_locked(&mut state).await
    }

    async fn renew_locked(self: &Arc<Self>, state: &mut SessionState) -> DbResult<()> {
        if let Some(conn) = state.conn.take() {
            let _ = conn.close().await;
        }
        state.disconnected = true;
        self.open_locked(state).await?;

        let tracked: Vec<Arc<PreparedRequest>> = {
            let list = self.tracked.lock().expect("tracked list poisoned");
            list.iter().filter_map(Weak::upgrade).collect()
        };
        if tracked.is_empty() {
            return Ok(());
        }

        let epoch = state.epoch;
        let Some(conn) = state.conn.as_mut() else {
            return Err(DbError::no_connection("connection lost during renew"));
        };

        let mut connection_failure: Option<DbError> = None;
        let mut statement_failure: Option<DbError> = None;
        for request in &tracked {
            if let Err(e) = request.recompile_on(conn, epoch).await {
                warn!(
                    session_id = ?self.id(),
                    statement = %request.statement_text(),
                    error = %e,
                    "replay of tracked statement failed"
                );
                match e.kind() {
                    ErrorKind::NoConnection => connection_failure = Some(e),
                    _ => statement_failure = Some(e),
                }
            }
        }

        info!(
            session_id = ?self.id(),
            replayed = tracked.len(),
            "session renewed"
        );
        match connection_failure.or(statement_failure) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register a logical user. Opens the connection when disconnected.
    pub async fn use_connection(self: &Arc<Self>) -> DbResult<()> {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.disconnected || state.conn.is_none() {
            self.open_locked(&mut state).await?;
        }
        Ok(())
    }

    /// Release a logical user. When the count drops to zero or below, a
    /// deferred disconnect is scheduled on the tokio runtime; the grace
    /// delay gives a new user the chance to keep the connection alive.
    /// Outside a runtime context nothing can be scheduled, so the physical
    /// handle is released when the session is next disconnected or dropped.
    pub fn end_use_connection(self: &Arc<Self>) {
        let remaining = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining <= 0 {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!(
                    session_id = ?self.id(),
                    "no async runtime, deferred disconnect skipped"
                );
                return;
            };
            let session = Arc::clone(self);
            handle.spawn(async move {
                if let Err(e) = session.disconnect().await {
                    warn!(session_id = ?session.id(), error = %e, "deferred disconnect failed");
                }
            });
        }
    }

    /// Close after the grace delay, unless a new logical user appeared in the
    /// meantime.
    pub async fn disconnect(self: &Arc<Self>) -> DbResult<()> {
        tokio::time::sleep(self.options.grace_delay_or_default()).await;
        if self.ref_count.load(Ordering::SeqCst) > 0 {
            debug!(session_id = ?self.id(), "disconnect aborted, session back in use");
            return Ok(());
        }
        self.close_inner().await
    }

    /// Close unconditionally, ignoring the reference count. Used at process
    /// shutdown.
    pub async fn force_disconnect(self: &Arc<Self>) -> DbResult<()> {
        self.close_inner().await
    }

    async fn close_inner(self: &Arc<Self>) -> DbResult<()> {
        // Tracked statements are released first; they will not be replayed.
        let tracked: Vec<Arc<PreparedRequest>> = {
            let mut list = self.tracked.lock().expect("tracked list poisoned");
            let alive = list.iter().filter_map(Weak::upgrade).collect();
            list.clear();
            alive
        };
        for request in tracked {
            request.invalidate();
        }

        let mut state = self.state.lock().await;
        state.disconnected = true;
        let result = match state.conn.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        };
        drop(state);

        if let Some(id) = self.id() {
            self.registry.deregister(id);
            info!(session_id = %id, "session closed");
        }
        result
    }

    /// Hint that the physical link is broken (e.g. the caller observed a
    /// server restart out-of-band). The stale handle is discarded; the next
    /// operation renews.
    pub async fn mark_disconnected(&self) {
        let mut state = self.state.lock().await;
        discard_conn(&mut state).await;
    }

    // -------------------------------------------------------------------------
    // Transaction control
    // -------------------------------------------------------------------------

    /// Commit the open transaction and start the next one. No-op under
    /// auto-commit.
    pub async fn commit(&self) -> DbResult<()> {
        if self.auto_commit() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let conn = require_conn(&mut state)?;
        conn.execute("COMMIT", &[]).await?;
        conn.execute("BEGIN", &[]).await?;
        Ok(())
    }

    /// Roll back to a savepoint, or the whole transaction when `savepoint`
    /// is `None` (a fresh transaction is started afterwards unless the
    /// session auto-commits).
    pub async fn rollback(&self, savepoint: Option<&str>) -> DbResult<()> {
        if let Some(name) = savepoint {
            check_savepoint_name(name)?;
        }
        let mut state = self.state.lock().await;
        let auto_commit = self.auto_commit();
        let conn = require_conn(&mut state)?;
        match savepoint {
            Some(name) => {
                conn.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
                    .await?;
            }
            None => {
                conn.execute("ROLLBACK", &[]).await?;
                if !auto_commit {
                    conn.execute("BEGIN", &[]).await?;
                }
            }
        }
        Ok(())
    }

    /// Create a savepoint and return its generated name.
    pub async fn savepoint(&self) -> DbResult<String> {
        let mut state = self.state.lock().await;
        state.savepoint_seq += 1;
        let name = format!("sp_{}", state.savepoint_seq);
        let conn = require_conn(&mut state)?;
        conn.execute(&format!("SAVEPOINT {name}"), &[]).await?;
        Ok(name)
    }

    pub async fn release_savepoint(&self, name: &str) -> DbResult<()> {
        check_savepoint_name(name)?;
        let mut state = self.state.lock().await;
        let conn = require_conn(&mut state)?;
        conn.execute(&format!("RELEASE SAVEPOINT {name}"), &[]).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Statement execution seam
    // -------------------------------------------------------------------------

    /// Validate (and renew if needed) when the session knows it is
    /// disconnected. Entry point for every request operation.
    pub(crate) async fn ensure_connected(self: &Arc<Self>) -> DbResult<()> {
        let needs_validation = {
            let state = self.state.lock().await;
            state.disconnected || state.conn.is_none()
        };
        if needs_validation {
            self.validate().await?;
        }
        Ok(())
    }

    /// Connection epoch; statements compiled at an older epoch are stale.
    pub(crate) async fn current_epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }

    /// Compile a statement and return the epoch it was compiled at.
    pub(crate) async fn compile(self: &Arc<Self>, sql: &str) -> DbResult<u64> {
        self.ensure_connected().await?;
        let mut state = self.state.lock().await;
        let epoch = state.epoch;
        let conn = require_conn(&mut state)?;
        conn.prepare(sql).await?;
        Ok(epoch)
    }

    /// Single execution attempt, no reconnect-retry. Prepared requests drive
    /// their own retry so they can re-check staleness after a renew.
    pub(crate) async fn try_execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let conn = require_conn(&mut state)?;
        let result = conn.execute(sql, params).await;
        if matches!(&result, Err(e) if e.is_retryable()) {
            discard_conn(&mut state).await;
        }
        result
    }

    /// Single typed-fetch attempt, no reconnect-retry.
    pub(crate) async fn try_query_typed(
        &self,
        sql: &str,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        let mut state = self.state.lock().await;
        let conn = require_conn(&mut state)?;
        let result = conn.fetch_typed(sql, params, expected).await;
        if matches!(&result, Err(e) if e.is_retryable()) {
            discard_conn(&mut state).await;
        }
        result
    }

    /// Single json-fetch attempt, no reconnect-retry.
    pub(crate) async fn try_query_json(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Vec<serde_json::Map<String, JsonValue>>> {
        let mut state = self.state.lock().await;
        let conn = require_conn(&mut state)?;
        let result = conn.fetch_json(sql, params).await;
        if matches!(&result, Err(e) if e.is_retryable()) {
            discard_conn(&mut state).await;
        }
        result
    }

    /// Execute with transparent reconnection: a connection-kind failure
    /// triggers exactly one renew-and-retry; statement failures pass through.
    pub async fn execute(self: &Arc<Self>, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.ensure_connected().await?;
        match self.try_execute(sql, params).await {
            Err(e) if e.is_retryable() => {
                warn!(session_id = ?self.id(), error = %e, "statement lost connection, renewing");
                self.renew().await?;
                self.try_execute(sql, params).await
            }
            other => other,
        }
    }

    /// Typed query with transparent reconnection.
    pub async fn query_typed(
        self: &Arc<Self>,
        sql: &str,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        self.ensure_connected().await?;
        match self.try_query_typed(sql, params, expected).await {
            Err(e) if e.is_retryable() => {
                warn!(session_id = ?self.id(), error = %e, "query lost connection, renewing");
                self.renew().await?;
                self.try_query_typed(sql, params, expected).await
            }
            other => other,
        }
    }

    /// Run an optional setup statement and a query under one lock
    /// acquisition, so the pair is atomic with respect to every other user
    /// of this session. Used for advance-then-read sequence access, where a
    /// released lock between the two statements lets callers interleave and
    /// read the same value.
    pub async fn execute_and_query(
        self: &Arc<Self>,
        setup: Option<&str>,
        sql: &str,
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        self.ensure_connected().await?;
        match self.try_execute_and_query(setup, sql, expected).await {
            Err(e) if e.is_retryable() => {
                warn!(session_id = ?self.id(), error = %e, "statement pair lost connection, renewing");
                self.renew().await?;
                self.try_execute_and_query(setup, sql, expected).await
            }
            other => other,
        }
    }

    async fn try_execute_and_query(
        &self,
        setup: Option<&str>,
        sql: &str,
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        let mut state = self.state.lock().await;
        let conn = require_conn(&mut state)?;
        if let Some(setup_sql) = setup {
            if let Err(e) = conn.execute(setup_sql, &[]).await {
                if e.is_retryable() {
                    discard_conn(&mut state).await;
                }
                return Err(e);
            }
        }
        let result = conn.fetch_typed(sql, &[], expected).await;
        if matches!(&result, Err(e) if e.is_retryable()) {
            discard_conn(&mut state).await;
        }
        result
    }

    /// Ad hoc JSON query with transparent reconnection.
    pub async fn query_json(
        self: &Arc<Self>,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Vec<serde_json::Map<String, JsonValue>>> {
        self.ensure_connected().await?;
        match self.try_query_json(sql, params).await {
            Err(e) if e.is_retryable() => {
                warn!(session_id = ?self.id(), error = %e, "query lost connection, renewing");
                self.renew().await?;
                self.try_query_json(sql, params).await
            }
            other => other,
        }
    }

    // -------------------------------------------------------------------------
    // Tracked statement bookkeeping
    // -------------------------------------------------------------------------

    /// Register a prepared request for replay after reconnection. Replay
    /// happens in registration order. Untracked requests are left invalid by
    /// a reconnect and must be recreated by their caller.
    pub(crate) fn track_statement(&self, request: &Arc<PreparedRequest>) {
        let handle = Arc::downgrade(request);
        let mut list = self.tracked.lock().expect("tracked list poisoned");
        if !list.iter().any(|w| Weak::ptr_eq(w, &handle)) {
            list.push(handle);
        }
    }

    /// Remove a request from the replay set (fully closed requests).
    pub(crate) fn untrack_statement(&self, request: &Arc<PreparedRequest>) {
        let target = Arc::downgrade(request);
        let mut list = self.tracked.lock().expect("tracked list poisoned");
        list.retain(|w| !Weak::ptr_eq(w, &target));
    }

    /// Number of live tracked statements.
    pub fn tracked_count(&self) -> usize {
        let list = self.tracked.lock().expect("tracked list poisoned");
        list.iter().filter(|w| w.strong_count() > 0).count()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("vendor", &self.dialect.kind())
            .field("target", &self.target.masked())
            .field("ref_count", &self.ref_count())
            .finish_non_exhaustive()
    }
}

// Savepoint names are interpolated into SQL; only identifier characters are
// accepted so a caller-supplied name cannot smuggle in statement text.
fn check_savepoint_name(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DbError::sql(format!("invalid savepoint name: {name}")))
    }
}

// Invariant: disconnected implies no handle.
async fn discard_conn(state: &mut SessionState) {
    state.disconnected = true;
    if let Some(conn) = state.conn.take() {
        let _ = conn.close().await;
    }
}

fn require_conn<'a>(state: &'a mut SessionState) -> DbResult<&'a mut DbConnection> {
    if state.disconnected {
        return Err(DbError::no_connection("session is disconnected"));
    }
    state
        .conn
        .as_mut()
        .ok_or_else(|| DbError::no_connection("session has no open connection"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_name_rules() {
        assert!(check_savepoint_name("sp_1").is_ok());
        assert!(check_savepoint_name("retry_point").is_ok());
        assert!(check_savepoint_name("").is_err());
        assert!(check_savepoint_name("1sp").is_err());
        assert!(check_savepoint_name("sp_1; DROP TABLE items").is_err());
        assert!(check_savepoint_name("sp-1").is_err());
    }
}
