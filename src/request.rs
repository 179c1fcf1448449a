//! Statement execution handles.
//!
//! [`PreparedRequest`] is a long-lived parameterized statement bound to a
//! [`Session`]. Once tracked, it survives reconnection: the session replays
//! (recompiles) it against the fresh connection and the handle keeps working.
//! An untracked handle becomes invalid when the session reconnects and must
//! be recreated.
//!
//! [`SimpleRequest`] is a one-shot surface for ad hoc statements with no
//! state to replay; reconnection is fully transparent to it.

use crate::connection::DbConnection;
use crate::error::{DbError, DbResult};
use crate::session::Session;
use crate::value::{SqlType, SqlValue};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::debug;

struct Cursor {
    rows: Vec<Vec<SqlValue>>,
    pos: usize,
}

struct RequestState {
    ready: bool,
    compiled_epoch: u64,
    cursor: Option<Cursor>,
}

pub struct PreparedRequest {
    session: Arc<Session>,
    text: String,
    state: StdMutex<RequestState>,
}

impl PreparedRequest {
    /// Compile `sql` on the session's current connection.
    pub async fn new(session: &Arc<Session>, sql: impl Into<String>) -> DbResult<Arc<Self>> {
        let text = sql.into();
        let epoch = session.compile(&text).await?;
        Ok(Arc::new(Self {
            session: Arc::clone(session),
            text,
            state: StdMutex::new(RequestState {
                ready: true,
                compiled_epoch: epoch,
                cursor: None,
            }),
        }))
    }

    /// Register this request with its session for replay after reconnection.
    pub fn track(self: &Arc<Self>) {
        self.session.track_statement(self);
    }

    pub fn statement_text(&self) -> &str {
        &self.text
    }

    pub fn is_ready(&self) -> bool {
        self.lock_state().ready
    }

    pub fn compiled_epoch(&self) -> u64 {
        self.lock_state().compiled_epoch
    }

    /// Run the statement as an update and return the affected-row count.
    /// A connection-kind failure triggers one session renew and one retry;
    /// the retry only proceeds when this handle was replayed (tracked).
    pub async fn execute_update(&self, params: &[SqlValue]) -> DbResult<u64> {
        self.session.ensure_connected().await?;
        self.check_current().await?;
        match self.session.try_execute(&self.text, params).await {
            Err(e) if e.is_retryable() => {
                self.session.renew().await?;
                self.check_current().await?;
                self.session.try_execute(&self.text, params).await
            }
            other => other,
        }
    }

    /// Run the statement as a query and load the results into this handle's
    /// cursor. `expected` gives the column types of the result rows.
    pub async fn execute_query(&self, params: &[SqlValue], expected: &[SqlType]) -> DbResult<()> {
        self.session.ensure_connected().await?;
        self.check_current().await?;
        let rows = match self
            .session
            .try_query_typed(&self.text, params, expected)
            .await
        {
            Err(e) if e.is_retryable() => {
                self.session.renew().await?;
                self.check_current().await?;
                self.session
                    .try_query_typed(&self.text, params, expected)
                    .await?
            }
            other => other?,
        };
        self.lock_state().cursor = Some(Cursor { rows, pos: 0 });
        Ok(())
    }

    /// Advance the cursor and return the next row, or `None` when exhausted
    /// (or when no query has been run).
    pub fn next_row(&self) -> Option<Vec<SqlValue>> {
        let mut state = self.lock_state();
        let cursor = state.cursor.as_mut()?;
        if cursor.pos < cursor.rows.len() {
            let row = cursor.rows[cursor.pos].clone();
            cursor.pos += 1;
            Some(row)
        } else {
            None
        }
    }

    /// Run as a query expected to yield exactly one row. Fails with a
    /// no-data error when the result is empty.
    pub async fn single_row(
        &self,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<SqlValue>> {
        self.execute_query(params, expected).await?;
        self.next_row()
            .ok_or_else(|| DbError::no_data(format!("no row returned by: {}", self.text)))
    }

    /// Number of rows buffered by the last query, if any.
    pub fn row_count(&self) -> Option<usize> {
        self.lock_state().cursor.as_ref().map(|c| c.rows.len())
    }

    /// Lightweight close: release the cursor, keep the compiled statement.
    pub fn close(&self) {
        self.lock_state().cursor = None;
    }

    /// Full close: release the cursor, drop the compiled statement, and stop
    /// replaying this handle.
    pub fn real_close(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            state.cursor = None;
            state.ready = false;
        }
        self.session.untrack_statement(self);
        debug!(statement = %self.text, "prepared request closed");
    }

    /// Recompile against `conn` after a reconnect. Called by the session
    /// during replay, with the connection lock already held.
    pub(crate) async fn recompile_on(&self, conn: &mut DbConnection, epoch: u64) -> DbResult<()> {
        match conn.prepare(&self.text).await {
            Ok(()) => {
                let mut state = self.lock_state();
                state.ready = true;
                state.compiled_epoch = epoch;
                state.cursor = None;
                Ok(())
            }
            Err(e) => {
                let mut state = self.lock_state();
                state.ready = false;
                state.cursor = None;
                Err(e)
            }
        }
    }

    /// Mark the handle unusable without touching the session. Called when the
    /// owning session closes.
    pub(crate) fn invalidate(&self) {
        let mut state = self.lock_state();
        state.ready = false;
        state.cursor = None;
    }

    /// A handle is usable only when it is compiled against the session's
    /// current connection. Tracked handles are refreshed by replay; an
    /// untracked handle left behind by a reconnect must be recreated.
    async fn check_current(&self) -> DbResult<()> {
        let (ready, compiled_epoch) = {
            let state = self.lock_state();
            (state.ready, state.compiled_epoch)
        };
        if !ready {
            return Err(DbError::sql_with_statement(
                "prepared request has been closed",
                &self.text,
            ));
        }
        if compiled_epoch != self.session.current_epoch().await {
            return Err(DbError::sql_with_statement(
                "statement invalidated by reconnection",
                &self.text,
            ));
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RequestState> {
        self.state.lock().expect("request state poisoned")
    }
}

impl std::fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRequest")
            .field("text", &self.text)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// One-shot statement surface. Carries no compiled state, so it never goes
/// stale; each call rides the session's transparent reconnect-and-retry.
pub struct SimpleRequest {
    session: Arc<Session>,
}

impl SimpleRequest {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Execute an update and return the affected-row count.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.session.execute(sql, params).await
    }

    /// Fetch rows decoded to the expected column types.
    pub async fn query_typed(
        &self,
        sql: &str,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        self.session.query_typed(sql, params, expected).await
    }

    /// Fetch rows as JSON objects keyed by column name.
    pub async fn query_json(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Vec<serde_json::Map<String, JsonValue>>> {
        self.session.query_json(sql, params).await
    }

    /// Fetch a query expected to yield exactly one row.
    pub async fn single_row(
        &self,
        sql: &str,
        params: &[SqlValue],
        expected: &[SqlType],
    ) -> DbResult<Vec<SqlValue>> {
        let mut rows = self.session.query_typed(sql, params, expected).await?;
        if rows.is_empty() {
            return Err(DbError::no_data(format!("no row returned by: {sql}")));
        }
        Ok(rows.swap_remove(0))
    }
}
