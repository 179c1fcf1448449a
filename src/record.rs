//! Generic typed row mapping.
//!
//! A [`Record`] describes one table row as an ordered list of typed fields.
//! The blanket [`RecordOps`] impl supplies the persistence operations on top
//! of that description: existence check, load, insert, update, delete, and
//! JSON projection. SQL is generated per vendor through the session's
//! dialect, so the same record type works against any supported backend.
//!
//! A record is backed either by a [`Session`] or by an in-process
//! [`MemoryIndex`], which gives tests and offline tools the same surface
//! without a database.

use crate::error::{DbError, DbResult};
use crate::session::Session;
use crate::value::{SqlType, SqlValue, TypedValue};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

/// Static description of one table column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub primary_key: bool,
}

/// Where a record reads and writes its row.
#[derive(Clone)]
pub enum Backing {
    /// Backed by a database session. With `commit_on_write` set, every
    /// successful write is committed immediately.
    Store {
        session: Arc<Session>,
        commit_on_write: bool,
    },
    /// Backed by an in-process index; no database involved.
    Memory(Arc<MemoryIndex>),
}

impl Backing {
    pub fn store(session: Arc<Session>) -> Self {
        Self::Store {
            session,
            commit_on_write: false,
        }
    }

    pub fn store_committing(session: Arc<Session>) -> Self {
        Self::Store {
            session,
            commit_on_write: true,
        }
    }

    pub fn memory(index: Arc<MemoryIndex>) -> Self {
        Self::Memory(index)
    }
}

/// One mapped table row. Implementations supply the table name, the column
/// layout, and access to the field values; [`RecordOps`] does the rest.
///
/// `columns()` and `fields()` must be parallel: field `i` holds the value of
/// column `i`.
pub trait Record: Send + Sync {
    fn table(&self) -> &'static str;
    fn columns(&self) -> &'static [ColumnSpec];
    fn fields(&self) -> Vec<&TypedValue>;
    fn fields_mut(&mut self) -> Vec<&mut TypedValue>;
    fn backing(&self) -> &Backing;
    /// Whether this record is known to exist in the backing store.
    fn persisted(&self) -> bool;
    fn set_persisted(&mut self, persisted: bool);
}

#[async_trait]
pub trait RecordOps: Record {
    /// Whether a row with this record's primary key exists.
    async fn exists(&self) -> DbResult<bool>;

    /// Fill the non-key fields from the stored row. Fails with a no-data
    /// error when the row is absent.
    async fn load(&mut self) -> DbResult<()>;

    /// Insert the row. A record already marked persisted is left alone.
    async fn insert(&mut self) -> DbResult<()>;

    /// Rewrite the non-key columns of the stored row. A record already
    /// marked persisted is left alone; fails with a no-data error when the
    /// row is absent.
    async fn update(&mut self) -> DbResult<()>;

    /// Remove the stored row. Fails with a no-data error when the row is
    /// absent.
    async fn delete(&mut self) -> DbResult<()>;

    fn field(&self, name: &str) -> DbResult<&TypedValue>;

    /// Assign a field by column name. Any mutation clears the persisted
    /// flag, so the next write restates the row.
    fn set_field(&mut self, name: &str, value: SqlValue) -> DbResult<()>;

    /// The record as a JSON object keyed by column name.
    fn to_json(&self) -> JsonValue;

    /// Apply a JSON object to the matching fields. Unknown keys are
    /// rejected.
    fn apply_json(&mut self, json: &JsonValue) -> DbResult<()>;
}

#[async_trait]
impl<T: Record + ?Sized> RecordOps for T {
    async fn exists(&self) -> DbResult<bool> {
        match self.backing().clone() {
            Backing::Store { session, .. } => {
                let (sql, params, expected) = select_key_sql(self, &session)?;
                let rows = session.query_typed(&sql, &params, &expected).await?;
                Ok(!rows.is_empty())
            }
            Backing::Memory(index) => Ok(index.contains(self.table(), &key_of(self)?)),
        }
    }

    async fn load(&mut self) -> DbResult<()> {
        let row = match self.backing().clone() {
            Backing::Store { session, .. } => {
                let (sql, params, expected) = select_all_sql(self, &session)?;
                let mut rows = session.query_typed(&sql, &params, &expected).await?;
                if rows.is_empty() {
                    return Err(absent_row(self));
                }
                rows.swap_remove(0)
            }
            Backing::Memory(index) => index
                .get(self.table(), &key_of(self)?)
                .ok_or_else(|| absent_row(self))?,
        };
        assign_row(self, row)?;
        self.set_persisted(true);
        Ok(())
    }

    async fn insert(&mut self) -> DbResult<()> {
        if self.persisted() {
            return Ok(());
        }
        match self.backing().clone() {
            Backing::Store {
                session,
                commit_on_write,
            } => {
                let (sql, params) = insert_sql(self, &session);
                let affected = session.execute(&sql, &params).await?;
                if affected == 0 {
                    return Err(DbError::no_data(format!(
                        "insert into '{}' affected no rows",
                        self.table()
                    )));
                }
                if commit_on_write {
                    session.commit().await?;
                }
            }
            Backing::Memory(index) => {
                index.put(self.table(), key_of(self)?, row_of(self));
            }
        }
        self.set_persisted(true);
        Ok(())
    }

    async fn update(&mut self) -> DbResult<()> {
        // Persisted means the stored row already matches; nothing to restate.
        if self.persisted() {
            return Ok(());
        }
        match self.backing().clone() {
            Backing::Store {
                session,
                commit_on_write,
            } => {
                let (sql, params) = update_sql(self, &session)?;
                let affected = session.execute(&sql, &params).await?;
                if affected == 0 {
                    return Err(absent_row(self));
                }
                if commit_on_write {
                    session.commit().await?;
                }
            }
            Backing::Memory(index) => {
                let key = key_of(self)?;
                if !index.contains(self.table(), &key) {
                    return Err(absent_row(self));
                }
                index.put(self.table(), key, row_of(self));
            }
        }
        self.set_persisted(true);
        Ok(())
    }

    async fn delete(&mut self) -> DbResult<()> {
        match self.backing().clone() {
            Backing::Store {
                session,
                commit_on_write,
            } => {
                let (sql, params) = delete_sql(self, &session)?;
                let affected = session.execute(&sql, &params).await?;
                if affected == 0 {
                    return Err(absent_row(self));
                }
                if commit_on_write {
                    session.commit().await?;
                }
            }
            Backing::Memory(index) => {
                if !index.remove(self.table(), &key_of(self)?) {
                    return Err(absent_row(self));
                }
            }
        }
        self.set_persisted(false);
        Ok(())
    }

    fn field(&self, name: &str) -> DbResult<&TypedValue> {
        let index = self.column_index(name)?;
        Ok(self.fields()[index])
    }

    fn set_field(&mut self, name: &str, value: SqlValue) -> DbResult<()> {
        let index = self.column_index(name)?;
        self.fields_mut()[index].set(value)?;
        self.set_persisted(false);
        Ok(())
    }

    fn to_json(&self) -> JsonValue {
        let mut object = Map::new();
        for field in self.fields() {
            object.insert(field.column().to_string(), field.to_json());
        }
        JsonValue::Object(object)
    }

    fn apply_json(&mut self, json: &JsonValue) -> DbResult<()> {
        let JsonValue::Object(object) = json else {
            return Err(DbError::sql("record payload must be a JSON object"));
        };
        for key in object.keys() {
            self.column_index(key)?;
        }
        for field in self.fields_mut() {
            if let Some(value) = object.get(field.column()) {
                field.set_from_json(value)?;
            }
        }
        self.set_persisted(false);
        Ok(())
    }
}

trait RecordExt: Record {
    fn column_index(&self, name: &str) -> DbResult<usize> {
        self.columns()
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                DbError::sql(format!(
                    "table '{}' has no column '{}'",
                    self.table(),
                    name
                ))
            })
    }
}

impl<T: Record + ?Sized> RecordExt for T {}

fn absent_row<T: Record + ?Sized>(record: &T) -> DbError {
    DbError::no_data(format!("no row in '{}' for this key", record.table()))
}

/// Primary-key equality clause plus the key parameter values. Null key
/// fields are rejected up front.
fn key_clause<T: Record + ?Sized>(
    record: &T,
    session: &Arc<Session>,
    first_index: usize,
) -> DbResult<(String, Vec<SqlValue>)> {
    let dialect = session.dialect();
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for (spec, field) in record.columns().iter().zip(record.fields()) {
        if !spec.primary_key {
            continue;
        }
        if field.is_null() {
            return Err(DbError::sql(format!(
                "key column '{}' of '{}' is null",
                spec.name,
                record.table()
            )));
        }
        clauses.push(format!(
            "{} = {}",
            spec.name,
            dialect.placeholder(first_index + params.len())
        ));
        params.push(field.value().clone());
    }
    if clauses.is_empty() {
        return Err(DbError::sql(format!(
            "table '{}' declares no key columns",
            record.table()
        )));
    }
    Ok((clauses.join(" AND "), params))
}

fn select_key_sql<T: Record + ?Sized>(
    record: &T,
    session: &Arc<Session>,
) -> DbResult<(String, Vec<SqlValue>, Vec<SqlType>)> {
    let keys: Vec<&ColumnSpec> = record.columns().iter().filter(|c| c.primary_key).collect();
    let fields = keys
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    let expected = keys.iter().map(|c| c.sql_type).collect();
    let (clause, params) = key_clause(record, session, 1)?;
    let sql = format!("SELECT {} FROM {} WHERE {}", fields, record.table(), clause);
    Ok((sql, params, expected))
}

fn select_all_sql<T: Record + ?Sized>(
    record: &T,
    session: &Arc<Session>,
) -> DbResult<(String, Vec<SqlValue>, Vec<SqlType>)> {
    let fields = record
        .columns()
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    let expected = record.columns().iter().map(|c| c.sql_type).collect();
    let (clause, params) = key_clause(record, session, 1)?;
    let sql = format!("SELECT {} FROM {} WHERE {}", fields, record.table(), clause);
    Ok((sql, params, expected))
}

fn insert_sql<T: Record + ?Sized>(record: &T, session: &Arc<Session>) -> (String, Vec<SqlValue>) {
    let dialect = session.dialect();
    let names = record
        .columns()
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=record.columns().len())
        .map(|i| dialect.placeholder(i))
        .collect::<Vec<_>>()
        .join(", ");
    let params = record.fields().iter().map(|f| f.value().clone()).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        record.table(),
        names,
        placeholders
    );
    (sql, params)
}

fn update_sql<T: Record + ?Sized>(
    record: &T,
    session: &Arc<Session>,
) -> DbResult<(String, Vec<SqlValue>)> {
    let dialect = session.dialect();
    let mut assignments = Vec::new();
    let mut params = Vec::new();
    for (spec, field) in record.columns().iter().zip(record.fields()) {
        if spec.primary_key {
            continue;
        }
        assignments.push(format!(
            "{} = {}",
            spec.name,
            dialect.placeholder(params.len() + 1)
        ));
        params.push(field.value().clone());
    }
    if assignments.is_empty() {
        return Err(DbError::sql(format!(
            "table '{}' has only key columns, nothing to update",
            record.table()
        )));
    }
    let (clause, key_params) = key_clause(record, session, params.len() + 1)?;
    params.extend(key_params);
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        record.table(),
        assignments.join(", "),
        clause
    );
    Ok((sql, params))
}

fn delete_sql<T: Record + ?Sized>(
    record: &T,
    session: &Arc<Session>,
) -> DbResult<(String, Vec<SqlValue>)> {
    let (clause, params) = key_clause(record, session, 1)?;
    let sql = format!("DELETE FROM {} WHERE {}", record.table(), clause);
    Ok((sql, params))
}

fn key_of<T: Record + ?Sized>(record: &T) -> DbResult<String> {
    let mut parts = Vec::new();
    for (spec, field) in record.columns().iter().zip(record.fields()) {
        if !spec.primary_key {
            continue;
        }
        let part = field.to_text().ok_or_else(|| {
            DbError::sql(format!(
                "key column '{}' of '{}' is null",
                spec.name,
                record.table()
            ))
        })?;
        parts.push(part);
    }
    if parts.is_empty() {
        return Err(DbError::sql(format!(
            "table '{}' declares no key columns",
            record.table()
        )));
    }
    Ok(parts.join("\u{1f}"))
}

fn row_of<T: Record + ?Sized>(record: &T) -> Vec<SqlValue> {
    record.fields().iter().map(|f| f.value().clone()).collect()
}

fn assign_row<T: Record + ?Sized>(record: &mut T, row: Vec<SqlValue>) -> DbResult<()> {
    let fields = record.fields_mut();
    if row.len() != fields.len() {
        return Err(DbError::sql(format!(
            "row width {} does not match {} declared columns",
            row.len(),
            fields.len()
        )));
    }
    for (field, value) in fields.into_iter().zip(row) {
        field.set(value)?;
    }
    Ok(())
}

/// In-process row store keyed by table and primary key. Gives the record
/// surface without a database.
#[derive(Default)]
pub struct MemoryIndex {
    tables: StdMutex<HashMap<String, HashMap<String, Vec<SqlValue>>>>,
}

impl MemoryIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn contains(&self, table: &str, key: &str) -> bool {
        let tables = self.tables.lock().expect("memory index poisoned");
        tables.get(table).is_some_and(|rows| rows.contains_key(key))
    }

    fn get(&self, table: &str, key: &str) -> Option<Vec<SqlValue>> {
        let tables = self.tables.lock().expect("memory index poisoned");
        tables.get(table).and_then(|rows| rows.get(key)).cloned()
    }

    fn put(&self, table: &str, key: String, row: Vec<SqlValue>) {
        let mut tables = self.tables.lock().expect("memory index poisoned");
        tables.entry(table.to_string()).or_default().insert(key, row);
    }

    fn remove(&self, table: &str, key: &str) -> bool {
        let mut tables = self.tables.lock().expect("memory index poisoned");
        tables
            .get_mut(table)
            .is_some_and(|rows| rows.remove(key).is_some())
    }

    /// Number of rows held for `table`.
    pub fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().expect("memory index poisoned");
        tables.get(table).map_or(0, HashMap::len)
    }
}
