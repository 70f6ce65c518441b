//! In-memory gateway implementation for testing.
//!
//! [`Database`] keeps every table as a list of [`Row`]s behind a shared
//! `tokio` lock. A connection's physical transaction claims the write lock at
//! its first write and stages changes on a private copy of the tables, which
//! replaces the shared state on commit. Reads before the first write see the
//! latest committed state, so another writer can still get in between a
//! transaction's reads and its commit.
//!
//! # Example
//!
//! ```
//! use keystone_core::gateway::inmemory;
//!
//! let database = inmemory::Database::new();
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::{
    entity::{EntityInfo, Row},
    gateway::{Command, ConnectionState, Gateway, InsertBehavior, Query},
};

type TableKey = (String, String);

#[derive(Debug, Clone, Default)]
struct Tables {
    tables: HashMap<TableKey, Vec<Row>>,
}

fn table_key(entity: &EntityInfo) -> TableKey {
    (
        entity.schema.to_ascii_lowercase(),
        entity.table.to_ascii_lowercase(),
    )
}

impl Tables {
    fn select(&self, query: &Query) -> Vec<Row> {
        self.tables
            .get(&table_key(query.entity))
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn apply(&mut self, command: &Command) -> Result<u64, InMemoryError> {
        let entity = command.entity();
        let rows = self.tables.entry(table_key(entity)).or_default();
        match command {
            Command::Insert {
                rows: inserted,
                behavior,
                ..
            } => {
                let mut affected = 0;
                for row in inserted {
                    let key = row
                        .get(entity.key)
                        .filter(|key| !key.is_null())
                        .ok_or_else(|| InMemoryError::MissingKey {
                            table: entity.qualified_name(),
                            column: entity.key,
                        })?;
                    let existing = rows
                        .iter()
                        .position(|stored| stored.get(entity.key) == Some(key));
                    match (existing, behavior) {
                        (None, _) => {
                            rows.push(row.clone());
                            affected += 1;
                        }
                        (Some(_), InsertBehavior::Default) => {
                            return Err(InMemoryError::DuplicateKey {
                                table: entity.qualified_name(),
                                key: key.clone(),
                            });
                        }
                        (Some(_), InsertBehavior::DoNothing) => {}
                        (Some(position), InsertBehavior::DoUpdate) => {
                            rows[position] = row.clone();
                            affected += 1;
                        }
                    }
                }
                Ok(affected)
            }
            Command::Update {
                filter,
                assignments,
                ..
            } => {
                let mut affected = 0;
                for row in rows.iter_mut().filter(|row| filter.matches(row)) {
                    for assignment in assignments {
                        assignment.apply(row);
                    }
                    affected += 1;
                }
                Ok(affected)
            }
            Command::Delete { filter, .. } => {
                let before = rows.len();
                rows.retain(|row| !filter.matches(row));
                Ok((before - rows.len()) as u64)
            }
        }
    }
}

/// Highest version a command writes into its table's version column.
fn written_version(command: &Command) -> Option<i64> {
    let column = command.entity().version;
    match command {
        Command::Insert { rows, .. } => rows
            .iter()
            .filter_map(|row| row.get(column).and_then(Value::as_i64))
            .max(),
        Command::Update { assignments, .. } => assignments
            .iter()
            .filter(|assignment| assignment.column == column)
            .filter_map(|assignment| assignment.value.as_i64())
            .max(),
        Command::Delete { .. } => None,
    }
}

/// Error type for the in-memory gateway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InMemoryError {
    #[error("connection is closed")]
    Closed,
    #[error("no physical transaction is open")]
    NoTransaction,
    #[error("a physical transaction is already open on this connection")]
    TransactionOpen,
    #[error("duplicate key {key} in `{table}`")]
    DuplicateKey { table: String, key: Value },
    #[error("row for `{table}` has no value for key column `{column}`")]
    MissingKey { table: String, column: &'static str },
}

/// Shared in-memory database.
///
/// Cloning is cheap and every clone sees the same tables.
#[derive(Clone, Default)]
pub struct Database {
    tables: Arc<RwLock<Tables>>,
    clock: Arc<AtomicI64>,
}

impl Database {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of an entity's table, in insertion order.
    pub async fn rows(&self, entity: &EntityInfo) -> Vec<Row> {
        let tables = self.tables.read().await;
        tables
            .tables
            .get(&table_key(entity))
            .cloned()
            .unwrap_or_default()
    }

    /// Execute a command outside any transaction, as another writer would.
    ///
    /// Waits for any transaction currently holding the write lock.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate or missing key; nothing is written in that case.
    #[tracing::instrument(skip(self, command), fields(kind = command.kind(), entity = %command.entity()))]
    pub async fn apply(&self, command: &Command) -> Result<u64, InMemoryError> {
        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        let affected = staged.apply(command)?;
        *tables = staged;
        if let Some(version) = written_version(command) {
            self.advance_version(version);
        }
        tracing::trace!(affected, "command applied");
        Ok(affected)
    }

    /// Last version handed out by [`Connection::version`].
    #[must_use]
    pub fn current_version(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Make sure versions handed out from now on are greater than `version`.
    pub fn advance_version(&self, version: i64) {
        self.clock.fetch_max(version, Ordering::SeqCst);
    }
}

impl Gateway for Database {
    type Connection = Connection;
    type Error = InMemoryError;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send + '_ {
        tracing::trace!("in-memory connection opened");
        std::future::ready(Ok(Connection {
            tables: Arc::clone(&self.tables),
            clock: Arc::clone(&self.clock),
            transaction: None,
            closed: false,
        }))
    }
}

/// Physical transaction state: the write lock and the staged tables, claimed
/// at the first write.
#[derive(Default)]
struct Session {
    write: Option<(OwnedRwLockWriteGuard<Tables>, Tables)>,
}

/// Connection to a [`Database`].
pub struct Connection {
    tables: Arc<RwLock<Tables>>,
    clock: Arc<AtomicI64>,
    transaction: Option<Session>,
    closed: bool,
}

impl Connection {
    /// Close the connection, rolling back any open transaction.
    pub fn close(&mut self) {
        self.transaction = None;
        self.closed = true;
    }

    const fn ensure_open(&self) -> Result<(), InMemoryError> {
        if self.closed {
            Err(InMemoryError::Closed)
        } else {
            Ok(())
        }
    }
}

impl super::Connection for Connection {
    type Error = InMemoryError;

    fn state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn begin(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        let result = self.ensure_open().and_then(|()| {
            if self.transaction.is_some() {
                return Err(InMemoryError::TransactionOpen);
            }
            self.transaction = Some(Session::default());
            tracing::trace!("physical transaction started");
            Ok(())
        });
        std::future::ready(result)
    }

    fn commit(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        let result = self.ensure_open().and_then(|()| {
            let session = self.transaction.take().ok_or(InMemoryError::NoTransaction)?;
            if let Some((mut guard, staged)) = session.write {
                *guard = staged;
                tracing::trace!("physical transaction committed");
            }
            Ok(())
        });
        std::future::ready(result)
    }

    fn rollback(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        let result = self.ensure_open().and_then(|()| {
            self.transaction
                .take()
                .map(|_| tracing::trace!("physical transaction rolled back"))
                .ok_or(InMemoryError::NoTransaction)
        });
        std::future::ready(result)
    }

    fn version(&mut self) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_ {
        let result = self
            .ensure_open()
            .map(|()| self.clock.fetch_add(1, Ordering::SeqCst) + 1);
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, query), fields(entity = %query.entity))]
    fn query<'a>(
        &'a mut self,
        query: &'a Query,
    ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send + 'a {
        async move {
            self.ensure_open()?;
            let rows = match self.transaction.as_ref().and_then(|s| s.write.as_ref()) {
                Some((_, staged)) => staged.select(query),
                None => self.tables.read().await.select(query),
            };
            tracing::trace!(rows = rows.len(), "rows fetched");
            Ok(rows)
        }
    }

    #[tracing::instrument(skip(self, command), fields(kind = command.kind(), entity = %command.entity()))]
    fn execute<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a {
        async move {
            self.ensure_open()?;
            if let Some(version) = written_version(command) {
                self.clock.fetch_max(version, Ordering::SeqCst);
            }
            let Some(session) = self.transaction.as_mut() else {
                let mut tables = self.tables.write().await;
                let mut staged = tables.clone();
                let affected = staged.apply(command)?;
                *tables = staged;
                return Ok(affected);
            };
            if session.write.is_none() {
                let guard = Arc::clone(&self.tables).write_owned().await;
                let staged = guard.clone();
                session.write = Some((guard, staged));
            }
            let Some((_, staged)) = session.write.as_mut() else {
                unreachable!("write lock claimed above");
            };
            let affected = staged.apply(command)?;
            tracing::trace!(affected, "command staged");
            Ok(affected)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        entity::{Entity, fixtures::User, to_row},
        filter::{Assignment, Filter},
        gateway::Connection as _,
    };

    fn insert(users: &[User], behavior: InsertBehavior) -> Command {
        Command::Insert {
            entity: User::info(),
            rows: users.iter().map(|u| to_row(u).unwrap()).collect(),
            behavior,
        }
    }

    fn all_users() -> Query {
        Query::new(User::info(), Filter::All)
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let database = Database::new();
        let mut writer = database.connect().await.unwrap();
        let mut reader = database.connect().await.unwrap();

        writer.begin().await.unwrap();
        writer
            .execute(&insert(&[User::new(1, "a", 1)], InsertBehavior::Default))
            .await
            .unwrap();
        assert_eq!(writer.query(&all_users()).await.unwrap().len(), 1);
        assert!(database.rows(User::info()).await.is_empty());

        writer.commit().await.unwrap();
        assert_eq!(reader.query(&all_users()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let database = Database::new();
        let mut conn = database.connect().await.unwrap();
        conn.begin().await.unwrap();
        conn.execute(&insert(&[User::new(1, "a", 1)], InsertBehavior::Default))
            .await
            .unwrap();
        conn.rollback().await.unwrap();
        assert!(!conn.in_transaction());
        assert!(database.rows(User::info()).await.is_empty());
    }

    #[tokio::test]
    async fn insert_behaviors_handle_conflicts() {
        let database = Database::new();
        database
            .apply(&insert(&[User::new(1, "a", 1)], InsertBehavior::Default))
            .await
            .unwrap();

        let err = database
            .apply(&insert(&[User::new(2, "b", 1), User::new(1, "c", 1)], InsertBehavior::Default))
            .await
            .unwrap_err();
        assert!(matches!(err, InMemoryError::DuplicateKey { .. }));
        assert_eq!(database.rows(User::info()).await.len(), 1);

        let skipped = database
            .apply(&insert(&[User::new(1, "c", 1)], InsertBehavior::DoNothing))
            .await
            .unwrap();
        assert_eq!(skipped, 0);

        let replaced = database
            .apply(&insert(&[User::new(1, "d", 2)], InsertBehavior::DoUpdate))
            .await
            .unwrap();
        assert_eq!(replaced, 1);
        assert_eq!(database.rows(User::info()).await[0].get("nickname"), Some(&json!("d")));
    }

    #[tokio::test]
    async fn update_and_delete_report_affected_rows() {
        let database = Database::new();
        database
            .apply(&insert(
                &[User::new(1, "a", 1), User::new(2, "b", 1), User::new(3, "c", 2)],
                InsertBehavior::Default,
            ))
            .await
            .unwrap();

        let updated = database
            .apply(&Command::Update {
                entity: User::info(),
                filter: Filter::eq("version", 1),
                assignments: vec![Assignment::set("nickname", "z")],
            })
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let deleted = database
            .apply(&Command::Delete {
                entity: User::info(),
                filter: Filter::eq("nickname", "z"),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(database.rows(User::info()).await.len(), 1);
    }

    #[tokio::test]
    async fn versions_increase_monotonically() {
        let database = Database::new();
        let mut conn = database.connect().await.unwrap();
        let first = conn.version().await.unwrap();
        let second = conn.version().await.unwrap();
        assert!(second > first);

        database.advance_version(100);
        assert!(conn.version().await.unwrap() > 100);
    }

    #[tokio::test]
    async fn written_versions_advance_the_clock() {
        let database = Database::new();
        let mut conn = database.connect().await.unwrap();
        conn.begin().await.unwrap();
        conn.execute(&insert(&[User::new(1, "a", 50)], InsertBehavior::Default))
            .await
            .unwrap();
        conn.commit().await.unwrap();
        assert!(conn.version().await.unwrap() > 50);

        database
            .apply(&Command::Update {
                entity: User::info(),
                filter: Filter::All,
                assignments: vec![Assignment::set("version", 80)],
            })
            .await
            .unwrap();
        assert!(conn.version().await.unwrap() > 80);
    }

    #[tokio::test]
    async fn closed_connection_rejects_work() {
        let database = Database::new();
        let mut conn = database.connect().await.unwrap();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.begin().await.unwrap_err(), InMemoryError::Closed);
    }
}
