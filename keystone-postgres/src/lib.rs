//! Postgres-backed storage for keystone.
//!
//! This crate provides `PostgreSQL` implementations of the core keystone
//! traits:
//!
//! - [`Database`] - An implementation of [`keystone_core::gateway::Gateway`]
//! - [`CatalogReader`] - An implementation of
//!   [`keystone_core::model::DatabaseModelBuilder`]
//! - [`Executor`] - An implementation of
//!   [`keystone_core::model::ModelChangeExecutor`]
//!
//! All three can share a connection pool.
//!
//! Rows are exchanged as `jsonb` objects keyed by column name, so an entity's
//! serde representation must match its table's columns.

mod catalog;
mod error;
mod executor;
mod sql;

pub use catalog::CatalogReader;
pub use error::Error;
pub use executor::Executor;
use keystone_core::{
    entity::Row,
    gateway::{self, Command, ConnectionState, Query},
};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row as _};

/// A PostgreSQL-backed [`Gateway`](gateway::Gateway).
///
/// Each [`Connection`] shares the pool; a physical transaction pins one pooled
/// connection until it commits or rolls back.
#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl gateway::Gateway for Database {
    type Connection = Connection;
    type Error = Error;

    fn connect(&self) -> impl Future<Output = Result<Connection, Error>> + Send + '_ {
        let connection = if self.pool.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(Connection {
                pool: self.pool.clone(),
                transaction: None,
                closed: false,
                broken: false,
            })
        };
        std::future::ready(connection)
    }
}

/// A connection handed out by [`Database`].
pub struct Connection {
    pool: PgPool,
    transaction: Option<sqlx::Transaction<'static, Postgres>>,
    closed: bool,
    broken: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("in_transaction", &self.transaction.is_some())
            .field("closed", &self.closed)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Close the connection, rolling back any open physical transaction.
    pub fn close(&mut self) {
        // Dropping a sqlx transaction rolls it back.
        self.transaction = None;
        self.closed = true;
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed || self.pool.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn track<T>(&mut self, result: Result<T, sqlx::Error>) -> Result<T, Error> {
        result.map_err(|e| {
            if error::is_fatal(&e) {
                tracing::warn!(error = %e, "postgres connection broken");
                self.broken = true;
                self.transaction = None;
            }
            Error::Database(e)
        })
    }
}

impl gateway::Connection for Connection {
    type Error = Error;

    fn state(&self) -> ConnectionState {
        if self.broken {
            ConnectionState::Broken
        } else if self.closed || self.pool.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    #[tracing::instrument(skip(self))]
    async fn begin(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        if self.transaction.is_some() {
            return Err(Error::TransactionOpen);
        }
        let result = self.pool.begin().await;
        self.transaction = Some(self.track(result)?);
        tracing::trace!("physical transaction started");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn commit(&mut self) -> Result<(), Error> {
        let transaction = self.transaction.take().ok_or(Error::NoTransaction)?;
        let result = transaction.commit().await;
        self.track(result)?;
        tracing::debug!("physical transaction committed");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn rollback(&mut self) -> Result<(), Error> {
        let transaction = self.transaction.take().ok_or(Error::NoTransaction)?;
        let result = transaction.rollback().await;
        self.track(result)?;
        tracing::debug!("physical transaction rolled back");
        Ok(())
    }

    async fn version(&mut self) -> Result<i64, Error> {
        self.ensure_open()?;
        let query = sqlx::query_scalar::<_, i64>("SELECT txid_current()");
        let result = match self.transaction.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await,
            None => query.fetch_one(&self.pool).await,
        };
        self.track(result)
    }

    #[tracing::instrument(
        skip(self, query),
        fields(table = %query.entity.qualified_name())
    )]
    async fn query<'a>(&'a mut self, query: &'a Query) -> Result<Vec<Row>, Error> {
        self.ensure_open()?;
        let mut qb = sql::select(query);
        let statement = qb.build();
        let result = match self.transaction.as_mut() {
            Some(tx) => statement.fetch_all(&mut **tx).await,
            None => statement.fetch_all(&self.pool).await,
        };
        let records = self.track(result)?;

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let value: Value = self.track(record.try_get(0))?;
            match value {
                Value::Object(row) => rows.push(row),
                other => {
                    return Err(Error::InvalidRow {
                        table: query.entity.qualified_name(),
                        found: other.to_string(),
                    });
                }
            }
        }
        tracing::trace!(rows = rows.len(), "query fetched");
        Ok(rows)
    }

    #[tracing::instrument(
        skip(self, command),
        fields(table = %command.entity().qualified_name(), kind = command.kind())
    )]
    async fn execute<'a>(&'a mut self, command: &'a Command) -> Result<u64, Error> {
        self.ensure_open()?;
        let mut qb = sql::command(command);
        let statement = qb.build();
        let result = match self.transaction.as_mut() {
            Some(tx) => statement.execute(&mut **tx).await,
            None => statement.execute(&self.pool).await,
        };
        let affected = self.track(result)?.rows_affected();
        tracing::trace!(affected, "command executed");
        Ok(affected)
    }
}
