//! Physical storage abstraction.
//!
//! A [`Gateway`] hands out [`Connection`]s. A connection executes the
//! physical side of change sets ([`Command`]) and read queries ([`Query`]),
//! optionally inside one physical transaction at a time.
//!
//! `DatabaseTransaction` only talks to storage through these traits;
//! the in-memory [`inmemory::Database`] is the reference implementation used
//! by tests, and `keystone-postgres` provides the production one.

use std::{fmt, future::Future};

use crate::{
    entity::{EntityInfo, Row},
    filter::{Assignment, Filter},
};

pub mod inmemory;

/// Lifecycle state of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Still being established; callers poll until it settles.
    Connecting,
    Open,
    Executing,
    Fetching,
    Closed,
    Broken,
}

impl ConnectionState {
    /// Whether a connection in this state can be reused as-is.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Open | Self::Executing | Self::Fetching)
    }
}

/// Conflict handling for inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertBehavior {
    /// A conflicting key is an error.
    #[default]
    Default,
    /// Rows whose key already exists are skipped.
    DoNothing,
    /// Rows whose key already exists overwrite the stored row.
    DoUpdate,
}

/// Physical side of a change set.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Insert {
        entity: &'static EntityInfo,
        rows: Vec<Row>,
        behavior: InsertBehavior,
    },
    Update {
        entity: &'static EntityInfo,
        filter: Filter,
        assignments: Vec<Assignment>,
    },
    Delete {
        entity: &'static EntityInfo,
        filter: Filter,
    },
}

impl Command {
    #[must_use]
    pub const fn entity(&self) -> &'static EntityInfo {
        match self {
            Self::Insert { entity, .. } | Self::Update { entity, .. } | Self::Delete { entity, .. } => {
                entity
            }
        }
    }

    /// Short verb for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Read of every row of an entity's table matching a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub entity: &'static EntityInfo,
    pub filter: Filter,
}

impl Query {
    #[must_use]
    pub const fn new(entity: &'static EntityInfo, filter: Filter) -> Self {
        Self { entity, filter }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} where {:?}", self.entity.qualified_name(), self.filter)
    }
}

/// Source of physical connections.
pub trait Gateway: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Connection: Connection<Error = Self::Error>;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send + '_;
}

/// A physical connection.
///
/// At most one physical transaction is open on a connection. Dropping a
/// connection with an open transaction rolls it back.
pub trait Connection: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn state(&self) -> ConnectionState;

    fn in_transaction(&self) -> bool;

    fn begin(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    fn commit(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    fn rollback(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// A storage-generated, monotonically increasing version number.
    fn version(&mut self) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

    fn query<'a>(
        &'a mut self,
        query: &'a Query,
    ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send + 'a;

    /// Execute a command and return the number of affected rows.
    fn execute<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;
}
