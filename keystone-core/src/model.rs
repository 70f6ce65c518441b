//! Schema model and diffing.
//!
//! A database schema is described as an immutable tree of nodes:
//!
//! ```text
//! DatabaseNode
//! └── SchemaNode
//!     ├── TableNode ── ColumnNode
//!     ├── ViewNode
//!     └── IndexNode
//! ```
//!
//! Two trees (what storage *has* and what the application *expects*) are
//! compared by a [`ModelComparator`] into a list of [`ModelChange`]s, ordered
//! for execution by a [`ModelChangesSorter`] and applied by a
//! [`ModelChangeExecutor`]. [`migrate`] runs the whole pipeline.
//!
//! Names compare case-insensitively everywhere.

use std::{collections::HashMap, fmt, future::Future};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod comparator;
mod migration;
mod sorter;

pub use comparator::StructuralComparator;
pub use migration::{MigrationError, migrate};
pub use sorter::DependencyOrder;

/// A node that can be paired with its counterpart in another model.
pub trait ModelNode {
    /// Lower-cased key identifying the node among its siblings.
    fn identity(&self) -> String;

    /// Whether two nodes with the same identity describe the same object.
    fn equivalent(&self, other: &Self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseNode {
    pub name: String,
    pub schemas: Vec<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaNode {
    pub name: String,
    pub tables: Vec<TableNode>,
    pub views: Vec<ViewNode>,
    pub indexes: Vec<IndexNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNode {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnNode>,
    /// Primary key column, if any.
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnNode {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewNode {
    pub schema: String,
    pub name: String,
    /// Defining `SELECT` statement.
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNode {
    pub schema: String,
    pub table: String,
    /// Physical name. Not part of the identity: an index is identified by the
    /// columns it covers.
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl DatabaseNode {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schemas: Vec::new(),
        }
    }

    #[must_use]
    pub fn schema(&self, name: &str) -> Option<&SchemaNode> {
        self.schemas.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

impl SchemaNode {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableNode> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

impl TableNode {
    #[must_use]
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            key: None,
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnNode> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Append a column belonging to this table.
    #[must_use]
    pub fn with_column(mut self, name: &str, data_type: &str, nullable: bool) -> Self {
        self.columns.push(ColumnNode {
            schema: self.schema.clone(),
            table: self.name.clone(),
            name: name.to_owned(),
            data_type: data_type.to_owned(),
            nullable,
        });
        self
    }

    #[must_use]
    pub fn with_key(mut self, column: &str) -> Self {
        self.key = Some(column.to_owned());
        self
    }
}

impl ViewNode {
    #[must_use]
    pub fn new(schema: impl Into<String>, name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            query: query.into(),
        }
    }
}

impl IndexNode {
    /// Conventional physical name: `ix_<table>_<col>_<col>` (`ux_` when
    /// unique).
    #[must_use]
    pub fn default_name(table: &str, columns: &[String], unique: bool) -> String {
        let prefix = if unique { "ux" } else { "ix" };
        format!("{prefix}_{}_{}", table, columns.join("_")).to_ascii_lowercase()
    }
}

fn lower(parts: &[&String]) -> String {
    parts
        .iter()
        .map(|part| part.as_str())
        .collect::<Vec<_>>()
        .join(".")
        .to_ascii_lowercase()
}

impl ModelNode for DatabaseNode {
    fn identity(&self) -> String {
        lower(&[&self.name])
    }

    fn equivalent(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl ModelNode for SchemaNode {
    fn identity(&self) -> String {
        lower(&[&self.name])
    }

    fn equivalent(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl ModelNode for TableNode {
    fn identity(&self) -> String {
        lower(&[&self.schema, &self.name])
    }

    fn equivalent(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl ModelNode for ColumnNode {
    fn identity(&self) -> String {
        lower(&[&self.schema, &self.table, &self.name])
    }

    fn equivalent(&self, other: &Self) -> bool {
        self.data_type.eq_ignore_ascii_case(&other.data_type) && self.nullable == other.nullable
    }
}

impl ModelNode for ViewNode {
    fn identity(&self) -> String {
        lower(&[&self.schema, &self.name])
    }

    /// Queries compare with whitespace runs collapsed.
    fn equivalent(&self, other: &Self) -> bool {
        let normalize = |query: &str| query.split_whitespace().collect::<Vec<_>>().join(" ");
        normalize(&self.query) == normalize(&other.query)
    }
}

impl ModelNode for IndexNode {
    fn identity(&self) -> String {
        let mut columns: Vec<String> = self.columns.iter().map(|c| c.to_ascii_lowercase()).collect();
        columns.sort();
        format!("{}({})", lower(&[&self.schema, &self.table]), columns.join(","))
    }

    fn equivalent(&self, other: &Self) -> bool {
        self.unique == other.unique
    }
}

/// One step needed to turn the actual model into the expected one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelChange {
    CreateDatabase { name: String },
    CreateSchema { name: String },
    CreateTable(TableNode),
    DropTable(TableNode),
    CreateColumn(ColumnNode),
    AlterColumn { from: ColumnNode, to: ColumnNode },
    DropColumn(ColumnNode),
    CreateView(ViewNode),
    DropView(ViewNode),
    CreateIndex(IndexNode),
    DropIndex(IndexNode),
}

impl fmt::Display for ModelChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDatabase { name } => write!(f, "create database {name}"),
            Self::CreateSchema { name } => write!(f, "create schema {name}"),
            Self::CreateTable(t) => write!(f, "create table {}.{}", t.schema, t.name),
            Self::DropTable(t) => write!(f, "drop table {}.{}", t.schema, t.name),
            Self::CreateColumn(c) => write!(f, "create column {}.{}.{}", c.schema, c.table, c.name),
            Self::AlterColumn { to, .. } => {
                write!(f, "alter column {}.{}.{}", to.schema, to.table, to.name)
            }
            Self::DropColumn(c) => write!(f, "drop column {}.{}.{}", c.schema, c.table, c.name),
            Self::CreateView(v) => write!(f, "create view {}.{}", v.schema, v.name),
            Self::DropView(v) => write!(f, "drop view {}.{}", v.schema, v.name),
            Self::CreateIndex(i) => write!(f, "create index {}.{}", i.schema, i.name),
            Self::DropIndex(i) => write!(f, "drop index {}.{}", i.schema, i.name),
        }
    }
}

/// Error type for model comparison.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("cannot compare database `{actual}` with database `{expected}`")]
    IncompatibleDatabases { actual: String, expected: String },
    #[error("database `{name}` exists but is not expected; dropping a database is not supported")]
    DatabaseDropRejected { name: String },
    #[error("schema `{name}` exists but is not expected; dropping a schema is not supported")]
    SchemaDropRejected { name: String },
    #[error("neither an actual nor an expected model was given")]
    NothingToCompare,
}

/// Computes the changes turning `actual` into `expected`.
pub trait ModelComparator {
    /// # Errors
    ///
    /// See [`ModelError`].
    fn extract_diff(
        &self,
        actual: Option<&DatabaseNode>,
        expected: Option<&DatabaseNode>,
    ) -> Result<Vec<ModelChange>, ModelError>;
}

/// Orders changes so that each one only depends on changes before it.
pub trait ModelChangesSorter {
    fn sort(&self, changes: Vec<ModelChange>) -> Vec<ModelChange>;
}

/// Reads the model currently present in storage.
pub trait DatabaseModelBuilder: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// `None` when the database does not exist yet.
    fn build_model(
        &self,
    ) -> impl Future<Output = Result<Option<DatabaseNode>, Self::Error>> + Send + '_;
}

/// Applies model changes to storage.
pub trait ModelChangeExecutor: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn apply<'a>(
        &'a self,
        changes: &'a [ModelChange],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// How a node from one list pairs with the other list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joined<'a, N> {
    ActualOnly(&'a N),
    Both(&'a N, &'a N),
    ExpectedOnly(&'a N),
}

/// Pair nodes by identity.
///
/// Actual nodes come first in their original order (paired or not), followed
/// by expected-only nodes in expected order.
pub fn full_outer_join<'a, N: ModelNode>(actual: &'a [N], expected: &'a [N]) -> Vec<Joined<'a, N>> {
    let expected_by_identity: HashMap<String, &N> =
        expected.iter().map(|node| (node.identity(), node)).collect();
    let mut paired = std::collections::HashSet::new();
    let mut joined = Vec::with_capacity(actual.len().max(expected.len()));

    for node in actual {
        let identity = node.identity();
        match expected_by_identity.get(&identity) {
            Some(counterpart) => {
                joined.push(Joined::Both(node, *counterpart));
                paired.insert(identity);
            }
            None => joined.push(Joined::ActualOnly(node)),
        }
    }
    joined.extend(
        expected
            .iter()
            .filter(|node| !paired.contains(&node.identity()))
            .map(Joined::ExpectedOnly),
    );
    joined
}
