//! Applying model changes as `PostgreSQL` DDL.

use std::collections::HashSet;

use keystone_core::model::{ColumnNode, ModelChange, ModelChangeExecutor, ModelNode};
use sqlx::PgPool;

use crate::{
    Error,
    sql::{qualified, quote},
};

/// A [`ModelChangeExecutor`] issuing DDL.
///
/// Everything except `CREATE DATABASE` runs in one transaction, so a failed
/// batch leaves the schema untouched. `CREATE DATABASE` cannot run inside a
/// transaction and is issued first, on the admin pool when one is set.
#[derive(Clone, Debug)]
pub struct Executor {
    pool: PgPool,
    admin: Option<PgPool>,
}

impl Executor {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool, admin: None }
    }

    /// Pool used for `CREATE DATABASE`, typically connected to `postgres`.
    #[must_use]
    pub fn with_admin_pool(mut self, admin: PgPool) -> Self {
        self.admin = Some(admin);
        self
    }
}

fn column_definition(column: &ColumnNode) -> String {
    let null = if column.nullable { "" } else { " NOT NULL" };
    format!("{} {}{null}", quote(&column.name), column.data_type)
}

fn alter_column(from: &ColumnNode, to: &ColumnNode) -> Option<String> {
    let column = quote(&to.name);
    let mut actions = Vec::new();
    if !from.data_type.eq_ignore_ascii_case(&to.data_type) {
        actions.push(format!(
            "ALTER COLUMN {column} TYPE {ty} USING {column}::{ty}",
            ty = to.data_type
        ));
    }
    if from.nullable != to.nullable {
        let verb = if to.nullable { "DROP" } else { "SET" };
        actions.push(format!("ALTER COLUMN {column} {verb} NOT NULL"));
    }
    if actions.is_empty() {
        return None;
    }
    Some(format!(
        "ALTER TABLE {} {}",
        qualified(&to.schema, &to.table),
        actions.join(", ")
    ))
}

/// DDL for one change. `created` holds the identities of tables created in
/// the same batch, whose columns are already part of `CREATE TABLE`.
pub(crate) fn statement(change: &ModelChange, created: &HashSet<String>) -> Option<String> {
    let sql = match change {
        ModelChange::CreateDatabase { .. } => return None,
        ModelChange::CreateSchema { name } => format!("CREATE SCHEMA IF NOT EXISTS {}", quote(name)),
        ModelChange::CreateTable(table) => {
            let mut definitions: Vec<String> = table.columns.iter().map(column_definition).collect();
            if let Some(key) = &table.key {
                definitions.push(format!("PRIMARY KEY ({})", quote(key)));
            }
            format!(
                "CREATE TABLE {} ({})",
                qualified(&table.schema, &table.name),
                definitions.join(", ")
            )
        }
        ModelChange::DropTable(table) => format!("DROP TABLE {}", qualified(&table.schema, &table.name)),
        ModelChange::CreateColumn(column) => {
            let table = format!("{}.{}", column.schema, column.table).to_ascii_lowercase();
            if created.contains(&table) {
                return None;
            }
            format!(
                "ALTER TABLE {} ADD COLUMN {}",
                qualified(&column.schema, &column.table),
                column_definition(column)
            )
        }
        ModelChange::AlterColumn { from, to } => return alter_column(from, to),
        ModelChange::DropColumn(column) => format!(
            "ALTER TABLE {} DROP COLUMN {}",
            qualified(&column.schema, &column.table),
            quote(&column.name)
        ),
        ModelChange::CreateView(view) => {
            format!("CREATE VIEW {} AS {}", qualified(&view.schema, &view.name), view.query)
        }
        ModelChange::DropView(view) => format!("DROP VIEW {}", qualified(&view.schema, &view.name)),
        ModelChange::CreateIndex(index) => {
            let unique = if index.unique { "UNIQUE " } else { "" };
            let columns: Vec<String> = index.columns.iter().map(|c| quote(c)).collect();
            format!(
                "CREATE {unique}INDEX {} ON {} ({})",
                quote(&index.name),
                qualified(&index.schema, &index.table),
                columns.join(", ")
            )
        }
        ModelChange::DropIndex(index) => format!("DROP INDEX {}", qualified(&index.schema, &index.name)),
    };
    Some(sql)
}

impl ModelChangeExecutor for Executor {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(changes = changes.len()))]
    async fn apply<'a>(&'a self, changes: &'a [ModelChange]) -> Result<(), Error> {
        for change in changes {
            if let ModelChange::CreateDatabase { name } = change {
                let pool = self.admin.as_ref().unwrap_or(&self.pool);
                let sql = format!("CREATE DATABASE {}", quote(name));
                tracing::debug!(%sql, "executing");
                sqlx::raw_sql(&sql).execute(pool).await?;
            }
        }

        let created: HashSet<String> = changes
            .iter()
            .filter_map(|change| match change {
                ModelChange::CreateTable(table) => Some(table.identity()),
                _ => None,
            })
            .collect();

        let mut tx = self.pool.begin().await?;
        for change in changes {
            if let Some(sql) = statement(change, &created) {
                tracing::debug!(%sql, "executing");
                sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&sql)).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
