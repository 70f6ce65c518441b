//! Reading the live model from the `PostgreSQL` catalog.

use keystone_core::model::{
    ColumnNode, DatabaseModelBuilder, DatabaseNode, IndexNode, SchemaNode, TableNode, ViewNode,
};
use sqlx::PgPool;

use crate::Error;

/// A [`DatabaseModelBuilder`] over `information_schema` and `pg_catalog`.
///
/// Only schemas on the allow-list are read; `PostgreSQL` always has schemas
/// such as `public` or `pg_toast` that an application never declares.
///
/// The pool must be connected to the database being described; the database
/// name is only used to report whether it exists.
///
/// `PostgreSQL` stores view definitions in its own deparsed form. When the
/// reader knows the declared views (see [`for_model`](Self::for_model)), a
/// stored definition equal to the server's rendering of the declared query is
/// reported as the declared query itself.
#[derive(Clone, Debug)]
pub struct CatalogReader {
    pool: PgPool,
    database: String,
    schemas: Vec<String>,
    declared_views: Vec<ViewNode>,
}

impl CatalogReader {
    #[must_use]
    pub fn new<S: Into<String>>(
        pool: PgPool,
        database: impl Into<String>,
        schemas: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            pool,
            database: database.into(),
            schemas: schemas.into_iter().map(Into::into).collect(),
            declared_views: Vec::new(),
        }
    }

    /// Reader covering every schema of an expected model, and aware of its
    /// declared views.
    #[must_use]
    pub fn for_model(pool: PgPool, expected: &DatabaseNode) -> Self {
        Self {
            declared_views: expected
                .schemas
                .iter()
                .flat_map(|schema| schema.views.iter().cloned())
                .collect(),
            ..Self::new(
                pool,
                expected.name.clone(),
                expected.schemas.iter().map(|schema| schema.name.clone()),
            )
        }
    }

    /// The server's rendering of `query` as a view definition.
    ///
    /// Returns `None` when the server rejects the query, e.g. because a
    /// referenced table does not exist yet.
    async fn rendered_definition(&self, query: &str) -> Result<Option<String>, Error> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("CREATE TEMPORARY VIEW keystone_declared_view AS {query}");
        let created = sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&sql)).await;
        match created {
            Ok(_) => {}
            Err(sqlx::Error::Database(error)) => {
                tracing::debug!(%error, "declared view query rejected");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }
        let definition: String = sqlx::query_scalar(
            "SELECT pg_get_viewdef('pg_temp.keystone_declared_view'::regclass)",
        )
        .fetch_one(&mut *tx)
        .await?;
        tx.rollback().await?;
        Ok(Some(normalize_definition(&definition)))
    }

    /// Swap stored definitions for declared queries the server renders
    /// identically.
    async fn match_declared_views(&self, database: &mut DatabaseNode) -> Result<(), Error> {
        for schema in &mut database.schemas {
            for view in &mut schema.views {
                let Some(declared) = self.declared_views.iter().find(|declared| {
                    declared.schema.eq_ignore_ascii_case(&view.schema)
                        && declared.name.eq_ignore_ascii_case(&view.name)
                }) else {
                    continue;
                };
                if declared.query == view.query {
                    continue;
                }
                if self.rendered_definition(&declared.query).await?.as_deref()
                    == Some(view.query.as_str())
                {
                    tracing::trace!(view = %view.name, "stored view matches declared query");
                    view.query.clone_from(&declared.query);
                }
            }
        }
        Ok(())
    }

    async fn database_exists(&self) -> Result<bool, Error> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
        )
        .bind(&self.database)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn read(&self) -> Result<DatabaseNode, Error> {
        let schemas: Vec<String> = sqlx::query_scalar(
            "SELECT nspname::text FROM pg_namespace WHERE nspname::text = ANY($1) \
             ORDER BY array_position($1, nspname::text)",
        )
        .bind(&self.schemas)
        .fetch_all(&self.pool)
        .await?;
        let mut database = DatabaseNode {
            name: self.database.clone(),
            schemas: schemas.into_iter().map(SchemaNode::new).collect(),
        };

        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_schema::text, table_name::text FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' AND table_schema::text = ANY($1) \
             ORDER BY table_schema, table_name",
        )
        .bind(&self.schemas)
        .fetch_all(&self.pool)
        .await?;
        for (schema, table) in tables {
            if let Some(node) = schema_mut(&mut database, &schema) {
                node.tables.push(TableNode::new(schema, table));
            }
        }

        let columns: Vec<(String, String, String, String, bool)> = sqlx::query_as(
            "SELECT table_schema::text, table_name::text, column_name::text, data_type::text, \
             is_nullable = 'YES' FROM information_schema.columns WHERE table_schema::text = ANY($1) \
             ORDER BY table_schema, table_name, ordinal_position",
        )
        .bind(&self.schemas)
        .fetch_all(&self.pool)
        .await?;
        for (schema, table, column, data_type, nullable) in columns {
            // View columns are listed too; only tables carry columns.
            if let Some(node) = table_mut(&mut database, &schema, &table) {
                node.columns.push(ColumnNode {
                    schema,
                    table,
                    name: column,
                    data_type,
                    nullable,
                });
            }
        }

        let keys: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT n.nspname::text, c.relname::text, a.attname::text FROM pg_index i \
             JOIN pg_class c ON c.oid = i.indrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = i.indkey[0] \
             WHERE i.indisprimary AND n.nspname::text = ANY($1)",
        )
        .bind(&self.schemas)
        .fetch_all(&self.pool)
        .await?;
        for (schema, table, column) in keys {
            if let Some(node) = table_mut(&mut database, &schema, &table) {
                node.key = Some(column);
            }
        }

        let views: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT schemaname::text, viewname::text, definition FROM pg_views \
             WHERE schemaname::text = ANY($1) ORDER BY schemaname, viewname",
        )
        .bind(&self.schemas)
        .fetch_all(&self.pool)
        .await?;
        for (schema, name, definition) in views {
            if let Some(node) = schema_mut(&mut database, &schema) {
                node.views
                    .push(ViewNode::new(schema, name, normalize_definition(&definition)));
            }
        }

        let indexes: Vec<(String, String, String, bool, Vec<String>)> = sqlx::query_as(
            "SELECT n.nspname::text, t.relname::text, ic.relname::text, i.indisunique, \
             array_agg(a.attname::text ORDER BY k.ord) \
             FROM pg_index i \
             JOIN pg_class ic ON ic.oid = i.indexrelid \
             JOIN pg_class t ON t.oid = i.indrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
             WHERE NOT i.indisprimary AND n.nspname::text = ANY($1) \
             GROUP BY n.nspname, t.relname, ic.relname, i.indisunique \
             ORDER BY 1, 2, 3",
        )
        .bind(&self.schemas)
        .fetch_all(&self.pool)
        .await?;
        for (schema, table, name, unique, columns) in indexes {
            if let Some(node) = schema_mut(&mut database, &schema) {
                node.indexes.push(IndexNode {
                    schema,
                    table,
                    name,
                    columns,
                    unique,
                });
            }
        }

        self.match_declared_views(&mut database).await?;
        Ok(database)
    }
}

fn normalize_definition(definition: &str) -> String {
    definition.trim().trim_end_matches(';').trim().to_owned()
}

fn schema_mut<'a>(database: &'a mut DatabaseNode, name: &str) -> Option<&'a mut SchemaNode> {
    database.schemas.iter_mut().find(|schema| schema.name == name)
}

fn table_mut<'a>(database: &'a mut DatabaseNode, schema: &str, table: &str) -> Option<&'a mut TableNode> {
    schema_mut(database, schema)?
        .tables
        .iter_mut()
        .find(|node| node.name == table)
}

impl DatabaseModelBuilder for CatalogReader {
    type Error = Error;

    #[tracing::instrument(skip(self), fields(database = %self.database))]
    async fn build_model(&self) -> Result<Option<DatabaseNode>, Error> {
        if !self.database_exists().await? {
            tracing::debug!("database does not exist");
            return Ok(None);
        }
        let model = self.read().await?;
        tracing::debug!(schemas = model.schemas.len(), "catalog read");
        Ok(Some(model))
    }
}
