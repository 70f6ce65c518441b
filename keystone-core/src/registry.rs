//! Explicit registration of entity types.
//!
//! The [`EntityRegistry`] is the application's declaration of what storage
//! should look like. It validates entity metadata at startup and produces the
//! expected [`DatabaseNode`] for the model comparator.

use thiserror::Error;

use crate::{
    entity::{Entity, EntityInfo},
    model::{DatabaseNode, IndexNode, ModelNode, SchemaNode, TableNode, ViewNode},
};

/// Error type for registry validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("`{first}` and `{second}` both map to table `{table}`")]
    DuplicateTable {
        table: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("`{entity}` declares key column `{column}` but has no such column")]
    MissingKeyColumn {
        entity: &'static str,
        column: &'static str,
    },
    #[error("`{entity}` declares version column `{column}` but has no such column")]
    MissingVersionColumn {
        entity: &'static str,
        column: &'static str,
    },
    #[error("`{entity}` declares an index without columns")]
    EmptyIndex { entity: &'static str },
    #[error("`{entity}` declares an index on unknown column `{column}`")]
    UnknownIndexColumn { entity: &'static str, column: String },
    #[error("view `{view}` is registered twice")]
    DuplicateView { view: String },
}

/// Set of entity types and views making up one database.
///
/// ```ignore
/// let registry = EntityRegistry::new("app")
///     .register::<Blog>()
///     .register::<User>()
///     .view("blog", "recent", "SELECT * FROM blog.blogs ORDER BY id DESC LIMIT 10");
/// registry.validate()?;
/// let expected = registry.model()?;
/// ```
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    database: String,
    entities: Vec<&'static EntityInfo>,
    views: Vec<ViewNode>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            entities: Vec::new(),
            views: Vec::new(),
        }
    }

    /// Register an entity type. Registering the same type twice is a no-op.
    #[must_use]
    pub fn register<T: Entity>(mut self) -> Self {
        let info = T::info();
        if !self.entities.iter().any(|known| std::ptr::eq(*known, info)) {
            tracing::trace!(entity = info.name, table = %info.qualified_name(), "entity registered");
            self.entities.push(info);
        }
        self
    }

    #[must_use]
    pub fn view(mut self, schema: &str, name: &str, query: &str) -> Self {
        self.views.push(ViewNode::new(schema, name, query));
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn entities(&self) -> &[&'static EntityInfo] {
        &self.entities
    }

    /// Check the registered metadata for inconsistencies.
    ///
    /// # Errors
    ///
    /// Returns the first problem found; see [`RegistryError`].
    pub fn validate(&self) -> Result<(), RegistryError> {
        for (position, info) in self.entities.iter().enumerate() {
            if info.column(info.key).is_none() {
                return Err(RegistryError::MissingKeyColumn {
                    entity: info.name,
                    column: info.key,
                });
            }
            if info.column(info.version).is_none() {
                return Err(RegistryError::MissingVersionColumn {
                    entity: info.name,
                    column: info.version,
                });
            }
            for index in info.indexes {
                if index.columns.is_empty() {
                    return Err(RegistryError::EmptyIndex { entity: info.name });
                }
                if let Some(column) = index.columns.iter().find(|c| info.column(c).is_none()) {
                    return Err(RegistryError::UnknownIndexColumn {
                        entity: info.name,
                        column: (*column).to_owned(),
                    });
                }
            }
            let table = info.qualified_name();
            if let Some(first) = self.entities[..position]
                .iter()
                .find(|other| other.qualified_name().eq_ignore_ascii_case(&table))
            {
                return Err(RegistryError::DuplicateTable {
                    table,
                    first: first.name,
                    second: info.name,
                });
            }
        }
        for (position, view) in self.views.iter().enumerate() {
            if self.views[..position]
                .iter()
                .any(|other| other.identity() == view.identity())
            {
                return Err(RegistryError::DuplicateView {
                    view: format!("{}.{}", view.schema, view.name),
                });
            }
        }
        Ok(())
    }

    /// Expected model of the registered entities and views.
    ///
    /// Schemas appear in order of first registration.
    ///
    /// # Errors
    ///
    /// Fails if [`validate`](Self::validate) does.
    pub fn model(&self) -> Result<DatabaseNode, RegistryError> {
        self.validate()?;
        let mut database = DatabaseNode::new(self.database.clone());
        for info in &self.entities {
            let schema = schema_mut(&mut database, info.schema);
            schema.tables.push(table_node(info));
            schema
                .indexes
                .extend(info.indexes.iter().map(|index| {
                    let columns: Vec<String> = index.columns.iter().map(|c| (*c).to_owned()).collect();
                    IndexNode {
                        schema: info.schema.to_owned(),
                        table: info.table.to_owned(),
                        name: IndexNode::default_name(info.table, &columns, index.unique),
                        columns,
                        unique: index.unique,
                    }
                }));
        }
        for view in &self.views {
            schema_mut(&mut database, &view.schema).views.push(view.clone());
        }
        Ok(database)
    }
}

fn schema_mut<'a>(database: &'a mut DatabaseNode, name: &str) -> &'a mut SchemaNode {
    let position = match database
        .schemas
        .iter()
        .position(|schema| schema.name.eq_ignore_ascii_case(name))
    {
        Some(position) => position,
        None => {
            database.schemas.push(SchemaNode::new(name));
            database.schemas.len() - 1
        }
    };
    &mut database.schemas[position]
}

fn table_node(info: &EntityInfo) -> TableNode {
    let table = TableNode::new(info.schema, info.table).with_key(info.key);
    info.columns.iter().fold(table, |table, column| {
        table.with_column(column.name, column.data_type, column.nullable)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{
        ColumnInfo,
        fixtures::{Blog, User},
    };

    #[test]
    fn model_groups_tables_by_schema() {
        let registry = EntityRegistry::new("app")
            .register::<Blog>()
            .register::<User>()
            .register::<Blog>()
            .view("blog", "titles", "SELECT title FROM blog.blogs");
        assert_eq!(registry.entities().len(), 2);

        let model = registry.model().unwrap();
        assert_eq!(model.name, "app");
        let names: Vec<&str> = model.schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["blog", "auth"]);

        let blog = model.schema("blog").unwrap();
        let blogs = blog.table("blogs").unwrap();
        assert_eq!(blogs.key.as_deref(), Some("id"));
        assert_eq!(blogs.columns.len(), 3);
        assert_eq!(blogs.column("title").map(|c| c.data_type.as_str()), Some("text"));
        assert_eq!(blog.indexes.len(), 1);
        assert_eq!(blog.indexes[0].name, "ix_blogs_title");
        assert_eq!(blog.views.len(), 1);
    }

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Broken {
        id: i64,
    }

    impl Entity for Broken {
        type Key = i64;

        fn info() -> &'static EntityInfo {
            static INFO: EntityInfo = EntityInfo {
                name: "Broken",
                schema: "blog",
                table: "Blogs",
                key: "id",
                version: "version",
                columns: &[ColumnInfo {
                    name: "id",
                    data_type: "bigint",
                    nullable: false,
                }],
                indexes: &[],
            };
            &INFO
        }

        fn key(&self) -> i64 {
            self.id
        }

        fn version(&self) -> i64 {
            0
        }

        fn set_version(&mut self, _version: i64) {}
    }

    #[test]
    fn validate_reports_missing_version_column() {
        let err = EntityRegistry::new("app").register::<Broken>().validate().unwrap_err();
        assert_eq!(
            err,
            RegistryError::MissingVersionColumn {
                entity: "Broken",
                column: "version"
            }
        );
    }

    #[test]
    fn validate_reports_duplicate_views() {
        let err = EntityRegistry::new("app")
            .view("s", "v", "SELECT 1")
            .view("S", "V", "SELECT 2")
            .validate()
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateView { .. }));
    }
}
