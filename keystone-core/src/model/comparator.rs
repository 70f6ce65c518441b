use super::{
    ColumnNode, DatabaseNode, IndexNode, Joined, ModelChange, ModelComparator, ModelError,
    ModelNode, SchemaNode, TableNode, ViewNode, full_outer_join,
};

/// Level-by-level structural comparison of two model trees.
///
/// Drops are only emitted below the schema level: a database or schema that
/// exists but is not expected is an error rather than a drop.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralComparator;

impl ModelComparator for StructuralComparator {
    #[tracing::instrument(skip_all)]
    fn extract_diff(
        &self,
        actual: Option<&DatabaseNode>,
        expected: Option<&DatabaseNode>,
    ) -> Result<Vec<ModelChange>, ModelError> {
        let mut changes = Vec::new();
        match (actual, expected) {
            (Some(actual), Some(expected)) => {
                if actual.identity() != expected.identity() {
                    return Err(ModelError::IncompatibleDatabases {
                        actual: actual.name.clone(),
                        expected: expected.name.clone(),
                    });
                }
                diff_schemas(&actual.schemas, &expected.schemas, &mut changes)?;
            }
            (Some(actual), None) => {
                return Err(ModelError::DatabaseDropRejected {
                    name: actual.name.clone(),
                });
            }
            (None, Some(expected)) => {
                changes.push(ModelChange::CreateDatabase {
                    name: expected.name.clone(),
                });
                for schema in &expected.schemas {
                    create_schema(schema, &mut changes);
                }
            }
            (None, None) => return Err(ModelError::NothingToCompare),
        }
        tracing::debug!(changes = changes.len(), "model diff extracted");
        Ok(changes)
    }
}

fn diff_schemas(
    actual: &[SchemaNode],
    expected: &[SchemaNode],
    changes: &mut Vec<ModelChange>,
) -> Result<(), ModelError> {
    for joined in full_outer_join(actual, expected) {
        match joined {
            Joined::ActualOnly(schema) => {
                return Err(ModelError::SchemaDropRejected {
                    name: schema.name.clone(),
                });
            }
            Joined::Both(actual, expected) => {
                diff_tables(&actual.tables, &expected.tables, changes);
                diff_views(&actual.views, &expected.views, changes);
                diff_indexes(&actual.indexes, &expected.indexes, changes);
            }
            Joined::ExpectedOnly(schema) => create_schema(schema, changes),
        }
    }
    Ok(())
}

fn create_schema(schema: &SchemaNode, changes: &mut Vec<ModelChange>) {
    changes.push(ModelChange::CreateSchema {
        name: schema.name.clone(),
    });
    for table in &schema.tables {
        create_table(table, changes);
    }
    changes.extend(schema.views.iter().cloned().map(ModelChange::CreateView));
    changes.extend(schema.indexes.iter().cloned().map(ModelChange::CreateIndex));
}

fn create_table(table: &TableNode, changes: &mut Vec<ModelChange>) {
    changes.push(ModelChange::CreateTable(table.clone()));
    changes.extend(table.columns.iter().cloned().map(ModelChange::CreateColumn));
}

fn diff_tables(actual: &[TableNode], expected: &[TableNode], changes: &mut Vec<ModelChange>) {
    for joined in full_outer_join(actual, expected) {
        match joined {
            Joined::ActualOnly(table) => changes.push(ModelChange::DropTable(table.clone())),
            Joined::Both(actual, expected) => diff_columns(&actual.columns, &expected.columns, changes),
            Joined::ExpectedOnly(table) => create_table(table, changes),
        }
    }
}

fn diff_columns(actual: &[ColumnNode], expected: &[ColumnNode], changes: &mut Vec<ModelChange>) {
    for joined in full_outer_join(actual, expected) {
        match joined {
            Joined::ActualOnly(column) => changes.push(ModelChange::DropColumn(column.clone())),
            Joined::Both(actual, expected) if !actual.equivalent(expected) => {
                changes.push(ModelChange::AlterColumn {
                    from: actual.clone(),
                    to: expected.clone(),
                });
            }
            Joined::Both(..) => {}
            Joined::ExpectedOnly(column) => changes.push(ModelChange::CreateColumn(column.clone())),
        }
    }
}

fn diff_views(actual: &[ViewNode], expected: &[ViewNode], changes: &mut Vec<ModelChange>) {
    for joined in full_outer_join(actual, expected) {
        match joined {
            Joined::ActualOnly(view) => changes.push(ModelChange::DropView(view.clone())),
            Joined::Both(actual, expected) if !actual.equivalent(expected) => {
                changes.push(ModelChange::DropView(actual.clone()));
                changes.push(ModelChange::CreateView(expected.clone()));
            }
            Joined::Both(..) => {}
            Joined::ExpectedOnly(view) => changes.push(ModelChange::CreateView(view.clone())),
        }
    }
}

fn diff_indexes(actual: &[IndexNode], expected: &[IndexNode], changes: &mut Vec<ModelChange>) {
    for joined in full_outer_join(actual, expected) {
        match joined {
            Joined::ActualOnly(index) => changes.push(ModelChange::DropIndex(index.clone())),
            Joined::Both(actual, expected) if !actual.equivalent(expected) => {
                changes.push(ModelChange::DropIndex(actual.clone()));
                changes.push(ModelChange::CreateIndex(expected.clone()));
            }
            Joined::Both(..) => {}
            Joined::ExpectedOnly(index) => changes.push(ModelChange::CreateIndex(index.clone())),
        }
    }
}
