use thiserror::Error;

use super::{
    DatabaseModelBuilder, DatabaseNode, ModelChange, ModelChangeExecutor, ModelChangesSorter,
    ModelComparator, ModelError,
};

/// Error type for [`migrate`].
#[derive(Debug, Error)]
pub enum MigrationError<ReadError, ExecuteError>
where
    ReadError: std::error::Error + 'static,
    ExecuteError: std::error::Error + 'static,
{
    #[error("failed to read the current model: {0}")]
    Read(#[source] ReadError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("failed to apply model changes: {0}")]
    Execute(#[source] ExecuteError),
}

/// Bring storage in line with `expected`.
///
/// Reads the current model, diffs it against `expected`, orders the changes
/// and applies them. Returns the applied changes in execution order; nothing
/// is executed when the models already match.
///
/// # Errors
///
/// Fails if reading, comparing or applying fails.
#[tracing::instrument(skip_all, fields(database = %expected.name))]
pub async fn migrate<R, C, S, X>(
    reader: &R,
    expected: &DatabaseNode,
    comparator: &C,
    sorter: &S,
    executor: &X,
) -> Result<Vec<ModelChange>, MigrationError<R::Error, X::Error>>
where
    R: DatabaseModelBuilder,
    C: ModelComparator + Sync,
    S: ModelChangesSorter + Sync,
    X: ModelChangeExecutor,
{
    let actual = reader.build_model().await.map_err(MigrationError::Read)?;
    let changes = sorter.sort(comparator.extract_diff(actual.as_ref(), Some(expected))?);
    if changes.is_empty() {
        tracing::debug!("model is up to date");
        return Ok(changes);
    }
    for change in &changes {
        tracing::debug!(%change, "applying model change");
    }
    executor
        .apply(&changes)
        .await
        .map_err(MigrationError::Execute)?;
    tracing::info!(changes = changes.len(), "model migrated");
    Ok(changes)
}
