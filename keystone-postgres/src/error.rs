/// Error type for `PostgreSQL` gateway, catalog and DDL operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The connection was closed by its owner or the pool shut down.
    #[error("connection is closed")]
    Closed,
    /// `begin` was called while a physical transaction was already open.
    #[error("a physical transaction is already open on this connection")]
    TransactionOpen,
    /// `commit` or `rollback` was called without an open physical transaction.
    #[error("no physical transaction is open on this connection")]
    NoTransaction,
    /// A row came back as something other than a JSON object.
    #[error("expected a JSON object row from `{table}`, got {found}")]
    InvalidRow { table: String, found: String },
}

/// Whether `error` means the underlying connection can no longer be used.
pub(crate) const fn is_fatal(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
    )
}
