//! Unit-of-work transactions with optimistic concurrency.
//!
//! [`DatabaseTransaction`] collects [`Change`]s, mirrors each one in its
//! [`TransactionalStore`] straight away, and replays them against physical
//! storage in collection order when it is closed with `commit = true`.
//!
//! Reads go through the physical connection inside an open physical
//! transaction, then through the store, so pending writes are visible to the
//! transaction that made them before anything has been written.
//!
//! # Lifecycle
//!
//! ```text
//! Unopened --open / first read--> Open --close(commit)--> Unopened
//! ```
//!
//! A transaction is reusable after `close`. A failed commit clears all
//! transient state and invalidates the instance; only `close(false)` and drop
//! are allowed afterwards.

use thiserror::Error;

use crate::{
    change::{Change, ChangeError},
    concurrency::ConcurrencyConflict,
    gateway::{Connection, ConnectionState, Gateway, Query},
    settings::TransactionSettings,
    store::TransactionalStore,
};

mod operations;

/// Error type for transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),
    #[error("a physical transaction is already open")]
    AlreadyOpened,
    #[error("transaction was invalidated by a failed commit; start a new one")]
    Invalidated,
    #[error("connection was still connecting after {attempts} attempt(s)")]
    Unavailable { attempts: u32 },
    #[error("connection settled in unusable state {state:?}")]
    Unusable { state: ConnectionState },
    #[error("change rejected: {0}")]
    Change(#[from] ChangeError),
    #[error("`{entity}` with key {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("failed to decode `{entity}` row: {source}")]
    Decode {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage error: {0}")]
    Storage(#[source] StoreError),
}

type Result<T, G> = std::result::Result<T, TransactionError<<G as Gateway>::Error>>;

/// A logical transaction over a [`Gateway`].
///
/// All operations take `&mut self`: one logical flow at a time.
pub struct DatabaseTransaction<G: Gateway> {
    gateway: G,
    settings: TransactionSettings,
    connection: Option<G::Connection>,
    changes: Vec<Box<dyn Change>>,
    queries: Vec<Query>,
    store: TransactionalStore,
    version: Option<i64>,
    invalidated: bool,
}

impl<G: Gateway> DatabaseTransaction<G> {
    pub fn new(gateway: G) -> Self {
        Self::with_settings(gateway, TransactionSettings::default())
    }

    pub fn with_settings(gateway: G, settings: TransactionSettings) -> Self {
        Self {
            gateway,
            settings,
            connection: None,
            changes: Vec::new(),
            queries: Vec::new(),
            store: TransactionalStore::new(),
            version: None,
            invalidated: false,
        }
    }

    pub const fn gateway(&self) -> &G {
        &self.gateway
    }

    pub const fn settings(&self) -> &TransactionSettings {
        &self.settings
    }

    /// Whether a physical transaction is currently open.
    pub fn is_open(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(Connection::in_transaction)
    }

    pub const fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Changes collected since the last close, in collection order.
    pub fn pending_changes(&self) -> &[Box<dyn Change>] {
        &self.changes
    }

    /// Read queries issued since the last close.
    pub fn executed_queries(&self) -> &[Query] {
        &self.queries
    }

    pub const fn transactional_store(&self) -> &TransactionalStore {
        &self.store
    }

    const fn ensure_valid(&self) -> Result<(), G> {
        if self.invalidated {
            Err(TransactionError::Invalidated)
        } else {
            Ok(())
        }
    }

    /// Current physical connection, establishing one if needed.
    ///
    /// A cached connection that is still connecting is polled according to
    /// the [`TransactionSettings`]; one that is closed or broken is dropped
    /// and replaced.
    ///
    /// # Errors
    ///
    /// Fails if the gateway cannot connect or a new connection never leaves
    /// the connecting state.
    pub async fn connection(&mut self) -> Result<&mut G::Connection, G> {
        let cached = match self.connection.take() {
            Some(connection) => settle::<_, G::Error>(connection, self.settings)
                .await
                .ok(),
            None => None,
        };
        let connection = match cached {
            Some(connection) => connection,
            None => {
                let connection = self
                    .gateway
                    .connect()
                    .await
                    .map_err(TransactionError::Storage)?;
                tracing::debug!("physical connection established");
                settle::<_, G::Error>(connection, self.settings).await?
            }
        };
        Ok(self.connection.insert(connection))
    }

    /// Connection with an open physical transaction, beginning one if needed.
    async fn physical(&mut self) -> Result<&mut G::Connection, G> {
        let connection = self.connection().await?;
        if !connection.in_transaction() {
            connection.begin().await.map_err(TransactionError::Storage)?;
            tracing::debug!("physical transaction opened");
        }
        Ok(connection)
    }

    /// Begin a physical transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::AlreadyOpened`] if one is already open.
    #[tracing::instrument(skip(self))]
    pub async fn open(&mut self) -> Result<(), G> {
        self.ensure_valid()?;
        let connection = self.connection().await?;
        if connection.in_transaction() {
            return Err(TransactionError::AlreadyOpened);
        }
        connection.begin().await.map_err(TransactionError::Storage)?;
        tracing::debug!("physical transaction opened");
        Ok(())
    }

    /// Apply a change to the transactional store and queue it for commit.
    ///
    /// # Errors
    ///
    /// Fails if the change cannot be mirrored in the store; nothing is queued
    /// in that case.
    pub fn collect_change(&mut self, change: Box<dyn Change>) -> Result<(), G> {
        self.ensure_valid()?;
        change.apply_to_store(&self.store)?;
        tracing::trace!(
            entity = change.entity().name,
            kind = change.command().kind(),
            pending = self.changes.len() + 1,
            "change collected"
        );
        self.changes.push(change);
        Ok(())
    }

    /// Version stamp of this logical transaction.
    ///
    /// Fetched from storage on first use and cached until the transaction is
    /// closed.
    ///
    /// # Errors
    ///
    /// Fails if storage cannot produce a version.
    pub async fn version(&mut self) -> Result<i64, G> {
        self.ensure_valid()?;
        if let Some(version) = self.version {
            return Ok(version);
        }
        let version = self
            .connection()
            .await?
            .version()
            .await
            .map_err(TransactionError::Storage)?;
        tracing::trace!(version, "transaction version fetched");
        self.version = Some(version);
        Ok(version)
    }

    /// End the logical transaction.
    ///
    /// With `commit = false` the physical transaction is rolled back and all
    /// transient state is discarded. With `commit = true` the collected
    /// changes are replayed, in order, inside a fresh physical transaction
    /// which is then committed. Closing an already closed transaction is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// A failed replay or commit leaves the transaction invalidated, with its
    /// transient state already cleared.
    #[tracing::instrument(skip(self), fields(changes = self.changes.len()))]
    pub async fn close(&mut self, commit: bool) -> Result<(), G> {
        if !commit {
            let result = self.rollback().await;
            self.clear();
            return result;
        }
        if let Err(error) = self.ensure_valid() {
            self.clear();
            return Err(error);
        }
        let changes = std::mem::take(&mut self.changes);
        self.clear();
        let result = self.replay(&changes).await;
        if let Err(error) = &result {
            self.connection = None;
            self.invalidated = true;
            tracing::debug!(%error, "commit failed; transaction invalidated");
        }
        result
    }

    async fn rollback(&mut self) -> Result<(), G> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        if !connection.in_transaction() {
            return Ok(());
        }
        let result = connection.rollback().await;
        if let Err(error) = result {
            self.connection = None;
            return Err(TransactionError::Storage(error));
        }
        tracing::debug!("physical transaction rolled back");
        Ok(())
    }

    async fn replay(&mut self, changes: &[Box<dyn Change>]) -> Result<(), G> {
        // Reads ran inside their own physical transaction; it is not reused.
        let stale = match self.connection.as_mut() {
            Some(connection) if connection.in_transaction() => connection.rollback().await.err(),
            _ => None,
        };
        if let Some(error) = stale {
            tracing::warn!(%error, "failed to roll back read transaction; reconnecting");
            self.connection = None;
        }
        if changes.is_empty() {
            tracing::debug!("nothing to commit");
            return Ok(());
        }

        let connection = self.physical().await?;
        for (index, change) in changes.iter().enumerate() {
            let affected = connection
                .execute(change.command())
                .await
                .map_err(TransactionError::Storage)?;
            change.verify(affected)?;
            tracing::trace!(
                index,
                affected,
                entity = change.entity().name,
                kind = change.command().kind(),
                "change replayed"
            );
        }
        connection.commit().await.map_err(TransactionError::Storage)?;
        tracing::debug!(changes = changes.len(), "transaction committed");
        Ok(())
    }

    fn clear(&mut self) {
        self.changes.clear();
        self.queries.clear();
        self.store.clear();
        self.version = None;
    }
}

impl<G: Gateway> Drop for DatabaseTransaction<G> {
    fn drop(&mut self) {
        if !self.changes.is_empty() {
            tracing::trace!(
                discarded = self.changes.len(),
                "transaction dropped with uncommitted changes"
            );
        }
        self.clear();
    }
}

/// Wait for a connection to leave the connecting state.
async fn settle<C, E>(
    connection: C,
    settings: TransactionSettings,
) -> std::result::Result<C, TransactionError<E>>
where
    C: Connection,
    E: std::error::Error + 'static,
{
    let mut attempts = 0;
    while connection.state() == ConnectionState::Connecting {
        if attempts >= settings.connect_attempts {
            tracing::warn!(attempts, "connection still connecting; giving up");
            return Err(TransactionError::Unavailable { attempts });
        }
        attempts += 1;
        tokio::time::sleep(settings.connect_retry_delay).await;
    }
    let state = connection.state();
    if state.is_usable() {
        Ok(connection)
    } else {
        tracing::debug!(?state, "discarding unusable connection");
        Err(TransactionError::Unusable { state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        change::CreateEntityChange,
        entity::{Entity, fixtures::Blog},
        gateway::{InsertBehavior, inmemory},
    };

    fn create(blog: Blog) -> Box<dyn Change> {
        Box::new(CreateEntityChange::new(vec![blog], InsertBehavior::Default).unwrap())
    }

    #[tokio::test]
    async fn open_twice_is_rejected() {
        let mut tx = DatabaseTransaction::new(inmemory::Database::new());
        tx.open().await.unwrap();
        assert!(tx.is_open());
        assert!(matches!(tx.open().await, Err(TransactionError::AlreadyOpened)));
    }

    #[tokio::test]
    async fn collected_changes_are_visible_before_commit() {
        let database = inmemory::Database::new();
        let mut tx = DatabaseTransaction::new(database.clone());
        tx.collect_change(create(Blog::new(1, "draft", 0))).unwrap();

        assert_eq!(tx.pending_changes().len(), 1);
        assert!(tx.transactional_store().try_get::<Blog>(&1).is_some());
        assert!(database.rows(Blog::info()).await.is_empty());
    }

    #[tokio::test]
    async fn rejected_change_is_not_queued() {
        let mut tx = DatabaseTransaction::new(inmemory::Database::new());
        tx.collect_change(create(Blog::new(1, "a", 0))).unwrap();
        let err = tx.collect_change(create(Blog::new(1, "b", 0))).unwrap_err();
        assert!(matches!(err, TransactionError::Change(ChangeError::DuplicateKey { .. })));
        assert_eq!(tx.pending_changes().len(), 1);
    }

    #[tokio::test]
    async fn commit_replays_and_clears_state() {
        let database = inmemory::Database::new();
        let mut tx = DatabaseTransaction::new(database.clone());
        tx.collect_change(create(Blog::new(1, "a", 0))).unwrap();
        tx.collect_change(create(Blog::new(2, "b", 0))).unwrap();

        tx.close(true).await.unwrap();

        assert_eq!(database.rows(Blog::info()).await.len(), 2);
        assert!(tx.pending_changes().is_empty());
        assert!(tx.transactional_store().is_empty());
        assert!(!tx.is_open());
    }

    #[tokio::test]
    async fn rollback_discards_changes() {
        let database = inmemory::Database::new();
        let mut tx = DatabaseTransaction::new(database.clone());
        tx.open().await.unwrap();
        tx.collect_change(create(Blog::new(1, "a", 0))).unwrap();

        tx.close(false).await.unwrap();
        tx.close(false).await.unwrap();

        assert!(database.rows(Blog::info()).await.is_empty());
        assert!(tx.transactional_store().is_empty());
        assert!(!tx.is_open());
    }

    #[tokio::test]
    async fn version_is_cached_until_close() {
        let mut tx = DatabaseTransaction::new(inmemory::Database::new());
        let first = tx.version().await.unwrap();
        assert_eq!(tx.version().await.unwrap(), first);

        tx.close(false).await.unwrap();
        assert!(tx.version().await.unwrap() > first);
    }

    #[tokio::test]
    async fn failed_commit_invalidates_transaction() {
        let database = inmemory::Database::new();
        let mut tx = DatabaseTransaction::new(database.clone());
        tx.collect_change(create(Blog::new(1, "a", 0))).unwrap();
        tx.close(true).await.unwrap();

        tx.collect_change(create(Blog::new(1, "again", 0))).unwrap();
        let err = tx.close(true).await.unwrap_err();
        assert!(matches!(err, TransactionError::Storage(_)));
        assert!(tx.is_invalidated());
        assert!(tx.transactional_store().is_empty());
        assert!(matches!(tx.open().await, Err(TransactionError::Invalidated)));
        assert!(tx.close(false).await.is_ok());
    }

    #[tokio::test]
    async fn reusable_after_commit() {
        let database = inmemory::Database::new();
        let mut tx = DatabaseTransaction::new(database.clone());
        tx.collect_change(create(Blog::new(1, "a", 0))).unwrap();
        tx.close(true).await.unwrap();
        tx.collect_change(create(Blog::new(2, "b", 0))).unwrap();
        tx.close(true).await.unwrap();
        assert_eq!(database.rows(Blog::info()).await.len(), 2);
    }
}
