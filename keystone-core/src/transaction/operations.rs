//! Typed reads and writes on top of [`DatabaseTransaction`].

use std::collections::BTreeMap;

use serde_json::Value;

use super::{DatabaseTransaction, Result, TransactionError};
use crate::{
    change::{ChangeError, CreateEntityChange, DeleteEntityChange, UpdateEntityChange},
    entity::{Entity, from_row, key_value, to_row},
    filter::{Assignment, Filter},
    gateway::{Connection, Gateway, InsertBehavior, Query},
};

fn encode_error<E>(entity: &'static str) -> impl FnOnce(serde_json::Error) -> TransactionError<E>
where
    E: std::error::Error + 'static,
{
    move |source| TransactionError::Change(ChangeError::Encode { entity, source })
}

/// Keys of `entities` grouped by the version each was loaded at.
fn group_by_version<T, E>(entities: &[T]) -> std::result::Result<BTreeMap<i64, Vec<Value>>, TransactionError<E>>
where
    T: Entity,
    E: std::error::Error + 'static,
{
    let mut groups: BTreeMap<i64, Vec<Value>> = BTreeMap::new();
    for entity in entities {
        let key = key_value::<T>(&entity.key()).map_err(encode_error(T::info().name))?;
        groups.entry(entity.version()).or_default().push(key);
    }
    Ok(groups)
}

impl<G: Gateway> DatabaseTransaction<G> {
    /// Every entity of type `T` matching `filter`, as seen by this
    /// transaction, ordered by key.
    ///
    /// Matching rows are read from storage inside the open physical
    /// transaction (opening one if needed) and cached. Rows already cached are
    /// not overwritten and rows deleted by a pending change stay deleted, so
    /// the result reflects every change collected so far.
    ///
    /// # Errors
    ///
    /// Fails if storage fails or a row does not decode into `T`.
    #[tracing::instrument(skip(self, filter), fields(entity = T::info().name))]
    pub async fn all<T: Entity>(&mut self, filter: Filter) -> Result<Vec<T>, G> {
        self.ensure_valid()?;
        let query = Query::new(T::info(), filter);
        let rows = self
            .physical()
            .await?
            .query(&query)
            .await
            .map_err(TransactionError::Storage)?;
        let fetched = rows.len();
        for row in rows {
            let entity: T = from_row(row).map_err(|source| TransactionError::Decode {
                entity: T::info().name,
                source,
            })?;
            self.store.store(entity);
        }

        let mut matches = Vec::new();
        for entity in self.store.entries::<T>() {
            let row = to_row(&entity).map_err(encode_error(T::info().name))?;
            if query.filter.matches(&row) {
                matches.push(entity);
            }
        }
        tracing::trace!(fetched, matched = matches.len(), "query resolved");
        self.queries.push(query);
        Ok(matches)
    }

    /// The entity with the given key, if this transaction can see one.
    ///
    /// # Errors
    ///
    /// Fails if storage fails or the stored row does not decode into `T`.
    pub async fn single_or_default<T: Entity>(&mut self, key: &T::Key) -> Result<Option<T>, G> {
        self.ensure_valid()?;
        if let Some(entity) = self.store.try_get::<T>(key) {
            return Ok(Some(entity));
        }
        if self.store.is_removed::<T>(key) {
            return Ok(None);
        }
        let value = key_value::<T>(key).map_err(encode_error(T::info().name))?;
        let mut found = self
            .all::<T>(Filter::Eq(T::info().key.to_owned(), value))
            .await?;
        Ok(found.pop())
    }

    /// The entity with the given key.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::NotFound`] if there is none.
    pub async fn single<T: Entity>(&mut self, key: &T::Key) -> Result<T, G> {
        self.single_or_default::<T>(key)
            .await?
            .ok_or_else(|| TransactionError::NotFound {
                entity: T::info().name,
                key: format!("{key:?}"),
            })
    }

    /// Queue an insert of `entities`.
    ///
    /// # Errors
    ///
    /// Fails for an empty batch, or with [`ChangeError::DuplicateKey`] when
    /// `behavior` is [`InsertBehavior::Default`] and a key is already visible
    /// to this transaction.
    #[tracing::instrument(skip(self, entities), fields(entity = T::info().name, count = entities.len()))]
    pub fn insert<T: Entity>(&mut self, entities: Vec<T>, behavior: InsertBehavior) -> Result<(), G> {
        self.ensure_valid()?;
        let change = CreateEntityChange::new(entities, behavior)?;
        self.collect_change(Box::new(change))
    }

    /// Queue an update of every entity matching `filter`.
    ///
    /// Matches are grouped by the version they were loaded at; each group
    /// becomes one optimistic change expecting exactly that group's rows.
    /// Returns the number of entities matched.
    ///
    /// # Errors
    ///
    /// Fails if loading the matches fails or the assignments produce a value
    /// that does not decode into `T`.
    #[tracing::instrument(skip(self, filter, assignments), fields(entity = T::info().name))]
    pub async fn update<T: Entity>(
        &mut self,
        filter: Filter,
        assignments: Vec<Assignment>,
    ) -> Result<u64, G> {
        let matches = self.all::<T>(filter.clone()).await?;
        if matches.is_empty() {
            return Ok(0);
        }
        let update_version = self.version().await?;
        let key_column = T::info().key;
        for (version, keys) in group_by_version::<T, G::Error>(&matches)? {
            let expected_rows = keys.len() as u64;
            let narrowed = filter.clone().and(Filter::In(key_column.to_owned(), keys));
            let change = UpdateEntityChange::<T>::new(
                version,
                expected_rows,
                narrowed,
                assignments.clone(),
                update_version,
            );
            self.collect_change(Box::new(change))?;
        }
        Ok(matches.len() as u64)
    }

    /// Queue a delete of every entity matching `filter`.
    ///
    /// Grouped by version like [`update`](Self::update). Returns the number
    /// of entities matched.
    ///
    /// # Errors
    ///
    /// Fails if loading the matches fails.
    #[tracing::instrument(skip(self, filter), fields(entity = T::info().name))]
    pub async fn delete<T: Entity>(&mut self, filter: Filter) -> Result<u64, G> {
        let matches = self.all::<T>(filter.clone()).await?;
        let key_column = T::info().key;
        for (version, keys) in group_by_version::<T, G::Error>(&matches)? {
            let expected_rows = keys.len() as u64;
            let narrowed = filter.clone().and(Filter::In(key_column.to_owned(), keys));
            self.collect_change(Box::new(DeleteEntityChange::<T>::new(
                version,
                expected_rows,
                narrowed,
            )))?;
        }
        Ok(matches.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity::fixtures::{Blog, User},
        gateway::{Command, inmemory},
    };

    async fn seeded(users: &[User]) -> inmemory::Database {
        let database = inmemory::Database::new();
        database
            .apply(&Command::Insert {
                entity: User::info(),
                rows: users.iter().map(|u| to_row(u).unwrap()).collect(),
                behavior: InsertBehavior::Default,
            })
            .await
            .unwrap();
        database
    }

    #[tokio::test]
    async fn all_reads_through_and_records_query() {
        let database = seeded(&[User::new(2, "b", 1), User::new(1, "a", 1)]).await;
        let mut tx = DatabaseTransaction::new(database);

        let users = tx.all::<User>(Filter::All).await.unwrap();
        assert_eq!(users, vec![User::new(1, "a", 1), User::new(2, "b", 1)]);
        assert!(tx.is_open());
        assert_eq!(tx.executed_queries().len(), 1);
        assert_eq!(tx.transactional_store().len(), 2);
    }

    #[tokio::test]
    async fn all_prefers_cached_entries() {
        let database = seeded(&[User::new(1, "a", 1)]).await;
        let mut tx = DatabaseTransaction::new(database);
        tx.update::<User>(Filter::eq("id", 1), vec![Assignment::set("nickname", "z")])
            .await
            .unwrap();

        let users = tx.all::<User>(Filter::eq("nickname", "z")).await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(tx.all::<User>(Filter::eq("nickname", "a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_reports_missing_entities() {
        let mut tx = DatabaseTransaction::new(inmemory::Database::new());
        assert_eq!(tx.single_or_default::<Blog>(&1).await.unwrap(), None);
        let err = tx.single::<Blog>(&1).await.unwrap_err();
        assert!(matches!(err, TransactionError::NotFound { entity: "Blog", .. }));
    }

    #[tokio::test]
    async fn deleted_entities_are_not_read_back() {
        let database = seeded(&[User::new(1, "a", 1), User::new(2, "b", 1)]).await;
        let mut tx = DatabaseTransaction::new(database);
        assert_eq!(tx.delete::<User>(Filter::eq("id", 1)).await.unwrap(), 1);

        assert_eq!(tx.single_or_default::<User>(&1).await.unwrap(), None);
        let ids: Vec<i64> = tx
            .all::<User>(Filter::All)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn update_groups_matches_by_version() {
        let database = seeded(&[User::new(1, "a", 1), User::new(2, "b", 1), User::new(3, "c", 2)]).await;
        let mut tx = DatabaseTransaction::new(database.clone());

        let matched = tx
            .update::<User>(Filter::All, vec![Assignment::set("nickname", "z")])
            .await
            .unwrap();
        assert_eq!(matched, 3);
        assert_eq!(tx.pending_changes().len(), 2);

        tx.close(true).await.unwrap();
        let rows = database.rows(User::info()).await;
        assert!(rows.iter().all(|row| row.get("nickname") == Some(&Value::from("z"))));
    }

    #[tokio::test]
    async fn update_without_matches_collects_nothing() {
        let mut tx = DatabaseTransaction::new(inmemory::Database::new());
        let matched = tx
            .update::<User>(Filter::All, vec![Assignment::set("nickname", "z")])
            .await
            .unwrap();
        assert_eq!(matched, 0);
        assert!(tx.pending_changes().is_empty());
    }

    #[tokio::test]
    async fn insert_then_update_in_one_transaction_commits() {
        let database = inmemory::Database::new();
        let mut tx = DatabaseTransaction::new(database.clone());
        tx.insert(vec![User::new(1, "a", 0)], InsertBehavior::Default)
            .unwrap();
        tx.update::<User>(Filter::eq("id", 1), vec![Assignment::set("nickname", "b")])
            .await
            .unwrap();
        tx.close(true).await.unwrap();

        let rows = database.rows(User::info()).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("nickname"), Some(&Value::from("b")));
    }
}
