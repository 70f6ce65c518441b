//! Change sets.
//!
//! A [`Change`] is one deferred unit of mutation. It has two sides:
//!
//! - the cache side ([`Change::apply_to_store`]), applied as soon as the change
//!   is collected so the transaction sees its own writes;
//! - the physical side ([`Change::command`] followed by [`Change::verify`]),
//!   replayed in collection order when the transaction commits.
//!
//! Updates and deletes carry the version they were computed against and the
//! number of rows they expect to touch. The physical command only matches rows
//! still at that version, so a concurrent writer shows up as a row-count
//! mismatch and a [`ConcurrencyConflict`].

use std::{collections::HashSet, fmt, marker::PhantomData};

use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    concurrency::ConcurrencyConflict,
    entity::{Entity, EntityInfo, Row, from_row, to_row},
    filter::{Assignment, Filter},
    gateway::{Command, InsertBehavior},
    store::TransactionalStore,
};

/// Error raised while building a change or applying it to the cache.
#[derive(Debug, Error)]
pub enum ChangeError {
    #[error("a create change for `{entity}` needs at least one entity")]
    Empty { entity: &'static str },
    #[error("`{entity}` with key {key} is already tracked by this transaction")]
    DuplicateKey { entity: &'static str, key: String },
    #[error("failed to encode `{entity}`: {source}")]
    Encode {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode `{entity}`: {source}")]
    Decode {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One deferred mutation collected by a transaction.
pub trait Change: fmt::Debug + Send + Sync {
    fn entity(&self) -> &'static EntityInfo;

    /// Physical statement replayed at commit time.
    fn command(&self) -> &Command;

    /// Check the affected-row count reported by the physical statement.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyConflict`] when the count does not match what the
    /// change expected.
    fn verify(&self, affected_rows: u64) -> Result<(), ConcurrencyConflict>;

    /// Mirror the change in the transaction's cache.
    fn apply_to_store(&self, store: &TransactionalStore) -> Result<(), ChangeError>;
}

fn encode<T: Entity>(entity: &T) -> Result<Row, ChangeError> {
    to_row(entity).map_err(|source| ChangeError::Encode {
        entity: T::info().name,
        source,
    })
}

fn decode<T: Entity>(row: Row) -> Result<T, ChangeError> {
    from_row(row).map_err(|source| ChangeError::Decode {
        entity: T::info().name,
        source,
    })
}

/// Cached entities of type `T` matching `filter`, with their encoded rows.
fn cached_matches<T: Entity>(
    store: &TransactionalStore,
    filter: &Filter,
) -> Result<Vec<(T, Row)>, ChangeError> {
    let mut matches = Vec::new();
    for entity in store.entries::<T>() {
        let row = encode(&entity)?;
        if filter.matches(&row) {
            matches.push((entity, row));
        }
    }
    Ok(matches)
}

fn expect_rows<T: Entity>(
    version: i64,
    expected_rows: u64,
    actual_rows: u64,
) -> Result<(), ConcurrencyConflict> {
    if actual_rows == expected_rows {
        Ok(())
    } else {
        Err(ConcurrencyConflict {
            entity: T::info().name,
            version,
            expected_rows,
            actual_rows,
        })
    }
}

/// Insert a batch of new entities.
pub struct CreateEntityChange<T: Entity> {
    entities: NonEmpty<T>,
    behavior: InsertBehavior,
    command: Command,
}

impl<T: Entity> CreateEntityChange<T> {
    /// # Errors
    ///
    /// Fails with [`ChangeError::Empty`] for an empty batch, or
    /// [`ChangeError::Encode`] if an entity cannot be encoded.
    pub fn new(entities: Vec<T>, behavior: InsertBehavior) -> Result<Self, ChangeError> {
        let entities = NonEmpty::from_vec(entities).ok_or_else(|| ChangeError::Empty {
            entity: T::info().name,
        })?;
        let rows = entities.iter().map(encode).collect::<Result<_, _>>()?;
        Ok(Self {
            entities,
            behavior,
            command: Command::Insert {
                entity: T::info(),
                rows,
                behavior,
            },
        })
    }

    pub const fn behavior(&self) -> InsertBehavior {
        self.behavior
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

impl<T: Entity> fmt::Debug for CreateEntityChange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateEntityChange")
            .field("entity", &T::info().name)
            .field("count", &self.entities.len())
            .field("behavior", &self.behavior)
            .finish()
    }
}

impl<T: Entity> Change for CreateEntityChange<T> {
    fn entity(&self) -> &'static EntityInfo {
        T::info()
    }

    fn command(&self) -> &Command {
        &self.command
    }

    /// Inserts carry no version; any row count is accepted.
    fn verify(&self, _affected_rows: u64) -> Result<(), ConcurrencyConflict> {
        Ok(())
    }

    fn apply_to_store(&self, store: &TransactionalStore) -> Result<(), ChangeError> {
        match self.behavior {
            InsertBehavior::Default => {
                let mut seen = HashSet::with_capacity(self.entities.len());
                for entity in self.entities.iter() {
                    let key = entity.key();
                    if store.try_get::<T>(&key).is_some() || !seen.insert(key.clone()) {
                        return Err(ChangeError::DuplicateKey {
                            entity: T::info().name,
                            key: format!("{key:?}"),
                        });
                    }
                }
                for entity in self.entities.iter() {
                    store.upsert(entity.clone());
                }
            }
            InsertBehavior::DoNothing => {
                for entity in self.entities.iter() {
                    if store.is_removed::<T>(&entity.key()) {
                        store.upsert(entity.clone());
                    } else {
                        store.store(entity.clone());
                    }
                }
            }
            InsertBehavior::DoUpdate => {
                for entity in self.entities.iter() {
                    store.upsert(entity.clone());
                }
            }
        }
        tracing::trace!(
            entity = T::info().name,
            count = self.entities.len(),
            "create applied to transactional store"
        );
        Ok(())
    }
}

/// Update every row matching a filter that is still at a captured version.
pub struct UpdateEntityChange<T: Entity> {
    version: i64,
    expected_rows: u64,
    filter: Filter,
    assignments: Vec<Assignment>,
    update_version: i64,
    command: Command,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> UpdateEntityChange<T> {
    /// Build an update of the rows matching `filter`.
    ///
    /// The physical statement additionally requires the version column to
    /// equal `version`, and writes `update_version` into it alongside the
    /// given assignments. The written version is raised to `version + 1`
    /// when `update_version` is not above the captured one.
    #[must_use]
    pub fn new(
        version: i64,
        expected_rows: u64,
        filter: Filter,
        assignments: Vec<Assignment>,
        update_version: i64,
    ) -> Self {
        let info = T::info();
        let update_version = update_version.max(version.saturating_add(1));
        let mut physical = assignments.clone();
        physical.push(Assignment::set(info.version, update_version));
        let command = Command::Update {
            entity: info,
            filter: filter.clone().and(Filter::eq(info.version, version)),
            assignments: physical,
        };
        Self {
            version,
            expected_rows,
            filter,
            assignments,
            update_version,
            command,
            _entity: PhantomData,
        }
    }

    pub const fn version(&self) -> i64 {
        self.version
    }

    pub const fn expected_rows(&self) -> u64 {
        self.expected_rows
    }

    pub const fn update_version(&self) -> i64 {
        self.update_version
    }
}

impl<T: Entity> fmt::Debug for UpdateEntityChange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateEntityChange")
            .field("entity", &T::info().name)
            .field("version", &self.version)
            .field("expected_rows", &self.expected_rows)
            .field("filter", &self.filter)
            .field("assignments", &self.assignments)
            .field("update_version", &self.update_version)
            .finish()
    }
}

impl<T: Entity> Change for UpdateEntityChange<T> {
    fn entity(&self) -> &'static EntityInfo {
        T::info()
    }

    fn command(&self) -> &Command {
        &self.command
    }

    fn verify(&self, affected_rows: u64) -> Result<(), ConcurrencyConflict> {
        expect_rows::<T>(self.version, self.expected_rows, affected_rows)
    }

    fn apply_to_store(&self, store: &TransactionalStore) -> Result<(), ChangeError> {
        let Command::Update {
            filter, assignments, ..
        } = &self.command
        else {
            unreachable!("update change always builds an update command");
        };
        let matches = cached_matches::<T>(store, filter)?;
        let count = matches.len();
        for (_, mut row) in matches {
            for assignment in assignments {
                assignment.apply(&mut row);
            }
            let mut updated: T = decode(row)?;
            updated.set_version(self.update_version);
            store.upsert(updated);
        }
        tracing::trace!(
            entity = T::info().name,
            count,
            "update applied to transactional store"
        );
        Ok(())
    }
}

/// Delete every row matching a filter that is still at a captured version.
pub struct DeleteEntityChange<T: Entity> {
    version: i64,
    expected_rows: u64,
    command: Command,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> DeleteEntityChange<T> {
    #[must_use]
    pub fn new(version: i64, expected_rows: u64, filter: Filter) -> Self {
        let info = T::info();
        Self {
            version,
            expected_rows,
            command: Command::Delete {
                entity: info,
                filter: filter.and(Filter::eq(info.version, version)),
            },
            _entity: PhantomData,
        }
    }

    pub const fn version(&self) -> i64 {
        self.version
    }

    pub const fn expected_rows(&self) -> u64 {
        self.expected_rows
    }
}

impl<T: Entity> fmt::Debug for DeleteEntityChange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteEntityChange")
            .field("entity", &T::info().name)
            .field("version", &self.version)
            .field("expected_rows", &self.expected_rows)
            .field("command", &self.command)
            .finish()
    }
}

impl<T: Entity> Change for DeleteEntityChange<T> {
    fn entity(&self) -> &'static EntityInfo {
        T::info()
    }

    fn command(&self) -> &Command {
        &self.command
    }

    fn verify(&self, affected_rows: u64) -> Result<(), ConcurrencyConflict> {
        expect_rows::<T>(self.version, self.expected_rows, affected_rows)
    }

    fn apply_to_store(&self, store: &TransactionalStore) -> Result<(), ChangeError> {
        let Command::Delete { filter, .. } = &self.command else {
            unreachable!("delete change always builds a delete command");
        };
        let matches = cached_matches::<T>(store, filter)?;
        let count = matches.len();
        for (entity, _) in matches {
            store.remove::<T>(&entity.key());
        }
        tracing::trace!(
            entity = T::info().name,
            count,
            "delete applied to transactional store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::fixtures::{Blog, User};

    #[test]
    fn create_rejects_empty_batch() {
        let err = CreateEntityChange::<Blog>::new(Vec::new(), InsertBehavior::Default).unwrap_err();
        assert!(matches!(err, ChangeError::Empty { entity: "Blog" }));
    }

    #[test]
    fn create_builds_insert_command() {
        let change =
            CreateEntityChange::new(vec![Blog::new(1, "a", 1), Blog::new(2, "b", 1)], InsertBehavior::DoNothing)
                .unwrap();
        let Command::Insert { rows, behavior, entity } = change.command() else {
            panic!("expected insert");
        };
        assert_eq!(entity.table, "blogs");
        assert_eq!(*behavior, InsertBehavior::DoNothing);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("title"), Some(&json!("b")));
        assert!(change.verify(0).is_ok());
    }

    #[test]
    fn default_create_rejects_tracked_key() {
        let store = TransactionalStore::new();
        store.store(Blog::new(1, "cached", 1));
        let change = CreateEntityChange::new(vec![Blog::new(1, "new", 1)], InsertBehavior::Default).unwrap();
        let err = change.apply_to_store(&store).unwrap_err();
        assert!(matches!(err, ChangeError::DuplicateKey { entity: "Blog", .. }));
        assert_eq!(store.try_get::<Blog>(&1).map(|b| b.title), Some("cached".into()));
    }

    #[test]
    fn default_create_rejects_duplicates_within_batch() {
        let store = TransactionalStore::new();
        let change =
            CreateEntityChange::new(vec![Blog::new(1, "a", 1), Blog::new(1, "b", 1)], InsertBehavior::Default)
                .unwrap();
        assert!(change.apply_to_store(&store).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn create_after_delete_recreates_entry() {
        let store = TransactionalStore::new();
        store.store(Blog::new(1, "old", 1));
        store.remove::<Blog>(&1);
        let change = CreateEntityChange::new(vec![Blog::new(1, "new", 1)], InsertBehavior::Default).unwrap();
        change.apply_to_store(&store).unwrap();
        assert_eq!(store.try_get::<Blog>(&1).map(|b| b.title), Some("new".into()));
    }

    #[test]
    fn do_nothing_keeps_first_writer_and_do_update_overwrites() {
        let store = TransactionalStore::new();
        store.store(Blog::new(1, "first", 1));

        CreateEntityChange::new(vec![Blog::new(1, "second", 1)], InsertBehavior::DoNothing)
            .unwrap()
            .apply_to_store(&store)
            .unwrap();
        assert_eq!(store.try_get::<Blog>(&1).map(|b| b.title), Some("first".into()));

        CreateEntityChange::new(vec![Blog::new(1, "third", 1)], InsertBehavior::DoUpdate)
            .unwrap()
            .apply_to_store(&store)
            .unwrap();
        assert_eq!(store.try_get::<Blog>(&1).map(|b| b.title), Some("third".into()));
    }

    #[test]
    fn update_command_is_guarded_by_version() {
        let change = UpdateEntityChange::<User>::new(
            3,
            1,
            Filter::eq("id", 2),
            vec![Assignment::set("nickname", "B")],
            9,
        );
        let Command::Update {
            filter, assignments, ..
        } = change.command()
        else {
            panic!("expected update");
        };
        assert_eq!(
            *filter,
            Filter::And(vec![Filter::eq("id", 2), Filter::eq("version", 3)])
        );
        assert_eq!(
            *assignments,
            vec![Assignment::set("nickname", "B"), Assignment::set("version", 9)]
        );
    }

    #[test]
    fn update_version_never_goes_backwards() {
        let change = UpdateEntityChange::<User>::new(7, 1, Filter::eq("id", 2), Vec::new(), 2);
        assert_eq!(change.update_version(), 8);

        let store = TransactionalStore::new();
        store.store(User::new(2, "A", 7));
        change.apply_to_store(&store).unwrap();
        assert_eq!(store.try_get::<User>(&2), Some(User::new(2, "A", 8)));
    }

    #[test]
    fn update_verify_reports_conflict() {
        let change = UpdateEntityChange::<User>::new(3, 1, Filter::eq("id", 2), Vec::new(), 9);
        assert!(change.verify(1).is_ok());
        let conflict = change.verify(0).unwrap_err();
        assert_eq!(conflict.entity, "User");
        assert_eq!(conflict.version, 3);
        assert_eq!(conflict.expected_rows, 1);
        assert_eq!(conflict.actual_rows, 0);
    }

    #[test]
    fn update_applies_assignments_and_version_to_cache() {
        let store = TransactionalStore::new();
        store.store(User::new(2, "A", 3));
        store.store(User::new(3, "C", 3));
        let change = UpdateEntityChange::<User>::new(
            3,
            1,
            Filter::eq("id", 2),
            vec![Assignment::set("nickname", "B")],
            9,
        );
        change.apply_to_store(&store).unwrap();
        assert_eq!(store.try_get::<User>(&2), Some(User::new(2, "B", 9)));
        assert_eq!(store.try_get::<User>(&3), Some(User::new(3, "C", 3)));
    }

    #[test]
    fn update_skips_cached_entries_at_other_versions() {
        let store = TransactionalStore::new();
        store.store(User::new(2, "A", 4));
        UpdateEntityChange::<User>::new(3, 1, Filter::All, vec![Assignment::set("nickname", "B")], 9)
            .apply_to_store(&store)
            .unwrap();
        assert_eq!(store.try_get::<User>(&2), Some(User::new(2, "A", 4)));
    }

    #[test]
    fn update_with_undecodable_assignment_fails() {
        let store = TransactionalStore::new();
        store.store(User::new(2, "A", 3));
        let err = UpdateEntityChange::<User>::new(3, 1, Filter::All, vec![Assignment::set("nickname", 5)], 9)
            .apply_to_store(&store)
            .unwrap_err();
        assert!(matches!(err, ChangeError::Decode { entity: "User", .. }));
    }

    #[test]
    fn delete_tombstones_matching_entries() {
        let store = TransactionalStore::new();
        store.store(Blog::new(1, "a", 2));
        store.store(Blog::new(2, "b", 2));
        let change = DeleteEntityChange::<Blog>::new(2, 1, Filter::eq("title", "a"));
        change.apply_to_store(&store).unwrap();
        assert!(store.is_removed::<Blog>(&1));
        assert_eq!(store.entries::<Blog>(), vec![Blog::new(2, "b", 2)]);
        assert!(change.verify(2).is_err());
    }
}
