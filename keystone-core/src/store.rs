//! Per-transaction entity cache.
//!
//! [`TransactionalStore`] holds every entity a transaction has read or
//! produced, keyed by `(entity type, primary key)`. Change sets apply
//! themselves to it as soon as they are collected, which gives the
//! transaction read-your-writes visibility long before anything reaches
//! physical storage.
//!
//! Deletes leave a removal marker behind so that a later read-through of the
//! same row cannot resurrect it.

use std::{
    any::{Any, TypeId},
    fmt,
};

use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;

use crate::entity::Entity;

/// Error returned by unsupported store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Single-key eviction would silently drop pending writes. Clear the
    /// whole store instead.
    #[error("invalidating a single `{entity}` entry is not supported; clear the store instead")]
    InvalidateUnsupported { entity: &'static str },
}

/// Outcome of [`TransactionalStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    /// The entry was added.
    Inserted,
    /// An entry with the same key was already present and was kept.
    Existing,
    /// The key was removed earlier in the transaction; nothing was stored.
    Removed,
}

#[derive(Clone)]
enum Slot<T> {
    Present(T),
    Removed,
}

type Slots<T> = DashMap<<T as Entity>::Key, Slot<T>>;

/// Type-erased view of one entity type's slots.
trait ErasedSlots: Send + Sync {
    fn len(&self) -> usize;

    fn clear(&self);

    fn as_any(&self) -> &dyn Any;
}

impl<T: Entity> ErasedSlots for Slots<T> {
    fn len(&self) -> usize {
        DashMap::len(self)
    }

    fn clear(&self) {
        DashMap::clear(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-memory keyed cache of the entities seen or produced by one
/// transaction.
#[derive(Default)]
pub struct TransactionalStore {
    types: DashMap<TypeId, Box<dyn ErasedSlots>>,
}

impl fmt::Debug for TransactionalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalStore")
            .field("types", &self.types.len())
            .field("slots", &self.len())
            .finish()
    }
}

impl TransactionalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slots<T, R>(&self, f: impl FnOnce(&Slots<T>) -> R) -> R
    where
        T: Entity,
    {
        let slots = self
            .types
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Slots::<T>::new()));
        let slots = slots
            .as_any()
            .downcast_ref::<Slots<T>>()
            .unwrap_or_else(|| unreachable!("slots are keyed by their own TypeId"));
        f(slots)
    }

    fn read_slots<T, R>(&self, f: impl FnOnce(&Slots<T>) -> R) -> Option<R>
    where
        T: Entity,
    {
        let slots = self.types.get(&TypeId::of::<T>())?;
        slots.as_any().downcast_ref::<Slots<T>>().map(f)
    }

    /// Store `entry` unless its key is already claimed.
    ///
    /// The first writer wins: an entry already present under the same key is
    /// kept, and a key removed earlier in the transaction stays removed.
    pub fn store<T: Entity>(&self, entry: T) -> Stored {
        self.with_slots::<T, _>(|slots| match slots.entry(entry.key()) {
            Entry::Occupied(occupied) => match occupied.get() {
                Slot::Present(_) => Stored::Existing,
                Slot::Removed => Stored::Removed,
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Present(entry));
                Stored::Inserted
            }
        })
    }

    /// Store `entry`, replacing whatever the key held before.
    pub fn upsert<T: Entity>(&self, entry: T) {
        self.with_slots::<T, _>(|slots| {
            slots.insert(entry.key(), Slot::Present(entry));
        });
    }

    /// Look up an entry of exactly type `T`.
    #[must_use]
    pub fn try_get<T: Entity>(&self, key: &T::Key) -> Option<T> {
        self.read_slots::<T, _>(|slots| match slots.get(key).as_deref() {
            Some(Slot::Present(entry)) => Some(entry.clone()),
            Some(Slot::Removed) | None => None,
        })
        .flatten()
    }

    /// Whether the key was removed earlier in the transaction.
    #[must_use]
    pub fn is_removed<T: Entity>(&self, key: &T::Key) -> bool {
        self.read_slots::<T, _>(|slots| matches!(slots.get(key).as_deref(), Some(Slot::Removed)))
            .unwrap_or(false)
    }

    /// Mutate a present entry in place. Returns whether an entry was found.
    pub fn modify<T: Entity>(&self, key: &T::Key, f: impl FnOnce(&mut T)) -> bool {
        self.read_slots::<T, _>(|slots| match slots.get_mut(key).as_deref_mut() {
            Some(Slot::Present(entry)) => {
                f(entry);
                true
            }
            Some(Slot::Removed) | None => false,
        })
        .unwrap_or(false)
    }

    /// Mark a key as removed.
    pub fn remove<T: Entity>(&self, key: &T::Key) {
        self.with_slots::<T, _>(|slots| {
            slots.insert(key.clone(), Slot::Removed);
        });
    }

    /// All present entries of type `T`, ordered by key.
    #[must_use]
    pub fn entries<T: Entity>(&self) -> Vec<T> {
        let mut entries: Vec<(T::Key, T)> = self
            .read_slots::<T, _>(|slots| {
                slots
                    .iter()
                    .filter_map(|slot| match slot.value() {
                        Slot::Present(entry) => Some((slot.key().clone(), entry.clone())),
                        Slot::Removed => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|(left, _), (right, _)| left.cmp(right));
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Single-key eviction is not supported.
    ///
    /// # Errors
    ///
    /// Always returns [`StoreError::InvalidateUnsupported`].
    pub fn invalidate<T: Entity>(&self, key: &T::Key) -> Result<(), StoreError> {
        let _ = key;
        Err(StoreError::InvalidateUnsupported {
            entity: T::info().name,
        })
    }

    /// Number of slots (entries and removal markers) across all types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.iter().map(|slots| slots.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty every per-type map. The per-type maps themselves are kept so the
    /// store can be reused by the next transaction on the same instance.
    pub fn clear(&self) {
        for slots in &self.types {
            slots.value().clear();
        }
        tracing::trace!("transactional store cleared");
    }
}
