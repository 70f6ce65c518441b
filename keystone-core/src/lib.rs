//! Core traits and types for the keystone data-access engine.
//!
//! This crate provides the foundational abstractions:
//!
//! - [`entity`] - Entity metadata and row encoding (`Entity`, `EntityInfo`)
//! - [`filter`] - Row predicates and set-expressions (`Filter`, `Assignment`)
//! - [`store`] - Per-transaction entity cache (`TransactionalStore`)
//! - [`change`] - Deferred mutations (`CreateEntityChange`, `UpdateEntityChange`, `DeleteEntityChange`)
//! - [`gateway`] - Physical storage abstraction (`Gateway`, `Connection`)
//! - [`transaction`] - Unit of work with optimistic concurrency (`DatabaseTransaction`)
//! - [`model`] - Schema model, diffing and migration (`ModelComparator`, `migrate`)
//! - [`registry`] - Entity registration and expected-model construction (`EntityRegistry`)
//! - [`concurrency`] - Optimistic concurrency failures (`ConcurrencyConflict`)
//!
//! # Example
//!
//! ```
//! use keystone_core::{gateway::inmemory, transaction::DatabaseTransaction};
//!
//! let database = inmemory::Database::new();
//! let transaction = DatabaseTransaction::new(database);
//! ```
//!
//! Most users should depend on the [`keystone`](https://docs.rs/keystone) crate,
//! which re-exports these types with a cleaner API surface.

pub mod change;
pub mod concurrency;
pub mod entity;
pub mod filter;
pub mod gateway;
pub mod model;
pub mod registry;
pub mod settings;
pub mod store;
pub mod transaction;
