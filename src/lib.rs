#![doc = include_str!("../README.md")]

pub use keystone_core::{
    change,
    change::{Change, ChangeError, CreateEntityChange, DeleteEntityChange, UpdateEntityChange},
    concurrency::ConcurrencyConflict,
    entity,
    entity::{ColumnInfo, Entity, EntityInfo, IndexInfo, Row},
    filter,
    filter::{Assignment, Filter},
    registry,
    registry::{EntityRegistry, RegistryError},
    settings::TransactionSettings,
    store,
    store::TransactionalStore,
    transaction,
    transaction::{DatabaseTransaction, TransactionError},
};
#[cfg(feature = "test-util")]
pub use keystone_core::test;
// Re-export proc macro derives so consumers only depend on `keystone`.
pub use keystone_macros::Entity;

pub mod gateway {

    pub use keystone_core::gateway::{
        Command, Connection, ConnectionState, Gateway, InsertBehavior, Query,
    };

    pub use keystone_core::gateway::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use keystone_postgres::{Connection, Database, Error};
    }
}

pub mod model {

    pub use keystone_core::model::{
        ColumnNode, DatabaseModelBuilder, DatabaseNode, DependencyOrder, IndexNode, MigrationError,
        ModelChange, ModelChangeExecutor, ModelChangesSorter, ModelComparator, ModelError,
        ModelNode, SchemaNode, StructuralComparator, TableNode, ViewNode, migrate,
    };

    // Building blocks for custom comparators.
    #[doc(hidden)]
    pub use keystone_core::model::{Joined, full_outer_join};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use keystone_postgres::{CatalogReader, Error, Executor};
    }
}

pub use gateway::InsertBehavior;
