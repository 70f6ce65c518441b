//! Entity metadata.
//!
//! An [`Entity`] is any persisted object identified by a primary key and
//! carrying a monotonically increasing version used for optimistic
//! concurrency. Its static shape (schema, table, columns, indexes) is
//! described by an [`EntityInfo`], usually generated by `#[derive(Entity)]`.
//!
//! Entities travel to and from physical storage as [`Row`]s: JSON objects
//! keyed by column name.

use std::{fmt, hash::Hash};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// A single row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Static description of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: &'static str,
    /// SQL data type as reported by the catalog (`bigint`, `text`, ...).
    pub data_type: &'static str,
    pub nullable: bool,
}

/// Static description of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    pub columns: &'static [&'static str],
    pub unique: bool,
}

/// Static description of an entity type and the table it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityInfo {
    /// Rust type name, used in error messages and logs.
    pub name: &'static str,
    pub schema: &'static str,
    pub table: &'static str,
    /// Primary key column.
    pub key: &'static str,
    /// Version column used for optimistic concurrency.
    pub version: &'static str,
    pub columns: &'static [ColumnInfo],
    pub indexes: &'static [IndexInfo],
}

impl EntityInfo {
    /// Look up a column by name (case-insensitive).
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&'static ColumnInfo> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    /// `schema.table`, for logs.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for EntityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A persisted object with a primary key and a concurrency version.
///
/// Implement by hand or with `#[derive(Entity)]`.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Debug, Serialize, Deserialize, Entity)]
/// #[entity(schema = "blog", table = "blogs")]
/// struct Blog {
///     #[entity(key)]
///     id: i64,
///     title: String,
///     #[entity(version)]
///     version: i64,
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Primary key type.
    ///
    /// `Ord` keeps reads deterministic: cached entities are returned in key
    /// order.
    type Key: Clone + Eq + Hash + Ord + fmt::Debug + Serialize + Send + Sync + 'static;

    fn info() -> &'static EntityInfo;

    fn key(&self) -> Self::Key;

    fn version(&self) -> i64;

    fn set_version(&mut self, version: i64);
}

/// Encode an entity into a row.
///
/// # Errors
///
/// Fails if the entity does not serialize to a JSON object.
pub fn to_row<T: Entity>(entity: &T) -> Result<Row, serde_json::Error> {
    match serde_json::to_value(entity)? {
        Value::Object(row) => Ok(row),
        other => Err(serde::ser::Error::custom(format!(
            "entity `{}` must serialize to an object, got {}",
            T::info().name,
            kind_of(&other)
        ))),
    }
}

/// Decode an entity from a row.
///
/// # Errors
///
/// Fails if the row does not match the entity's shape.
pub fn from_row<T: Entity>(row: Row) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(row))
}

/// Encode a key as the JSON value stored in the key column.
///
/// # Errors
///
/// Fails only for keys whose `Serialize` impl fails.
pub fn key_value<T: Entity>(key: &T::Key) -> Result<Value, serde_json::Error> {
    serde_json::to_value(key)
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Hand-written entities shared by the crate's unit tests.

    use serde::{Deserialize, Serialize};

    use super::{ColumnInfo, Entity, EntityInfo, IndexInfo};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Blog {
        pub id: i64,
        pub title: String,
        pub version: i64,
    }

    impl Blog {
        pub fn new(id: i64, title: &str, version: i64) -> Self {
            Self {
                id,
                title: title.to_owned(),
                version,
            }
        }
    }

    impl Entity for Blog {
        type Key = i64;

        fn info() -> &'static EntityInfo {
            static INFO: EntityInfo = EntityInfo {
                name: "Blog",
                schema: "blog",
                table: "blogs",
                key: "id",
                version: "version",
                columns: &[
                    ColumnInfo {
                        name: "id",
                        data_type: "bigint",
                        nullable: false,
                    },
                    ColumnInfo {
                        name: "title",
                        data_type: "text",
                        nullable: false,
                    },
                    ColumnInfo {
                        name: "version",
                        data_type: "bigint",
                        nullable: false,
                    },
                ],
                indexes: &[IndexInfo {
                    columns: &["title"],
                    unique: false,
                }],
            };
            &INFO
        }

        fn key(&self) -> i64 {
            self.id
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn set_version(&mut self, version: i64) {
            self.version = version;
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct User {
        pub id: i64,
        pub nickname: String,
        pub version: i64,
    }

    impl User {
        pub fn new(id: i64, nickname: &str, version: i64) -> Self {
            Self {
                id,
                nickname: nickname.to_owned(),
                version,
            }
        }
    }

    impl Entity for User {
        type Key = i64;

        fn info() -> &'static EntityInfo {
            static INFO: EntityInfo = EntityInfo {
                name: "User",
                schema: "auth",
                table: "users",
                key: "id",
                version: "version",
                columns: &[
                    ColumnInfo {
                        name: "id",
                        data_type: "bigint",
                        nullable: false,
                    },
                    ColumnInfo {
                        name: "nickname",
                        data_type: "text",
                        nullable: false,
                    },
                    ColumnInfo {
                        name: "version",
                        data_type: "bigint",
                        nullable: false,
                    },
                ],
                indexes: &[],
            };
            &INFO
        }

        fn key(&self) -> i64 {
            self.id
        }

        fn version(&self) -> i64 {
            self.version
        }

        fn set_version(&mut self, version: i64) {
            self.version = version;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{fixtures::Blog, *};

    #[test]
    fn to_row_produces_column_keyed_object() {
        let row = to_row(&Blog::new(1, "hello", 3)).unwrap();
        assert_eq!(row.get("id"), Some(&json!(1)));
        assert_eq!(row.get("title"), Some(&json!("hello")));
        assert_eq!(row.get("version"), Some(&json!(3)));
    }

    #[test]
    fn from_row_rejects_wrong_shape() {
        let mut row = Row::new();
        row.insert("id".to_owned(), json!("not a number"));
        assert!(from_row::<Blog>(row).is_err());
    }

    #[test]
    fn column_lookup_ignores_case() {
        let info = Blog::info();
        assert_eq!(info.column("TITLE").map(|c| c.name), Some("title"));
        assert!(info.column("missing").is_none());
        assert_eq!(info.qualified_name(), "blog.blogs");
    }
}
