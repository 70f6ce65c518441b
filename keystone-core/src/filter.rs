//! Row predicates and set-expressions.
//!
//! [`Filter`] is a closed predicate language. The same value is evaluated in
//! memory against cached entities (read-your-writes) and translated by a
//! physical gateway into its native query language, so both sides agree on
//! what a change matches.

use std::cmp::Ordering;

use serde_json::Value;

use crate::entity::Row;

/// Predicate over the columns of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    /// Column value is one of the listed values. An empty list matches
    /// nothing.
    In(String, Vec<Value>),
    /// Column is missing or `null`.
    IsNull(String),
    And(Vec<Self>),
    Or(Vec<Self>),
    Not(Box<Self>),
}

impl Filter {
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    #[must_use]
    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(column.into(), value.into())
    }

    #[must_use]
    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(column.into(), value.into())
    }

    #[must_use]
    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Le(column.into(), value.into())
    }

    #[must_use]
    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(column.into(), value.into())
    }

    #[must_use]
    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge(column.into(), value.into())
    }

    #[must_use]
    pub fn one_of<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    /// Conjunction, flattening nested `And`s and dropping `All`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        let mut parts = Vec::new();
        for filter in [self, other] {
            match filter {
                Self::All => {}
                Self::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Self::All,
            1 => parts.remove(0),
            _ => Self::And(parts),
        }
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match self {
            Self::Or(mut inner) => {
                inner.push(other);
                Self::Or(inner)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluate the predicate against a row.
    ///
    /// Missing columns read as `null`. Numbers compare by value, so `2` equals
    /// `2.0`. Ordering comparisons between values of different JSON types
    /// never match.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::All => true,
            Self::Eq(column, value) => equal(column_value(row, column), value),
            Self::Ne(column, value) => !equal(column_value(row, column), value),
            Self::Lt(column, value) => ordered(row, column, value, Ordering::is_lt),
            Self::Le(column, value) => ordered(row, column, value, Ordering::is_le),
            Self::Gt(column, value) => ordered(row, column, value, Ordering::is_gt),
            Self::Ge(column, value) => ordered(row, column, value, Ordering::is_ge),
            Self::In(column, values) => {
                let actual = column_value(row, column);
                values.iter().any(|value| equal(actual, value))
            }
            Self::IsNull(column) => column_value(row, column).is_null(),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(row)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(row)),
            Self::Not(filter) => !filter.matches(row),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::All
    }
}

static NULL: Value = Value::Null;

fn column_value<'a>(row: &'a Row, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&NULL)
}

fn ordered(row: &Row, column: &str, value: &Value, accept: fn(Ordering) -> bool) -> bool {
    compare(column_value(row, column), value).is_some_and(accept)
}

fn equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => compare(left, right) == Some(Ordering::Equal),
        (Value::Array(l), Value::Array(r)) => {
            l.len() == r.len() && l.iter().zip(r).all(|(l, r)| equal(l, r))
        }
        (Value::Object(l), Value::Object(r)) => {
            l.len() == r.len()
                && l.iter()
                    .all(|(key, l)| r.get(key).is_some_and(|r| equal(l, r)))
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
                Some(l.cmp(&r))
            } else {
                l.as_f64()?.partial_cmp(&r.as_f64()?)
            }
        }
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// A single set-expression: write `value` into `column`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

impl Assignment {
    #[must_use]
    pub fn set(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn apply(&self, row: &mut Row) {
        row.insert(self.column.clone(), self.value.clone());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(row) => row,
            _ => unreachable!("test rows are objects"),
        }
    }

    #[test]
    fn equality_and_membership() {
        let user = row(json!({"id": 2, "nickname": "A"}));
        assert!(Filter::eq("nickname", "A").matches(&user));
        assert!(!Filter::eq("nickname", "B").matches(&user));
        assert!(Filter::ne("nickname", "B").matches(&user));
        assert!(Filter::one_of("id", [1, 2, 3]).matches(&user));
        assert!(!Filter::one_of("id", Vec::<i64>::new()).matches(&user));
    }

    #[test]
    fn numbers_compare_by_value() {
        let entry = row(json!({"score": 2.0, "tags": [1, {"weight": 3}]}));
        assert!(Filter::eq("score", 2).matches(&entry));
        assert!(!Filter::ne("score", 2).matches(&entry));
        assert!(Filter::one_of("score", [1, 2]).matches(&entry));
        assert!(!Filter::eq("score", 2.5).matches(&entry));
        assert!(Filter::eq("tags", json!([1.0, {"weight": 3.0}])).matches(&entry));
        assert!(!Filter::eq("score", "2").matches(&entry));
    }

    #[test]
    fn ordering_compares_numbers_and_strings() {
        let entry = row(json!({"amount": 10, "score": 2.5, "name": "m"}));
        assert!(Filter::gt("amount", 9).matches(&entry));
        assert!(Filter::le("amount", 10).matches(&entry));
        assert!(!Filter::lt("amount", 10).matches(&entry));
        assert!(Filter::ge("score", 2).matches(&entry));
        assert!(Filter::lt("name", "z").matches(&entry));
        assert!(!Filter::lt("name", 5).matches(&entry));
    }

    #[test]
    fn missing_columns_read_as_null() {
        let entry = row(json!({"id": 1}));
        assert!(Filter::is_null("deleted_at").matches(&entry));
        assert!(!Filter::gt("deleted_at", 0).matches(&entry));
    }

    #[test]
    fn and_flattens_and_drops_all() {
        let combined = Filter::All
            .and(Filter::eq("a", 1))
            .and(Filter::eq("b", 2).and(Filter::eq("c", 3)));
        assert_eq!(
            combined,
            Filter::And(vec![
                Filter::eq("a", 1),
                Filter::eq("b", 2),
                Filter::eq("c", 3)
            ])
        );
        assert_eq!(Filter::All.and(Filter::All), Filter::All);
        assert_eq!(Filter::All.and(Filter::eq("a", 1)), Filter::eq("a", 1));
    }

    #[test]
    fn or_and_not_compose() {
        let entry = row(json!({"id": 5}));
        let filter = Filter::eq("id", 1).or(Filter::eq("id", 5));
        assert!(filter.matches(&entry));
        assert!(!filter.clone().not().matches(&entry));
    }

    #[test]
    fn assignment_overwrites_column() {
        let mut entry = row(json!({"nickname": "A"}));
        Assignment::set("nickname", "B").apply(&mut entry);
        assert_eq!(entry.get("nickname"), Some(&json!("B")));
    }
}
