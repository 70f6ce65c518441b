//! Translation of commands, queries and filters into `PostgreSQL`.
//!
//! Rows travel as `jsonb`: reads select `to_jsonb(t)`, writes go through
//! `jsonb_populate_record(set)`, and filters compare `to_jsonb(t) -> column`
//! with bound `jsonb` values. Column names are always bound or quoted, never
//! interpolated raw.

use keystone_core::{
    entity::{EntityInfo, Row},
    filter::{Assignment, Filter},
    gateway::{Command, InsertBehavior, Query},
};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, types::Json};

/// Quote an identifier, doubling embedded quotes.
pub(crate) fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// `"schema"."table"`
pub(crate) fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

fn table(entity: &EntityInfo) -> String {
    qualified(entity.schema, entity.table)
}

fn push_column(qb: &mut QueryBuilder<'_, Postgres>, column: &str) {
    qb.push("(to_jsonb(t) -> ")
        .push_bind(column.to_owned())
        .push(")");
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    qb.push_bind(Json(value.clone())).push("::jsonb");
}

fn push_ordered(qb: &mut QueryBuilder<'_, Postgres>, column: &str, operator: &str, value: &Value) {
    // Values of different JSON types never compare.
    qb.push("(jsonb_typeof");
    push_column(qb, column);
    qb.push(" = jsonb_typeof(");
    push_value(qb, value);
    qb.push(") AND ");
    push_column(qb, column);
    qb.push(" ").push(operator).push(" ");
    push_value(qb, value);
    qb.push(")");
}

fn push_all(qb: &mut QueryBuilder<'_, Postgres>, filters: &[Filter], joiner: &str, empty: &str) {
    if filters.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            qb.push(joiner);
        }
        push_filter(qb, filter);
    }
    qb.push(")");
}

/// Append `filter` as a boolean SQL expression over the row alias `t`.
pub(crate) fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Eq(column, value) => {
            qb.push("coalesce(");
            push_column(qb, column);
            qb.push(", 'null'::jsonb) = ");
            push_value(qb, value);
        }
        Filter::Ne(column, value) => {
            qb.push("coalesce(");
            push_column(qb, column);
            qb.push(", 'null'::jsonb) <> ");
            push_value(qb, value);
        }
        Filter::Lt(column, value) => push_ordered(qb, column, "<", value),
        Filter::Le(column, value) => push_ordered(qb, column, "<=", value),
        Filter::Gt(column, value) => push_ordered(qb, column, ">", value),
        Filter::Ge(column, value) => push_ordered(qb, column, ">=", value),
        Filter::In(column, values) => {
            qb.push("coalesce(");
            push_column(qb, column);
            qb.push(", 'null'::jsonb) IN (SELECT jsonb_array_elements(");
            push_value(qb, &Value::Array(values.clone()));
            qb.push("))");
        }
        Filter::IsNull(column) => {
            qb.push("coalesce(");
            push_column(qb, column);
            qb.push(", 'null'::jsonb) = 'null'::jsonb");
        }
        Filter::And(filters) => push_all(qb, filters, " AND ", "TRUE"),
        Filter::Or(filters) => push_all(qb, filters, " OR ", "FALSE"),
        Filter::Not(inner) => {
            qb.push("NOT coalesce(");
            push_filter(qb, inner);
            qb.push(", FALSE)");
        }
    }
}

pub(crate) fn select(query: &Query) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT to_jsonb(t) FROM ");
    qb.push(table(query.entity)).push(" AS t WHERE ");
    push_filter(&mut qb, &query.filter);
    qb
}

fn assignments_object(assignments: &[Assignment]) -> Value {
    Value::Object(
        assignments
            .iter()
            .map(|a| (a.column.clone(), a.value.clone()))
            .collect(),
    )
}

pub(crate) fn command(command: &Command) -> QueryBuilder<'static, Postgres> {
    match command {
        Command::Insert {
            entity,
            rows,
            behavior,
        } => insert(entity, rows, *behavior),
        Command::Update {
            entity,
            filter,
            assignments,
        } => {
            let target = table(entity);
            let mut qb = QueryBuilder::new("UPDATE ");
            qb.push(&target).push(" AS t SET ");
            if assignments.is_empty() {
                // Nothing to set: touch the key so the statement still counts
                // matching rows.
                let key = quote(entity.key);
                qb.push(format!("{key} = t.{key}"));
            }
            for (i, assignment) in assignments.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                let column = quote(&assignment.column);
                qb.push(format!("{column} = (jsonb_populate_record(NULL::{target}, "));
                push_value(&mut qb, &assignments_object(assignments));
                qb.push(format!(")).{column}"));
            }
            qb.push(" WHERE ");
            push_filter(&mut qb, filter);
            qb
        }
        Command::Delete { entity, filter } => {
            let mut qb = QueryBuilder::new("DELETE FROM ");
            qb.push(table(entity)).push(" AS t WHERE ");
            push_filter(&mut qb, filter);
            qb
        }
    }
}

fn insert(entity: &EntityInfo, rows: &[Row], behavior: InsertBehavior) -> QueryBuilder<'static, Postgres> {
    let target = table(entity);
    let mut qb = QueryBuilder::new("INSERT INTO ");
    qb.push(&target)
        .push(format!(" SELECT * FROM jsonb_populate_recordset(NULL::{target}, "));
    push_value(&mut qb, &Value::Array(rows.iter().cloned().map(Value::Object).collect()));
    qb.push(")");
    match behavior {
        InsertBehavior::Default => {}
        InsertBehavior::DoNothing => {
            qb.push(format!(" ON CONFLICT ({}) DO NOTHING", quote(entity.key)));
        }
        InsertBehavior::DoUpdate => {
            let updates: Vec<String> = entity
                .columns
                .iter()
                .filter(|column| !column.name.eq_ignore_ascii_case(entity.key))
                .map(|column| {
                    let column = quote(column.name);
                    format!("{column} = EXCLUDED.{column}")
                })
                .collect();
            if updates.is_empty() {
                qb.push(format!(" ON CONFLICT ({}) DO NOTHING", quote(entity.key)));
            } else {
                qb.push(format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    quote(entity.key),
                    updates.join(", ")
                ));
            }
        }
    }
    qb
}
