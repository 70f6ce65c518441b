//! Benchmarks for model diffing and in-memory transaction commits.
//!
//! Run with: `cargo bench -p keystone-core`

use std::{hint::black_box, sync::OnceLock};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use keystone_core::{
    entity::{ColumnInfo, Entity, EntityInfo},
    filter::{Assignment, Filter},
    gateway::{InsertBehavior, inmemory},
    model::{
        DatabaseNode, DependencyOrder, IndexNode, ModelChangesSorter, ModelComparator, SchemaNode,
        StructuralComparator, TableNode, ViewNode,
    },
    transaction::DatabaseTransaction,
};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

fn get_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new().expect("Failed to create Tokio runtime"))
}

/// `schemas` schemas of 20 tables with 12 columns, a view and an index each.
fn model(schemas: usize) -> DatabaseNode {
    DatabaseNode {
        name: "bench".into(),
        schemas: (0..schemas)
            .map(|s| {
                let schema = format!("s{s}");
                SchemaNode {
                    tables: (0..20)
                        .map(|t| {
                            (0..12).fold(
                                TableNode::new(schema.clone(), format!("t{t}")).with_key("c0"),
                                |table, c| table.with_column(&format!("c{c}"), "bigint", c > 0),
                            )
                        })
                        .collect(),
                    views: vec![ViewNode::new(schema.clone(), "v", "SELECT 1")],
                    indexes: vec![IndexNode {
                        schema: schema.clone(),
                        table: "t0".into(),
                        name: "ix_t0_c1".into(),
                        columns: vec!["c1".into()],
                        unique: false,
                    }],
                    ..SchemaNode::new(schema)
                }
            })
            .collect(),
    }
}

fn bench_extract_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_diff");
    for schemas in [1, 10, 50] {
        let expected = model(schemas);
        let mut actual = expected.clone();
        for schema in &mut actual.schemas {
            schema.tables[0].columns.pop();
            schema.views[0].query = "SELECT 2".into();
        }
        group.throughput(Throughput::Elements(schemas as u64 * 20));

        group.bench_with_input(BenchmarkId::new("identical", schemas), &expected, |b, m| {
            b.iter(|| StructuralComparator.extract_diff(black_box(Some(m)), black_box(Some(m))));
        });
        group.bench_with_input(BenchmarkId::new("drifted", schemas), &expected, |b, m| {
            b.iter(|| {
                let changes = StructuralComparator
                    .extract_diff(black_box(Some(&actual)), black_box(Some(m)))
                    .unwrap();
                DependencyOrder.sort(changes)
            });
        });
        group.bench_with_input(BenchmarkId::new("from_scratch", schemas), &expected, |b, m| {
            b.iter(|| StructuralComparator.extract_diff(None, black_box(Some(m))));
        });
    }
    group.finish();
}

#[derive(Clone, Serialize, Deserialize)]
struct Counter {
    id: i64,
    value: i64,
    version: i64,
}

impl Entity for Counter {
    type Key = i64;

    fn info() -> &'static EntityInfo {
        static INFO: EntityInfo = EntityInfo {
            name: "Counter",
            schema: "bench",
            table: "counters",
            key: "id",
            version: "version",
            columns: &[
                ColumnInfo {
                    name: "id",
                    data_type: "bigint",
                    nullable: false,
                },
                ColumnInfo {
                    name: "value",
                    data_type: "bigint",
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

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    for rows in [10_i64, 100] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("insert_update", rows), &rows, |b, &rows| {
            b.to_async(get_runtime()).iter(|| async move {
                let mut tx = DatabaseTransaction::new(inmemory::Database::new());
                let counters = (0..rows)
                    .map(|id| Counter {
                        id,
                        value: 0,
                        version: 0,
                    })
                    .collect();
                tx.insert(counters, InsertBehavior::Default).unwrap();
                tx.update::<Counter>(Filter::All, vec![Assignment::set("value", 1)])
                    .await
                    .unwrap();
                tx.close(true).await.unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_extract_diff, bench_commit);
criterion_main!(benches);
