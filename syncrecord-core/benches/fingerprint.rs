//! Benchmarks for the query hot path.
//!
//! Every reactive query fingerprints and compiles its descriptor on each
//! attempt, so both need to stay cheap relative to a backend round trip.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use syncrecord_core::backend::memory::MemoryBackend;
use syncrecord_core::query::QueryCompiler;
use syncrecord_core::{Association, Direction, QueryDescriptor, TableSchema};

static JOBS: TableSchema = TableSchema::new("jobs", &["id", "title"]);
static TASKS: TableSchema =
    TableSchema::new("tasks", &["id", "title", "status", "job_id", "position"])
        .with_associations(&[Association::belongs_to("job", "jobs", "job_id")]);

fn descriptor_with(conditions: usize) -> QueryDescriptor {
    let mut descriptor = QueryDescriptor::new(&TASKS);
    for i in 0..conditions {
        let field = ["status", "job_id", "position", "title"][i % 4];
        descriptor = descriptor
            .where_eq(field, format!("value_{}", i))
            .expect("valid field");
    }
    descriptor
        .order_by("position", Direction::Asc)
        .expect("valid field")
        .includes("job")
        .expect("valid association")
        .limit(50)
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    for conditions in [1, 4, 16] {
        let descriptor = descriptor_with(conditions);
        group.bench_with_input(
            BenchmarkId::from_parameter(conditions),
            &descriptor,
            |b, descriptor| b.iter(|| black_box(descriptor.fingerprint())),
        );
    }
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let backend = MemoryBackend::new();
    backend.seed(&JOBS, [json!({"id": "J1", "title": "Kitchen"})]);
    let compiler = QueryCompiler::new(Arc::new(backend));

    let mut group = c.benchmark_group("compile");
    for conditions in [1, 4, 16] {
        let descriptor = descriptor_with(conditions);
        group.bench_with_input(
            BenchmarkId::from_parameter(conditions),
            &descriptor,
            |b, descriptor| b.iter(|| black_box(compiler.compile(descriptor).is_ok())),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_compile);
criterion_main!(benches);
