//! Benchmarks for partitioned execution and placeholder resolution

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::hint::black_box;
use std::sync::Arc;
use strata::chunk::{AggregatorKind, ChunkProcessor, MemoryCheckpointStore, PartitionBound};
use strata::resolver::{ParameterResolver, Scopes};
use strata::{Action, ActionResult, ExecutionContext};
use tokio::runtime::Runtime;

struct Passthrough;

#[async_trait]
impl Action for Passthrough {
    async fn execute(&self, params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        ActionResult::success(params["rows"].clone())
    }
}

fn dataset(rows: usize) -> Value {
    Value::Array(
        (0..rows)
            .map(|i| json!({ "id": i, "name": format!("protein_{i}"), "score": i as f64 / 7.0 }))
            .collect(),
    )
}

fn bench_partitioning(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let params = json!({ "rows": dataset(10_000) });
    let mut group = c.benchmark_group("chunk_processor");

    for partition_rows in [100usize, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("concat", partition_rows),
            &partition_rows,
            |b, &partition_rows| {
                b.iter(|| {
                    runtime.block_on(async {
                        let processor = ChunkProcessor::wrap(
                            Arc::new(Passthrough),
                            "rows",
                            PartitionBound::Rows(partition_rows),
                            AggregatorKind::Concat.build(),
                        );
                        let mut context = ExecutionContext::new("bench", "bench");
                        black_box(processor.execute(&params, &mut context).await)
                    })
                })
            },
        );
    }

    group.bench_function("concat_with_checkpoints", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let processor = ChunkProcessor::wrap(
                    Arc::new(Passthrough),
                    "rows",
                    PartitionBound::Rows(1_000),
                    AggregatorKind::Concat.build(),
                )
                .with_checkpoints(Arc::new(MemoryCheckpointStore::new()), "bench/step");
                let mut context = ExecutionContext::new("bench", "bench");
                black_box(processor.execute(&params, &mut context).await)
            })
        })
    });

    group.finish();
}

fn bench_resolution(c: &mut Criterion) {
    let resolver = ParameterResolver::default();
    let scopes = Scopes::new()
        .with_scope("parameters", json!({ "threshold": 0.8, "input": "/data/vendors.csv" }))
        .with_scope("rows", dataset(1_000));
    let params = json!({
        "path": "${parameters.input}",
        "label": "threshold ${parameters.threshold} on ${rows[10].name}",
        "rows": "${rows}",
    });

    c.bench_function("resolve_step_params", |b| {
        b.iter(|| black_box(resolver.resolve(black_box(&params), &scopes).unwrap()))
    });
}

criterion_group!(benches, bench_partitioning, bench_resolution);
criterion_main!(benches);
