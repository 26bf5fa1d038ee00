//! Benchmarks for plan validation, scheduling and resource claims.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kv_plan_exec::engine::scheduler::OpScheduler;
use kv_plan_exec::engine::validator::validate;
use kv_plan_exec::plan::schema::{CachePlan, KvPageRef, Plan, TransferKind, TransferOp};
use kv_plan_exec::resource::extent::{ExtentProvider, ExtentTable};
use kv_plan_exec::resource::key::op_keys;
use kv_plan_exec::resource::registry::ResourceRegistry;

const PAGE: u64 = 4096;

/// 2,000 page uploads spread over four GPUs, each followed by a read-back
/// of the same page.
fn large_plan() -> Plan {
    let mut ops = Vec::new();
    for i in 0..1_000u64 {
        let gpu = format!("gpu://{}/kv", i % 4);
        let page = KvPageRef::new("layer0", i, 0, 0);
        ops.push(
            TransferOp::new(TransferKind::H2D, "host://0/staging", &gpu, PAGE)
                .with_offsets(i * PAGE, i * PAGE)
                .with_kv_refs([page.clone()]),
        );
        ops.push(
            TransferOp::new(TransferKind::D2H, &gpu, "host://0/readback", PAGE)
                .with_offsets(i * PAGE, i * PAGE)
                .with_kv_refs([page]),
        );
    }
    CachePlan::new("bench", ops).into()
}

fn extents() -> ExtentTable {
    let size = 1_000 * PAGE;
    (0..4).fold(
        ExtentTable::new()
            .with("host://0/staging", size)
            .with("host://0/readback", size),
        |table, gpu| table.with(&format!("gpu://{gpu}/kv"), size),
    )
}

fn bench_validate_and_schedule(c: &mut Criterion) {
    let plan = Arc::new(large_plan());
    let extents = extents();
    let scheduler = OpScheduler::default();

    c.bench_function("validate_2k_ops", |b| {
        b.iter(|| {
            let validated = validate(Arc::clone(&plan), &extents as &dyn ExtentProvider, 0);
            black_box(validated.is_ok());
        })
    });

    let validated = match validate(Arc::clone(&plan), &extents as &dyn ExtentProvider, 0) {
        Ok(validated) => validated,
        Err(err) => panic!("bench plan is invalid: {err}"),
    };
    c.bench_function("schedule_2k_ops", |b| {
        b.iter(|| {
            let graph = scheduler.schedule(black_box(&validated), 0);
            black_box(graph.is_ok());
        })
    });
}

fn bench_registry_churn(c: &mut Criterion) {
    let keys: Vec<_> = match large_plan() {
        Plan::Cache(cache) => cache.ops.iter().take(64).map(op_keys).collect(),
        Plan::Swap(_) => unreachable!(),
    };

    c.bench_function("registry_acquire_release_64_ops", |b| {
        let mut registry = ResourceRegistry::new();
        b.iter(|| {
            for op in &keys {
                let _ = registry.acquire(black_box(op), "bench");
            }
            for op in &keys {
                let _ = registry.release(black_box(op), "bench");
            }
        })
    });
}

criterion_group!(benches, bench_validate_and_schedule, bench_registry_churn);
criterion_main!(benches);
