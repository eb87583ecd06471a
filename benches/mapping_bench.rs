//! Criterion benchmarks for the mapping executor.
//!
//! Measures the cost of a full map_part call: part copy, statement
//! evaluation, assignment application, and materialization.
//!
//! Run:
//!   cargo bench
//!   cargo bench -- map_part   # one group

use bloblang::{
    new_arithmetic_expression, ArithmeticOperator, Assignment, Executor, FieldFunction, Literal,
    MessageBatch, Part, Statement, Value,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

// ── Data builders ─────────────────────────────────────────────────────────────

/// A flat order document, the shape of a typical enrichment input.
fn order_payload() -> String {
    json!({
        "id": "o-1234",
        "customer": {"name": "Ada", "tier": "gold"},
        "items": [
            {"sku": "a", "price": 12.5, "qty": 2},
            {"sku": "b", "price": 7.25, "qty": 1}
        ],
        "total": 32.25,
        "discard": "scratch data"
    })
    .to_string()
}

fn enrichment_mapping() -> Executor {
    Executor::new(vec![
        Statement::new(0, Assignment::json("customer"), FieldFunction::boxed("customer.name")),
        Statement::new(1, Assignment::json("tier"), FieldFunction::boxed("customer.tier")),
        Statement::new(2, Assignment::json("discard"), Literal::boxed(Value::Delete)),
        Statement::new(3, Assignment::meta("order_id"), FieldFunction::boxed("id")),
    ])
}

fn arithmetic_mapping() -> Executor {
    let expr = new_arithmetic_expression(
        vec![
            FieldFunction::boxed("total"),
            Literal::boxed(Value::Float(0.2)),
            FieldFunction::boxed("total"),
        ],
        vec![ArithmeticOperator::Mul, ArithmeticOperator::Add],
    )
    .expect("expression builds");
    Executor::new(vec![Statement::new(0, Assignment::json("grand_total"), expr)])
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_map_part(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_part");

    let mut batch = MessageBatch::new();
    batch.push(Part::new(order_payload()));

    let enrich = enrichment_mapping();
    group.bench_function("enrichment", |b| {
        b.iter(|| {
            let out = enrich.map_part(0, black_box(&batch)).expect("mapping runs");
            black_box(out)
        })
    });

    let arith = arithmetic_mapping();
    group.bench_function("arithmetic", |b| {
        b.iter(|| {
            let out = arith.map_part(0, black_box(&batch)).expect("mapping runs");
            black_box(out)
        })
    });

    group.finish();
}

fn bench_query_part(c: &mut Criterion) {
    let mut batch = MessageBatch::new();
    batch.push(Part::new(order_payload()));

    let expr = new_arithmetic_expression(
        vec![
            FieldFunction::boxed("total"),
            Literal::boxed(Value::Float(10.0)),
        ],
        vec![ArithmeticOperator::Gt],
    )
    .expect("expression builds");
    let check = Executor::new(vec![Statement::new(0, Assignment::json_root(), expr)]);

    c.bench_function("query_part/threshold_check", |b| {
        b.iter(|| black_box(check.query_part(0, black_box(&batch)).expect("query runs")))
    });
}

criterion_group!(benches, bench_map_part, bench_query_part);
criterion_main!(benches);
