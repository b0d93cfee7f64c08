//! Benchmarks for entry classification and usage aggregation
//!
//! Run with: cargo bench

use bq_table_usage::aggregator::UsageAggregator;
use bq_table_usage::filter::{classify, EntryOutcome, IdentityFilter};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

/// Generate audit entries over a small set of users and tables, with some skippable ones mixed in
fn generate_entries(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            let state = if i % 10 == 3 { "RUNNING" } else { "DONE" };
            let tables: Vec<Value> = (0..(i % 4))
                .map(|t| {
                    json!({
                        "projectId": "bench-project",
                        "datasetId": format!("dataset_{}", (i + t) % 5),
                        "tableId": format!("table_{}", (i * 7 + t) % 40)
                    })
                })
                .collect();
            json!({
                "protoPayload": {
                    "authenticationInfo": { "principalEmail": format!("user{}@example.com", i % 25) },
                    "serviceData": { "jobCompletedEvent": { "job": {
                        "jobName": { "projectId": "bench-project", "jobId": format!("job_{}", i) },
                        "jobStatus": { "state": state, "error": {} },
                        "jobStatistics": {
                            "referencedTables": tables,
                            "totalTablesProcessed": i % 4
                        }
                    } } }
                }
            })
        })
        .collect()
}

fn aggregate(entries: &[Value], filter: Option<&IdentityFilter>) -> usize {
    let mut aggregator = UsageAggregator::new();
    for entry in entries {
        if let EntryOutcome::Usage { keys, .. } = classify(entry, filter) {
            for key in keys {
                aggregator.record(key);
            }
        }
    }
    aggregator.finish().len()
}

fn benchmark_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify_and_aggregate");

    for size in [100, 1000, 10000].iter() {
        let entries = generate_entries(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| aggregate(black_box(&entries), None));
        });
    }

    group.finish();
}

fn benchmark_identity_filter(c: &mut Criterion) {
    let entries = generate_entries(1000);
    let filter = IdentityFilter::new(r"user1\d?@").unwrap();

    c.bench_function("classify_with_identity_filter", |b| {
        b.iter(|| aggregate(black_box(&entries), Some(&filter)));
    });
}

criterion_group!(benches, benchmark_aggregation, benchmark_identity_filter);
criterion_main!(benches);
