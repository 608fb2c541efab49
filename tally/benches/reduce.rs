//! Microbenchmarks for the classify → filter → reduce hot path.
//!
//! Run with: `cargo bench -p tally -- reduce`

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tally::classify::Classifier;
use tally::event::Event;
use tally::filter::filter;
use tally::namespace::{GroupRules, NamespaceConfig};
use tally::program::{CodeClass, CodeMatch, FilterProgram, LatencySource, Predicate};
use tally::reduce::Reducer;
use tally::ring::SlabRing;
use tally::slab::Slab;
use tally::window::WindowState;
use tempfile::tempdir;

const S: u64 = 1_000_000_000;

/// A namespace shaped like a production status-code counter.
fn namespace(name: &str, group: &str) -> NamespaceConfig {
    let program = FilterProgram::new(
        Predicate::all([Predicate::eq("domain", group), Predicate::contains("code", "STATUS")]),
        vec![
            CodeClass::new("tech_error", CodeMatch::Equals("STATUS1".to_string()), true),
            CodeClass::new(
                "func_error",
                CodeMatch::OneOf(vec!["STATUS2".to_string(), "STATUS3".to_string()]),
                false,
            ),
        ],
    )
    .with_latency(LatencySource::default());
    NamespaceConfig::new(name, group, Duration::from_secs(60), 60, program).unwrap()
}

fn bench_filter(c: &mut Criterion) {
    let ns = namespace("NS1", "G1");
    let event = Event::new("G1", "STATUS1", 0).with_duration(12.5);

    c.bench_function("filter/status_classes", |b| {
        b.iter(|| filter(black_box(&event), black_box(&ns)).unwrap());
    });
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify/group_count");

    for count in [1u32, 10, 100] {
        let groups: Vec<String> = (0..count).map(|i| format!("G{i}")).collect();
        let classifier = Classifier::new(
            GroupRules::by_domain(groups.iter().map(String::as_str)),
            groups.iter().map(|g| (g.as_str(), g.as_str())),
        );
        // Worst case: the last rule matches.
        let event = Event::new(format!("G{}", count - 1), "STATUS0", 0);

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| classifier.classify(black_box(&event)).unwrap().group.len());
        });
    }

    group.finish();
}

fn bench_reduce_same_bucket(c: &mut Criterion) {
    let ns = namespace("NS1", "G1");
    let sample = filter(&Event::new("G1", "STATUS0", 0).with_duration(3.0), &ns).unwrap();
    let reducer = Reducer::new([Arc::new(ns)]);
    let mut ts = 0u64;

    c.bench_function("reduce/same_bucket", |b| {
        b.iter(|| {
            ts = (ts + 1) % (60 * S);
            reducer.reduce("NS1", black_box(ts), black_box(&sample)).unwrap()
        });
    });
}

fn bench_reduce_rolling(c: &mut Criterion) {
    let ns = namespace("NS1", "G1");
    let sample = filter(&Event::new("G1", "STATUS0", 0).with_duration(3.0), &ns).unwrap();
    let reducer = Reducer::new([Arc::new(ns)]);
    let mut ts = 0u64;

    // Every iteration opens a new bucket and evicts the oldest.
    c.bench_function("reduce/rolling_bucket", |b| {
        b.iter(|| {
            ts += 60 * S;
            reducer.reduce("NS1", black_box(ts), black_box(&sample)).unwrap()
        });
    });
}

fn bench_slab_ring_write(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let ns = namespace("NS1", "G1");
    let fields = ns.metric_fields();
    let slab = Slab::create(
        dir.path().join("bench.slab"),
        ns.layout_hash(),
        ns.cardinality,
        u32::try_from(fields.len()).unwrap(),
        ns.granularity_ns(),
    )
    .unwrap();
    let mut ring = SlabRing::new("NS1", slab, fields).unwrap();
    let state: WindowState = filter(&Event::new("G1", "STATUS2", 0).with_duration(7.0), &ns)
        .unwrap()
        .into();
    let mut bucket = 0u64;

    c.bench_function("slab_ring/write", |b| {
        b.iter(|| {
            bucket += 60 * S;
            ring.write(black_box(bucket), black_box(&state)).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_filter,
    bench_classify,
    bench_reduce_same_bucket,
    bench_reduce_rolling,
    bench_slab_ring_write,
);
criterion_main!(benches);
