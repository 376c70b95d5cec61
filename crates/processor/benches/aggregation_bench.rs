//! Window assignment and incremental aggregation throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use processor::config::{AggregateDef, AggregateFunction, AggregationSpec, WindowSpec};
use processor::watermark::Watermark;
use processor::window::{SlidingWindowAssigner, TumblingWindowAssigner, WindowAssigner, WindowOperator};
use serde_json::json;
use stream_analytics_types::Event;

fn spec(window: WindowSpec) -> AggregationSpec {
    AggregationSpec::new(
        "bench",
        window,
        vec![
            AggregateDef::new("*", AggregateFunction::Count, "count"),
            AggregateDef::new("latency", AggregateFunction::Avg, "avg_latency"),
            AggregateDef::new("latency", AggregateFunction::Max, "max_latency"),
            AggregateDef::new("latency", AggregateFunction::Percentile, "p99").with_percentile(99.0),
            AggregateDef::new("user", AggregateFunction::Distinct, "users"),
        ],
    )
    .group_by(&["region"])
}

fn events(n: usize) -> Vec<Event> {
    let regions = ["eu", "us", "ap"];
    (0..n)
        .map(|i| {
            Event::at_millis(
                json!({
                    "region": regions[i % regions.len()],
                    "user": format!("u{}", i % 997),
                    "latency": (i % 250) as f64 * 1.5,
                }),
                i as i64 * 10,
            )
        })
        .collect()
}

fn bench_assignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_assignment");
    group.throughput(Throughput::Elements(1));

    let tumbling = TumblingWindowAssigner::new(60_000);
    group.bench_function("tumbling", |b| {
        b.iter(|| black_box(tumbling.assign_windows(black_box(1_700_000_123_456))))
    });

    let sliding = SlidingWindowAssigner::new(60_000, 10_000);
    group.bench_function("sliding_6_panes", |b| {
        b.iter(|| black_box(sliding.assign_windows(black_box(1_700_000_123_456))))
    });

    group.finish();
}

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation_throughput");

    for batch_size in [100, 1_000, 10_000] {
        let batch = events(batch_size);
        group.throughput(Throughput::Elements(batch_size as u64));

        for (name, window) in [
            ("tumbling", WindowSpec::tumbling(60_000)),
            ("sliding", WindowSpec::sliding(60_000, 15_000)),
            ("session", WindowSpec::session(5_000)),
        ] {
            let specs = [spec(window)];
            group.bench_with_input(BenchmarkId::new(name, batch_size), &batch, |b, batch| {
                b.iter(|| {
                    let mut operator = WindowOperator::new(&specs).unwrap();
                    for event in batch {
                        black_box(operator.process(event, Watermark::min(), 0).unwrap());
                    }
                    black_box(operator.flush().len())
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_assignment, bench_aggregation);
criterion_main!(benches);
