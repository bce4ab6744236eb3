//! Flurry benchmark suite.
//!
//! Benchmarks for the per-record hot path:
//! - Schema validation throughput
//! - Keyword scoring throughput
//! - Validate + enrich of a full batch

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

mod bench_utils;

use flurry::config::EnrichmentConfig;
use flurry::transform::{Enricher, KeywordScorer, SchemaValidator, Scorer};

fn keywords() -> KeywordScorer {
    KeywordScorer::new(["rust", "tokio", "async", "lifetime"])
}

fn validation_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");
    let validator = SchemaValidator::new();

    for size in [100, 1000, 10000] {
        let records = bench_utils::generate_records(size, 0.05);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("validate", size), &records, |b, records| {
            b.iter(|| {
                records
                    .iter()
                    .filter(|r| validator.validate(black_box(r)).is_ok())
                    .count()
            })
        });
    }

    group.finish();
}

fn scoring_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("scoring");
    let scorer = keywords();

    for words in [20, 200, 2000] {
        let text = bench_utils::generate_text(words);
        group.throughput(Throughput::Elements(words as u64));

        group.bench_with_input(BenchmarkId::new("keyword", words), &text, |b, text| {
            b.iter(|| scorer.score(black_box(text)))
        });
    }

    group.finish();
}

fn transform_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform");
    let validator = SchemaValidator::new();
    let enricher = Enricher::new(Arc::new(keywords()), &EnrichmentConfig::default());

    for size in [500, 5000] {
        let records = bench_utils::generate_records(size, 0.05);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(
            BenchmarkId::new("validate_enrich", size),
            &records,
            |b, records| {
                b.iter(|| {
                    records
                        .iter()
                        .filter_map(|r| validator.validate(r).ok())
                        .filter_map(|parsed| enricher.enrich(parsed).ok())
                        .count()
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    validation_benchmarks,
    scoring_benchmarks,
    transform_benchmarks
);
criterion_main!(benches);
