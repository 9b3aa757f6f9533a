use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use reqscore::drain::{MinerConfig, TemplateMiner};
use reqscore::normalize::normalize;
use reqscore::pipeline::PreprocessingPipeline;

const PATHS: [&str; 6] = [
    "/api/users/{id}/profile",
    "/api/orders/{id}",
    "/static/js/app.{id}.js",
    "/search?q=shoes&page={id}",
    "/blog/posts/{id}/comments",
    "/admin/login",
];

fn signatures(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let path = PATHS[i % PATHS.len()].replace("{id}", &(i * 7919 % 100_000).to_string());
            format!("GET {} 200 NO_PARAMS Mozilla/5.0", path)
        })
        .collect()
}

fn log_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let path = PATHS[i % PATHS.len()].replace("{id}", &(i * 31 % 5000).to_string());
            format!(
                r#"10.0.{}.{} - - [23/Sep/2025:10:30:00 +0000] "GET {} HTTP/1.1" 200 {} "-" "Mozilla/5.0 (X11; Linux x86_64)""#,
                i % 256,
                i % 200,
                path,
                512 + i % 1024
            )
        })
        .collect()
}

fn bench_normalize(c: &mut Criterion) {
    let lines = signatures(1_000);
    c.bench_function("normalize_signature", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(normalize(black_box(line)));
            }
        });
    });
}

fn bench_miner_add(c: &mut Criterion) {
    let lines: Vec<String> = signatures(10_000).iter().map(|s| normalize(s)).collect();
    c.bench_function("miner_add_10k", |b| {
        b.iter_batched(
            || TemplateMiner::new(MinerConfig::default()).unwrap(),
            |mut miner| {
                for line in &lines {
                    black_box(miner.add(line));
                }
                miner
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_miner_eviction(c: &mut Criterion) {
    let config = MinerConfig {
        max_clusters: 8,
        ..MinerConfig::default()
    };
    let lines: Vec<String> = (0..5_000)
        .map(|i| format!("GET /route{} {} x{}", i % 64, i % 5, i % 97))
        .collect();
    c.bench_function("miner_eviction_churn", |b| {
        b.iter_batched(
            || TemplateMiner::new(config.clone()).unwrap(),
            |mut miner| {
                for line in &lines {
                    black_box(miner.add(line));
                }
                miner
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let lines = log_lines(2_000);
    c.bench_function("preprocess_2k_lines", |b| {
        b.iter_batched(
            || PreprocessingPipeline::new(MinerConfig::default()).unwrap(),
            |mut pipeline| {
                for line in &lines {
                    let _ = black_box(pipeline.process_line(line));
                }
                pipeline
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    bench_normalize,
    bench_miner_add,
    bench_miner_eviction,
    bench_pipeline
);
criterion_main!(benches);
