//! Benchmarks for checkpoint save and restore throughput

use checkpoint::{codec, CheckpointManager, SaveOptions};
use checkpoint_core::{ArrayLeaf, CheckpointConfig, Tree};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Model-like tree with `layers` f32 weight matrices of `width * width`
fn model_state(layers: usize, width: usize) -> Tree {
    let weights = vec![0.5f32; width * width];
    Tree::map([
        (
            "params",
            Tree::seq((0..layers).map(|_| {
                Tree::map([
                    (
                        "w",
                        Tree::from(ArrayLeaf::from_f32(vec![width, width], &weights).unwrap()),
                    ),
                    ("b", Tree::from(ArrayLeaf::from_f32(vec![width], &weights[..width]).unwrap())),
                ])
            })),
        ),
        ("step", Tree::from(0i64)),
        ("lr", Tree::from(1e-3f64)),
    ])
}

fn state_bytes(layers: usize, width: usize) -> u64 {
    (layers * (width * width + width) * 4) as u64
}

fn encode_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_encode");

    for width in [64, 256, 1024] {
        let state = model_state(8, width);
        group.throughput(Throughput::Bytes(state_bytes(8, width)));
        group.bench_with_input(BenchmarkId::from_parameter(width), &state, |b, state| {
            b.iter(|| codec::serialize(state).unwrap());
        });
    }

    group.finish();
}

fn save_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("checkpoint_save");
    group.sample_size(20);

    for width in [256, 1024] {
        let state = model_state(8, width);
        group.throughput(Throughput::Bytes(state_bytes(8, width)));
        group.bench_with_input(BenchmarkId::from_parameter(width), &state, |b, state| {
            let temp_dir = TempDir::new().unwrap();
            let mut config = CheckpointConfig::new(temp_dir.path());
            config.retention.keep = 2;
            let manager = rt.block_on(CheckpointManager::new(config)).unwrap();
            let mut step = 0u64;

            b.to_async(&rt).iter(|| {
                step += 1;
                let (manager, step) = (&manager, step);
                async move {
                    manager.save(state, step, SaveOptions::default()).await.unwrap();
                }
            });
        });
    }

    group.finish();
}

fn restore_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("checkpoint_restore");
    group.sample_size(20);

    for width in [256, 1024] {
        let state = model_state(8, width);
        let temp_dir = TempDir::new().unwrap();
        let manager = rt
            .block_on(CheckpointManager::new(CheckpointConfig::new(temp_dir.path())))
            .unwrap();
        rt.block_on(manager.save(&state, 1, SaveOptions::default()))
            .unwrap();

        group.throughput(Throughput::Bytes(state_bytes(8, width)));
        group.bench_function(BenchmarkId::new("untyped", width), |b| {
            b.to_async(&rt)
                .iter(|| async { manager.restore(Some(1), None).await.unwrap() });
        });
        group.bench_function(BenchmarkId::new("typed", width), |b| {
            b.to_async(&rt)
                .iter(|| async { manager.restore(Some(1), Some(&state)).await.unwrap() });
        });
    }

    group.finish();
}

criterion_group!(benches, encode_benchmark, save_benchmark, restore_benchmark);
criterion_main!(benches);
