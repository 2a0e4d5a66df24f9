use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::Array1;

use levelct::{CoverTree, CoverTreeBuilder, Metric};

const K: usize = 10;
const N: usize = 2000;
const DIMS: usize = 16;

fn dataset(n: usize, seed: u128) -> Vec<Array1<f64>> {
    let mut rng = oorandom::Rand64::new(seed);
    (0..n)
        .map(|_| Array1::from_shape_simple_fn(DIMS, || rng.rand_float()))
        .collect()
}

fn build_tree() -> CoverTree<Array1<f64>, Metric> {
    CoverTreeBuilder::new(Metric::Euclidean)
        .seed(0)
        .build_from(dataset(N, 0))
        .unwrap()
}

fn benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("covertree");
    group.sample_size(10);

    group.bench_function("build", |b| b.iter(build_tree));

    let tree = build_tree();
    let queries = dataset(100, 7);

    group.bench_function("knn", |b| {
        b.iter(|| {
            for q in &queries {
                tree.knn(q, K).unwrap();
            }
        })
    });

    group.bench_function("knn_batch", |b| {
        b.iter(|| tree.knn_batch(&queries, K).unwrap())
    });

    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
