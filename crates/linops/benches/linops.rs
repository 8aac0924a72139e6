use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array, Array1, Array2};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use skigp_linops::{cg, slq, CgParams, LazyMatrix, SlqParams, StructureTags};

fn se_column(m: usize, lengthscale: f64) -> Array1<f64> {
    let h = 1. / (m - 1) as f64;
    Array1::from_shape_fn(m, |i| (-0.5 * (i as f64 * h / lengthscale).powi(2)).exp())
}

fn bench_toeplitz_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("toeplitz_matmul");
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    for m in [32, 256, 2048] {
        let op = LazyMatrix::toeplitz(se_column(m, 0.1));
        let x = Array2::random_using((m, 4), Uniform::new(-1., 1.), &mut rng);
        group.bench_function(BenchmarkId::from_parameter(m), |b| {
            b.iter(|| op.matmul(&x).unwrap());
        });
    }
    group.finish();
}

fn bench_kronecker_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("kronecker_matmul");
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let m = 64;
    let op = LazyMatrix::kronecker(vec![
        LazyMatrix::toeplitz(se_column(m, 0.1)),
        LazyMatrix::toeplitz(se_column(m, 0.2)),
    ])
    .unwrap();
    let x = Array2::random_using((m * m, 1), Uniform::new(-1., 1.), &mut rng);
    group.bench_function(BenchmarkId::from_parameter(m * m), |b| {
        b.iter(|| op.matmul(&x).unwrap());
    });
    group.finish();
}

fn se_operator(n: usize) -> LazyMatrix<f64> {
    let x: Array1<f64> = Array::linspace(0., 1., n);
    let k = Array2::from_shape_fn((n, n), |(i, j)| {
        (-0.5 * ((x[i] - x[j]) / 0.1).powi(2)).exp()
    });
    LazyMatrix::dense(k)
        .with_tags(StructureTags::PSD)
        .add_constant_diag(1e-2)
        .unwrap()
}

fn bench_cg(c: &mut Criterion) {
    let mut group = c.benchmark_group("pcg_solve");
    let n = 500;
    let op = se_operator(n);
    let b = Array2::ones((n, 1));
    for rank in [0, 15] {
        let params = CgParams::with_preconditioner_rank(rank).max_iterations(1000);
        group.bench_function(BenchmarkId::from_parameter(rank), |bch| {
            bch.iter(|| cg::solve(&op, &b, None, &params).unwrap());
        });
    }
    group.finish();
}

fn bench_log_det(c: &mut Criterion) {
    let mut group = c.benchmark_group("slq_log_det");
    group.sample_size(20);
    let op = se_operator(500);
    let params = SlqParams::default();
    group.bench_function(BenchmarkId::from_parameter(500), |b| {
        b.iter(|| slq::log_det(&op, &params).unwrap());
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_toeplitz_matmul,
    bench_kronecker_matmul,
    bench_cg,
    bench_log_det
);
criterion_main!(benches);
