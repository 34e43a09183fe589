use criterion::{criterion_group, criterion_main, Bencher, BenchmarkId, Criterion};
use sphar::conv::{Convolver, FilterSet};

use rand::Rng;

const CHANNELS: usize = 2;

fn bench_convolver(b: &mut Bencher, partitioned: bool, block_len: usize, filt_len: usize) {
    let mut taps = vec![0.0; CHANNELS * filt_len];
    rand::thread_rng().fill(taps.as_mut_slice());

    let filters = FilterSet::new(taps, filt_len, CHANNELS, 48000.0).unwrap();

    let mut input = vec![vec![0.0; block_len]; CHANNELS];
    let mut output = vec![vec![0.0; block_len]; CHANNELS];

    for ch in input.iter_mut() {
        rand::thread_rng().fill(ch.as_mut_slice());
    }

    let mut convolver = Convolver::builder(block_len)
        .with_partitioned(partitioned)
        .build(&filters)
        .unwrap();

    b.iter(|| convolver.process_block(&input, &mut output));
}

fn bench_filter_len(c: &mut Criterion) {
    let mut group = c.benchmark_group("Filter Lengths");
    for i in [8, 16, 32, 64, 128, 256, 1024, 4096, 65536].iter() {
        group.bench_with_input(BenchmarkId::new("partitioned", i), i, |b, i| {
            bench_convolver(b, true, 1024, *i)
        });
        group.bench_with_input(BenchmarkId::new("single", i), i, |b, i| {
            bench_convolver(b, false, 1024, *i)
        });
    }
    group.finish();
}

fn bench_block_len(c: &mut Criterion) {
    let mut group = c.benchmark_group("Block Lengths");
    for i in [8, 16, 32, 64, 128, 256, 1024, 4096].iter() {
        group.bench_with_input(BenchmarkId::new("partitioned", i), i, |b, i| {
            bench_convolver(b, true, *i, 1024)
        });
        group.bench_with_input(BenchmarkId::new("single", i), i, |b, i| {
            bench_convolver(b, false, *i, 1024)
        });
    }
    group.finish();
}

criterion_group!(benches, bench_block_len, bench_filter_len);
criterion_main!(benches);
