use criterion::{criterion_group, criterion_main, Bencher, BenchmarkId, Criterion};
use sphar::binauraliser::Binauraliser;
use sphar::fifo::FrameProcessor;
use sphar::rotation::{euler_to_rotation, sh_rotation, EulerOrder};

use rand::Rng;

const FRAME: usize = 512;

fn bench_binauraliser(b: &mut Bencher, sources: usize, near_field: bool) {
    let mut binauraliser = Binauraliser::builder()
        .with_frame_size(FRAME)
        .with_num_sources(sources)
        .build()
        .unwrap();

    let params = binauraliser.params();
    let mut rng = rand::thread_rng();

    for i in 0..sources {
        params.set_source_direction(i, rng.gen_range(-180.0..180.0), rng.gen_range(-90.0..90.0));
        params.set_source_distance(i, 0.5);
    }
    params.set_near_field(near_field);
    params.set_rotation(true);

    let mut input = vec![vec![0.0; FRAME]; sources];
    let mut output = vec![vec![0.0; FRAME]; 2];

    for ch in input.iter_mut() {
        rng.fill(ch.as_mut_slice());
    }

    let mut yaw = 0.0;
    b.iter(|| {
        // force filter updates every frame
        yaw = (yaw + 1.0) % 180.0;
        params.set_yaw(yaw);
        binauraliser.process(&input, &mut output, FRAME, true)
    });
}

fn bench_sources(c: &mut Criterion) {
    let mut group = c.benchmark_group("Binauraliser Sources");
    for i in [1, 4, 16, 64].iter() {
        group.bench_with_input(BenchmarkId::new("far", i), i, |b, i| {
            bench_binauraliser(b, *i, false)
        });
        group.bench_with_input(BenchmarkId::new("near", i), i, |b, i| {
            bench_binauraliser(b, *i, true)
        });
    }
    group.finish();
}

fn bench_sh_rotation(c: &mut Criterion) {
    let mut group = c.benchmark_group("SH Rotation");
    for order in [1, 3, 5, 7].iter() {
        let n = (order + 1) * (order + 1);
        let mut out = vec![0.0; n * n];
        let r = euler_to_rotation(0.5, 0.3, 0.2, EulerOrder::YawPitchRoll);
        group.bench_with_input(BenchmarkId::new("order", order), order, |b, order| {
            b.iter(|| sh_rotation(&r, *order, &mut out))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sources, bench_sh_rotation);
criterion_main!(benches);
