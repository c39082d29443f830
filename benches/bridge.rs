use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use duplex_audio_io::audio::{
    buffer::{bridge, bridge_capacity},
    format::{FormatAdapter, LinearResampler, StreamFormat},
};

fn bridge_period(c: &mut Criterion) {
    let mut group = c.benchmark_group("bridge");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("write_read_256_stereo", |b| {
        let (mut producer, mut consumer) = bridge::<f32>(bridge_capacity(48_000, 256), 2);
        let period = vec![0.25f32; 256 * 2];
        let mut out = vec![0.0f32; 256 * 2];

        b.iter(|| {
            producer.write(black_box(&period));
            black_box(consumer.read_into(&mut out));
        });
    });

    group.finish();
}

fn resample_period(c: &mut Criterion) {
    let mut group = c.benchmark_group("format");

    group.bench_function("resample_44k1_to_48k_256", |b| {
        let mut resampler = LinearResampler::new(44_100, 48_000, 2);
        let input: Vec<f32> = (0..256 * 2).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut output = vec![0.0f32; resampler.max_output_frames(256) * 2];

        b.iter(|| black_box(resampler.process(black_box(&input), &mut output)));
    });

    group.bench_function("adapt_mono_44k1_to_stereo_48k_256", |b| {
        let mut adapter = FormatAdapter::new(StreamFormat::new(44_100, 1), StreamFormat::new(48_000, 2), 256);
        let input: Vec<f32> = (0..256).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut output = vec![0.0f32; adapter.max_output_frames(256) * 2];

        b.iter(|| black_box(adapter.convert(black_box(&input), 256, &mut output)));
    });

    group.finish();
}

criterion_group!(benches, bridge_period, resample_period);
criterion_main!(benches);
