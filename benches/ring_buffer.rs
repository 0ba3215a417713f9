//! Real-time path throughput
//!
//! One 5 ms stereo packet through the ring buffer, and one 5.1 packet through
//! the spatial mixer. Both run on every hardware callback, so they should be
//! orders of magnitude faster than real time.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gamestream_audio::audio::buffer::{bytes_to_samples, samples_as_bytes, RingBuffer};
use gamestream_audio::audio::{
    ChannelLayout, DeviceProfile, OutputType, RenderTimestamp, Scope, SourceRegistry, SpatialMixer, TransportType,
};

fn headphones() -> DeviceProfile {
    DeviceProfile {
        name: "Headphones".into(),
        transport: TransportType::BuiltIn,
        data_source: None,
        output_channels: 2,
        supported_channels: vec![2],
        sample_rate: 48000,
        supported_sample_rates: vec![48000],
        hardware_latency: 0.0,
        software_latency_min: 0.0,
        software_latency_max: 0.0,
        supports_head_tracking: true,
    }
}

fn bench_ring_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");

    group.bench_function("packet_write_read", |b| {
        let (mut writer, mut reader) = RingBuffer::with_capacity(480 * 4 * 8);
        let packet = vec![0.5f32; 480];
        let mut bytes = vec![0u8; 480 * 4];
        let mut out = vec![0.0f32; 480];

        b.iter(|| {
            let n = samples_as_bytes(black_box(&packet), &mut bytes);
            writer.write(&bytes[..n]);
            let chunk = reader.read(n);
            let read = bytes_to_samples(chunk, &mut out);
            reader.commit_read(read * 4);
            black_box(&out);
        });
    });

    group.finish();
}

fn bench_spatial_mixer(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial_mixer");

    for output_type in [OutputType::Stereo, OutputType::HeadTracked] {
        group.bench_function(format!("render_5_1_{:?}", output_type), |b| {
            let (mut writer, reader) = RingBuffer::with_capacity(240 * 6 * 4 * 4);
            let mut registry = SourceRegistry::new();
            let source = registry.insert(reader);

            let mut mixer = SpatialMixer::new(headphones());
            mixer.configure(output_type, 48000, 48000, 6).unwrap();
            mixer
                .set_stream_format_and_layout(48000, ChannelLayout::Surround51, Scope::Input)
                .unwrap();
            mixer.attach_source(source).unwrap();
            mixer.begin_rendering().unwrap();

            let head = mixer.head_orientation();
            let mut bytes = vec![0u8; 240 * 6 * 4];
            samples_as_bytes(&vec![0.25f32; 240 * 6], &mut bytes);
            let mut out = vec![0.0f32; 240 * 2];
            let mut yaw = 0.0f32;

            b.iter(|| {
                writer.write(&bytes);
                yaw += 0.01;
                head.set_yaw(yaw);
                let status = mixer.render(&mut registry, &mut out, &RenderTimestamp::default(), 240);
                black_box((status, &out));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ring_buffer, bench_spatial_mixer);
criterion_main!(benches);
