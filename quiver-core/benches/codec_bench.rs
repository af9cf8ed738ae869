use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quiver_core::compression::{
    BitReader, BitWriter, TimestampCompressor, TimestampDecompressor, ValueCodec,
    ValueCompressor, ValueDecompressor,
};

fn create_points(count: usize) -> Vec<(i64, u64)> {
    (0..count)
        .map(|i| {
            let jitter = (i % 7) as i64;
            let value = 100.0 + (i as f64 * 0.5).sin();
            (1000 + i as i64 * 1000 + jitter, value.to_bits())
        })
        .collect()
}

fn encode(points: &[(i64, u64)], codec: ValueCodec) -> Vec<u8> {
    let mut out = BitWriter::with_capacity(points.len() * 4);
    let mut timestamps = TimestampCompressor::new(0, &mut out);
    let mut values = ValueCompressor::new(codec);
    for (ts, bits) in points {
        timestamps.compress(*ts, &mut out).unwrap();
        values.compress(*bits, &mut out);
    }
    timestamps.write_end_of_stream(&mut out);
    out.finish()
}

fn decode(data: &[u8], codec: ValueCodec) -> usize {
    let mut input = BitReader::new(data.to_vec());
    let Some(mut timestamps) = TimestampDecompressor::new(&mut input) else {
        return 0;
    };
    let mut values = ValueDecompressor::new(codec);
    let mut count = 0;
    while timestamps.read(&mut input).is_some() {
        if values.read(&mut input).is_none() {
            break;
        }
        count += 1;
    }
    count
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for codec in [ValueCodec::Gorilla, ValueCodec::Delta] {
        for size in [100, 1000, 10000].iter() {
            let points = create_points(*size);
            group.bench_with_input(BenchmarkId::new(codec.name(), size), size, |b, _| {
                b.iter(|| black_box(encode(&points, codec)));
            });
        }
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for codec in [ValueCodec::Gorilla, ValueCodec::Delta] {
        for size in [100, 1000, 10000].iter() {
            let encoded = encode(&create_points(*size), codec);
            group.bench_with_input(BenchmarkId::new(codec.name(), size), size, |b, _| {
                b.iter(|| black_box(decode(&encoded, codec)));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
