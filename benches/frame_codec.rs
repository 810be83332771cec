//! Frame codec and flow control benchmarks
//!
//! Run with: cargo bench --bench frame_codec

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use h2mux::codec::FrameCodec;
use h2mux::flow_control::FlowControlWindow;
use h2mux::frames::{DataFrame, FrameFlags, FrameHeader, FrameType};
use h2mux::headers::{HeaderDecoder, HeaderEncoder, HeaderField};

fn bench_frame_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_header");

    let header = FrameHeader::new(
        FrameType::Headers,
        FrameFlags::from_u8(FrameFlags::END_HEADERS),
        1,
        4096,
    );

    group.bench_function("encode", |b| {
        b.iter(|| black_box(FrameCodec::encode_header(black_box(&header))));
    });

    let encoded = FrameCodec::encode_header(&header);
    group.bench_function("decode", |b| {
        b.iter(|| black_box(FrameCodec::decode_header(black_box(&encoded))));
    });

    group.finish();
}

fn bench_data_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frame");

    for size in [1024usize, 16384] {
        group.throughput(Throughput::Bytes(size as u64));
        let data = Bytes::from(vec![0u8; size]);

        group.bench_with_input(BenchmarkId::new("encode", size), &size, |b, _| {
            b.iter(|| {
                let frame = DataFrame::new(black_box(1), data.clone(), false);
                black_box(FrameCodec::encode_data_frame(&frame));
            });
        });
    }

    group.finish();
}

fn bench_header_block_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_block");

    // A block crossing the frame limit exercises the CONTINUATION path
    let block = vec![0xaa_u8; 50_000];
    group.bench_function("split_into_continuations", |b| {
        b.iter(|| {
            black_box(FrameCodec::encode_header_block(
                black_box(1),
                black_box(&block),
                false,
                16384,
            ));
        });
    });

    group.finish();
}

fn bench_flow_control(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_control");

    group.bench_function("consume_and_replenish", |b| {
        let mut window = FlowControlWindow::new();
        b.iter(|| {
            let granted = window.consume(black_box(1024));
            window.increase(granted as u32).unwrap();
            black_box(granted);
        });
    });

    group.finish();
}

fn bench_hpack_boundary(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpack_boundary");

    let fields = vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":path", "/index.html"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":authority", "example.com"),
        HeaderField::new("accept", "text/html"),
        HeaderField::new("user-agent", "bench/1.0"),
    ];

    group.bench_function("encode_request_fields", |b| {
        let mut encoder = HeaderEncoder::new();
        b.iter(|| black_box(encoder.encode(black_box(&fields)).unwrap()));
    });

    group.bench_function("decode_request_fields", |b| {
        let mut encoder = HeaderEncoder::new();
        let block = encoder.encode(&fields).unwrap();
        let mut decoder = HeaderDecoder::new();
        b.iter(|| black_box(decoder.decode(black_box(&block)).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_header,
    bench_data_frame,
    bench_header_block_split,
    bench_flow_control,
    bench_hpack_boundary
);
criterion_main!(benches);
