use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use trellis::crypto::derive_pair;
use trellis::frame::{DestAddr, Frame, FrameHeader, FrameType, StreamOpen};

fn frame_encode_decode(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xA5u8; 1024]);
    let frame = Frame::new(FrameType::StreamData, 42, payload);

    c.bench_function("frame_encode_1k", |b| {
        b.iter(|| black_box(frame.encode()));
    });

    let header = frame.header.encode();
    c.bench_function("header_decode", |b| {
        b.iter(|| FrameHeader::decode(black_box(&header)).unwrap());
    });

    let open = StreamOpen {
        request_id: 7,
        dest: DestAddr::Domain("service.internal.example".into()),
        port: 443,
        ttl: 16,
        path: Vec::new(),
        ephemeral_pub: [9u8; 32],
    };
    c.bench_function("stream_open_round_trip", |b| {
        b.iter(|| {
            let encoded = open.encode();
            StreamOpen::decode(black_box(encoded)).unwrap()
        });
    });
}

fn seal_open(c: &mut Criterion) {
    let (ingress, exit) = derive_pair(1);
    let chunk = vec![0x5Au8; 16 * 1024 - 28];

    c.bench_function("seal_16k_chunk", |b| {
        b.iter(|| ingress.seal(black_box(&chunk)).unwrap());
    });

    c.bench_function("seal_then_open_16k", |b| {
        b.iter(|| {
            let sealed = ingress.seal(black_box(&chunk)).unwrap();
            exit.open(&sealed).unwrap()
        });
    });
}

criterion_group!(benches, frame_encode_decode, seal_open);
criterion_main!(benches);
