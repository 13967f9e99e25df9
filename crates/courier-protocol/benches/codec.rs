//! Codec benchmarks for courier-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use courier_protocol::{codec, ClientDetails, Frame, PublicationData};

fn publication(size: usize) -> Frame {
    Frame::Publication {
        channel: "news".into(),
        publication: PublicationData {
            offset: 42,
            timestamp: 1_700_000_000_000,
            payload: vec![b'x'; size],
            info: Some(ClientDetails {
                user: "42".into(),
                client: "conn_18c2a0001".into(),
                info: Some(serde_json::json!({"name": "Alexander"})),
            }),
        },
    }
}

fn bench_encode_publication(c: &mut Criterion) {
    let frame = publication(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("publication_64B", |b| {
        b.iter(|| codec::encode(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_publish(c: &mut Criterion) {
    let frame = Frame::publish(7, "news", br#"{"input":"hello"}"#.to_vec());
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("publish", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let frame = publication(256);

    c.bench_function("roundtrip_publication_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_publication,
    bench_decode_publish,
    bench_roundtrip
);
criterion_main!(benches);
