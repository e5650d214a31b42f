//! Codec benchmarks for courier-protocol.

use courier_protocol::{codec, DeliveredMessage, ServerEvent};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn channel_message(content_len: usize) -> ServerEvent {
    ServerEvent::ChannelMessage(DeliveredMessage {
        message_id: "msg_0badf00d".into(),
        channel_id: Some("chnl_general_chat".into()),
        sender_id: "1".into(),
        sender_name: "alice".into(),
        receiver_id: None,
        content: "x".repeat(content_len),
        file_ids: Vec::new(),
        timestamp: 1_700_000_000_000,
    })
}

fn bench_encode(c: &mut Criterion) {
    let event = channel_message(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("binary_64B", |b| b.iter(|| codec::encode(black_box(&event))));
    group.bench_function("text_64B", |b| {
        b.iter(|| codec::encode_text(black_box(&event)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let event = channel_message(64);
    let binary = codec::encode(&event).unwrap();
    let text = codec::encode_text(&event).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(binary.len() as u64));
    group.bench_function("binary_64B", |b| {
        b.iter(|| codec::decode::<ServerEvent>(black_box(&binary)))
    });
    group.bench_function("text_64B", |b| {
        b.iter(|| codec::decode_text::<ServerEvent>(black_box(&text)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let event = channel_message(1024);

    c.bench_function("roundtrip_1KB", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode::<ServerEvent>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip);
criterion_main!(benches);
