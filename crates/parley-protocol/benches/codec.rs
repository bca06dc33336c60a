//! Codec benchmarks for parley-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, ChatMessage, Envelope, Signal};

fn bench_encode_chat(c: &mut Criterion) {
    let envelope = Envelope::Message(ChatMessage::direct(42, "x".repeat(64)));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("chat_64B", |b| b.iter(|| codec::encode(black_box(&envelope))));
    group.finish();
}

fn bench_decode_chat(c: &mut Criterion) {
    let envelope = Envelope::GroupMessage(
        ChatMessage::group(7, "x".repeat(64)).with_media("https://cdn/a.png", "image/png"),
    );
    let encoded = codec::encode(&envelope).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("group_chat_64B", |b| {
        b.iter(|| codec::decode(black_box(encoded.as_bytes())))
    });
    group.finish();
}

fn bench_decode_signal(c: &mut Criterion) {
    let sdp = format!("v=0\r\n{}", "a=candidate:1 1 udp 2122260223\r\n".repeat(16));
    let envelope = Envelope::CallOffer(Signal::to_group(3).in_room("room-1").with_sdp(sdp));
    let encoded = codec::encode(&envelope).unwrap();

    c.bench_function("decode_call_offer", |b| {
        b.iter(|| codec::decode(black_box(encoded.as_bytes())).unwrap())
    });
}

criterion_group!(
    benches,
    bench_encode_chat,
    bench_decode_chat,
    bench_decode_signal
);
criterion_main!(benches);
