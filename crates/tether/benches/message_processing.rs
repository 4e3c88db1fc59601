//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths of an attached stream:
//! - Envelope serialization and framing of stream data
//! - TTY transcoding in both directions

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::messages::StreamData;
use protocol::tty::{decode, encode, input_transcoder};
use protocol::{DataStream, Envelope, FrameCodec, Message, Transcoder};

fn stream_data(len: usize) -> Message {
    Message::StreamData(StreamData {
        stream_id: 1,
        stream: DataStream::Stdout,
        data: (0..len).map(|i| (i % 251) as u8).collect(),
    })
}

/// Benchmark envelope encoding plus framing.
fn bench_message_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_framing");
    let codec = FrameCodec::new();

    // Keystroke, terminal chunk, full data message
    for (name, len) in [("small_1B", 1), ("medium_4KB", 4096), ("large_16KB", 16 * 1024)] {
        let envelope = Envelope::new(1, stream_data(len));
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_function(format!("encode_{}", name), |b| {
            b.iter(|| {
                let payload = black_box(&envelope).to_msgpack().unwrap();
                codec.encode(&payload).unwrap()
            });
        });

        let frame = codec.encode(&envelope.to_msgpack().unwrap()).unwrap();
        group.bench_function(format!("decode_{}", name), |b| {
            b.iter(|| {
                let payload = codec.decode(black_box(&frame)).unwrap();
                Envelope::from_msgpack(&payload).unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark TTY escaping.
fn bench_tty_transcoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("tty_transcoding");

    // Colourised output: one escape sequence every few bytes
    let colored: Vec<u8> = b"\x1b[32mok\x1b[0m ^ line\n".repeat(256);
    let plain = vec![b'a'; colored.len()];
    group.throughput(Throughput::Bytes(colored.len() as u64));

    group.bench_function("encode_colored", |b| b.iter(|| encode(black_box(&colored))));
    group.bench_function("encode_plain", |b| b.iter(|| encode(black_box(&plain))));

    let encoded = encode(&colored);
    group.bench_function("decode_colored", |b| b.iter(|| decode(black_box(&encoded))));

    // Streaming decode in small reads, as terminal input arrives
    group.bench_function("decode_streaming_64B", |b| {
        let mut out = Vec::with_capacity(encoded.len());
        b.iter(|| {
            let mut decoder = input_transcoder(true);
            out.clear();
            for piece in encoded.chunks(64) {
                decoder.transcode(black_box(piece), &mut out);
            }
            decoder.flush(&mut out);
            black_box(&out);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_message_framing, bench_tty_transcoding);

criterion_main!(benches);
