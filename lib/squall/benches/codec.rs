use criterion::{criterion_group, criterion_main, Criterion};
use squall::frame::{self, Frame};

fn codec(c: &mut Criterion) {
    let payload = vec![0x5au8; 1024];
    let mut buf = vec![0u8; 1208];

    c.bench_function("encode_data_1k", |b| {
        b.iter(|| frame::encode_data(&mut buf, 34, 3, &payload))
    });

    let len = frame::encode_data(&mut buf, 34, 3, &payload);
    let datagram = buf[..len].to_vec();

    c.bench_function("decode_data_1k", |b| {
        b.iter(|| Frame::decode(&datagram, 1200).unwrap())
    });

    let control = frame::encode_control(frame::Command::Connect, 34, 3);

    c.bench_function("decode_control", |b| {
        b.iter(|| Frame::decode(&control, 1200).unwrap())
    });
}

criterion_group!(benches, codec);
criterion_main!(benches);
