use criterion::{black_box, criterion_group, criterion_main, Criterion};

use htool::comm::buffer::RingBuffer;
use htool::comm::frame::{self, Classified};

fn bench_crc16(c: &mut Criterion) {
    let frame: Vec<u8> = (0..256).map(|i| i as u8).collect();

    c.bench_function("crc16_256", |b| b.iter(|| frame::crc16(black_box(&frame))));
}

fn bench_classify(c: &mut Criterion) {
    let response = [0x01, 0x03, 0x04, 0x00, 0x11, 0x00, 0x22, 0x6A, 0x2C];
    let mut buffer = RingBuffer::new(16 * 1024);
    buffer.write_bytes(&response);

    c.bench_function("classify_rtu", |b| {
        b.iter(|| match frame::classify_rtu(black_box(&buffer), 0x01) {
            Classified::Frame { len, .. } => len,
            _ => 0,
        })
    });
}

fn bench_ring_buffer(c: &mut Criterion) {
    let chunk = [0xA5u8; 512];

    c.bench_function("ring_write_read_512", |b| {
        let mut buffer = RingBuffer::new(16 * 1024);
        b.iter(|| {
            buffer.write_bytes(black_box(&chunk));
            buffer.remove_bytes(chunk.len());
        })
    });
}

criterion_group!(benches, bench_crc16, bench_classify, bench_ring_buffer);
criterion_main!(benches);
