//! FIFO buffer hot-path benchmarks
//!
//! Run: cargo bench --bench bench_fifo

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use patchbay::FifoBuffer;

const CHUNK: usize = 8 * 1024;
const LAPS: usize = 64;

fn bench_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo");
    group.throughput(Throughput::Bytes((CHUNK * LAPS) as u64));

    group.bench_function("write_read_8k", |b| {
        let buf = FifoBuffer::new(16 * 1024, 256 * 1024);
        let data = vec![0xA5u8; CHUNK];
        let mut out = vec![0u8; CHUNK];
        b.iter(|| {
            for _ in 0..LAPS {
                buf.write(black_box(&data)).unwrap();
                let n = buf.read_non_blocking(&mut out);
                black_box(n);
            }
        });
    });

    group.bench_function("peek_2", |b| {
        let buf = FifoBuffer::new(16 * 1024, 256 * 1024);
        buf.write(&vec![0x5Au8; CHUNK]).unwrap();
        let mut hdr = [0u8; 2];
        b.iter(|| {
            for off in 0..LAPS {
                black_box(buf.peek(off, &mut hdr));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_write_read);
criterion_main!(benches);
