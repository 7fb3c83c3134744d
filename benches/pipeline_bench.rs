use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use zipflow::{AddOptions, MemorySink, MemorySource, ZipReader, ZipWriter};

fn generate_compressible_data(size: usize) -> Vec<u8> {
    // Pattern that compresses well
    let pattern = b"The quick brown fox jumps over the lazy dog. ";
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        data.extend_from_slice(pattern);
    }
    data.truncate(size);
    data
}

fn generate_random_data(size: usize) -> Vec<u8> {
    // Pseudo-random data that doesn't compress well
    let mut data = Vec::with_capacity(size);
    let mut state = 0x12345678u32;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

fn write_archive(payload: &[u8], options: AddOptions<'_>) -> Vec<u8> {
    let writer = ZipWriter::new(MemorySink::new()).unwrap();
    writer
        .add("bench.bin", Some(MemorySource::from(payload)), options)
        .unwrap();
    writer.close(None).unwrap().into_bytes()
}

fn bench_write(c: &mut Criterion) {
    for size in [64 * 1024, 1024 * 1024, 10 * 1024 * 1024] {
        let mut group = c.benchmark_group("write");
        group.throughput(Throughput::Bytes(size as u64));

        let compressible = generate_compressible_data(size);
        group.bench_with_input(
            BenchmarkId::new("deflate_compressible", size),
            &compressible,
            |b, data| {
                b.iter(|| write_archive(black_box(data), AddOptions::default()));
            },
        );

        let random = generate_random_data(size);
        group.bench_with_input(
            BenchmarkId::new("store_random", size),
            &random,
            |b, data| {
                b.iter(|| {
                    write_archive(
                        black_box(data),
                        AddOptions {
                            level: 0,
                            ..AddOptions::default()
                        },
                    )
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("aes_deflate_compressible", size),
            &compressible,
            |b, data| {
                b.iter(|| {
                    write_archive(
                        black_box(data),
                        AddOptions {
                            password: Some("bench-password".to_string()),
                            ..AddOptions::default()
                        },
                    )
                });
            },
        );
        group.finish();
    }
}

fn bench_read(c: &mut Criterion) {
    for size in [1024 * 1024, 10 * 1024 * 1024] {
        let mut group = c.benchmark_group("read");
        group.throughput(Throughput::Bytes(size as u64));

        let archive = write_archive(&generate_compressible_data(size), AddOptions::default());
        group.bench_with_input(
            BenchmarkId::new("inflate_compressible", size),
            &archive,
            |b, archive| {
                b.iter(|| {
                    let mut reader =
                        ZipReader::new(MemorySource::new(black_box(archive.clone()))).unwrap();
                    reader.read_entry_by_name("bench.bin").unwrap()
                });
            },
        );
        group.finish();
    }
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
