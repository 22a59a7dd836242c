use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::{Cursor, Write};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use zip::write::FileOptions;
use zip::CompressionMethod;
use zip_fanout::store::{MemoryObjectStore, ObjectLocator};
use zip_fanout::{ArchiveFanoutPipeline, ZipStreamReader};

fn generate_compressible_data(size: usize) -> Vec<u8> {
    let pattern = b"The quick brown fox jumps over the lazy dog. ";
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        data.extend_from_slice(pattern);
    }
    data.truncate(size);
    data
}

fn build_archive(entries: usize, entry_size: usize, method: CompressionMethod) -> Vec<u8> {
    let data = generate_compressible_data(entry_size);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for i in 0..entries {
        writer
            .start_file(
                format!("dir/file_{}.pdf", i),
                FileOptions::default().compression_method(method),
            )
            .unwrap();
        writer.write_all(&data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn format_size(size: usize) -> String {
    if size >= 1024 * 1024 {
        format!("{}MB", size / (1024 * 1024))
    } else {
        format!("{}KB", size / 1024)
    }
}

fn bench_read_vs_drain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    for size in [100 * 1024, 1024 * 1024, 8 * 1024 * 1024] {
        let mut group = c.benchmark_group(format!("demux_{}", format_size(size)));
        group.throughput(Throughput::Bytes(size as u64));

        let archive = build_archive(1, size, CompressionMethod::Deflated);

        group.bench_with_input(BenchmarkId::new("read_verify", size), &archive, |b, archive| {
            b.iter(|| {
                rt.block_on(async {
                    let mut zip = ZipStreamReader::new(Cursor::new(archive.as_slice()));
                    let mut sink = [0u8; 64 * 1024];
                    while let Some(mut entry) = zip.next_entry().await.unwrap() {
                        while entry.read(&mut sink).await.unwrap() > 0 {
                            black_box(&sink);
                        }
                        entry.finish().await.unwrap();
                    }
                })
            });
        });

        group.bench_with_input(BenchmarkId::new("drain", size), &archive, |b, archive| {
            b.iter(|| {
                rt.block_on(async {
                    let mut zip = ZipStreamReader::new(Cursor::new(archive.as_slice()));
                    while let Some(entry) = zip.next_entry().await.unwrap() {
                        entry.drain().await.unwrap();
                    }
                })
            });
        });

        group.finish();
    }
}

fn bench_pipeline_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("pipeline_fanout");

    let entry_count = 50;
    let entry_size = 64 * 1024;
    group.throughput(Throughput::Bytes((entry_count * entry_size) as u64));

    for (label, method) in [
        ("stored_50_entries", CompressionMethod::Stored),
        ("deflated_50_entries", CompressionMethod::Deflated),
    ] {
        let archive = build_archive(entry_count, entry_size, method);
        let source = ObjectLocator::new("bench", "archive.zip");

        group.bench_function(label, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let store = Arc::new(MemoryObjectStore::new());
                    store.put(source.clone(), archive.clone());
                    let report = ArchiveFanoutPipeline::builder(store)
                        .build()
                        .run(source.clone())
                        .collect_report()
                        .await
                        .unwrap();
                    black_box(report.summary);
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_read_vs_drain, bench_pipeline_fanout);
criterion_main!(benches);
