use std::sync::mpsc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rawbit::cache::{BlockLoc, CachePartition};
use rawbit::{BlockRequest, DiskIo, DiskSettings, LayoutFile, StorageId, BLOCK_SIZE};

const BATCH_BLOCKS: u64 = 1024;
const MEASUREMENT_TIME: Duration = Duration::from_secs(5);

fn loc(piece: u32, offset: u32) -> BlockLoc {
    BlockLoc::new(StorageId(0), piece, offset)
}

fn shard_insert_and_hit(c: &mut Criterion) {
    let block = vec![0xABu8; BLOCK_SIZE];
    let mut group = c.benchmark_group("shard");
    group.measurement_time(MEASUREMENT_TIME);
    group.throughput(Throughput::Bytes(BLOCK_SIZE as u64));

    group.bench_function("insert_write", |b| {
        let mut shard = CachePartition::new(4096);
        let mut piece = 0u32;
        b.iter(|| {
            shard.insert_write(loc(piece, 0), &block);
            shard.mark_clean(loc(piece, 0));
            piece = piece.wrapping_add(1);
        });
    });

    group.bench_function("get_hit", |b| {
        let mut shard = CachePartition::new(64);
        for i in 0..32u32 {
            shard.insert_read(loc(0, i * 16384), &block);
        }
        let mut i = 0u32;
        b.iter(|| {
            let hit = shard.get(loc(0, (i % 32) * 16384), |data| data.len());
            assert_eq!(hit, Some(BLOCK_SIZE));
            i = i.wrapping_add(1);
        });
    });

    group.bench_function("eviction_churn", |b| {
        // Quota far below the working set so every insert evicts.
        let mut shard = CachePartition::new(64);
        let mut piece = 0u32;
        b.iter(|| {
            shard.insert_read(loc(piece, 0), &block);
            piece = piece.wrapping_add(1);
        });
    });

    group.finish();
}

fn layout_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout");
    group.measurement_time(MEASUREMENT_TIME);

    for &num_files in &[1usize, 16, 256] {
        let files: Vec<LayoutFile> = (0..num_files)
            .map(|i| LayoutFile::new(format!("{:x}", i * 1 << 20), 1 << 20))
            .collect();
        let layout = rawbit::TorrentLayout::new(&files, 1 << 18).unwrap();
        let pieces = layout.num_pieces();

        group.bench_with_input(
            BenchmarkId::new("map_block", num_files),
            &num_files,
            |b, _| {
                let mut piece = 0u32;
                b.iter(|| {
                    let slices = layout.map_block(piece % pieces, 12288, BLOCK_SIZE as u64);
                    assert!(!slices.is_empty());
                    piece = piece.wrapping_add(1);
                });
            },
        );
    }

    group.finish();
}

fn engine_write_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    group.sample_size(20);
    group.measurement_time(MEASUREMENT_TIME);
    group.throughput(Throughput::Bytes(BATCH_BLOCKS * BLOCK_SIZE as u64));

    group.bench_function("write_batch", |b| {
        b.iter_custom(|iters| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let engine = DiskIo::new(rt.handle().clone(), DiskSettings::default().into_view());
            let dev = tempfile::NamedTempFile::new().unwrap();
            dev.as_file()
                .set_len(BATCH_BLOCKS * BLOCK_SIZE as u64)
                .unwrap();
            let total = BATCH_BLOCKS * BLOCK_SIZE as u64;
            let id = engine
                .new_torrent(&[LayoutFile::new("0", total)], 1 << 20, dev.path())
                .unwrap();

            let data = vec![0xCDu8; BLOCK_SIZE];
            let blocks_per_piece = (1usize << 20) / BLOCK_SIZE;

            let start = Instant::now();
            for _ in 0..iters {
                let (tx, rx) = mpsc::channel();
                for i in 0..BATCH_BLOCKS as usize {
                    let piece = (i / blocks_per_piece) as u32;
                    let offset = ((i % blocks_per_piece) * BLOCK_SIZE) as u32;
                    let tx = tx.clone();
                    engine.async_write(
                        id,
                        BlockRequest::new(piece, offset, BLOCK_SIZE as u32),
                        &data,
                        None,
                        move |err| tx.send(err).unwrap(),
                    );
                }
                drop(tx);
                for err in rx.iter() {
                    assert!(err.is_none());
                }
            }
            let elapsed = start.elapsed();
            engine.abort(true);
            elapsed
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    shard_insert_and_hit,
    layout_mapping,
    engine_write_throughput
);
criterion_main!(benches);
