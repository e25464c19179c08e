use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Write;
use tempfile::NamedTempFile;
use tracefile::record::encode_record;
use tracefile::sof::StartOfFile;
use tracefile::{BinaryRecordStream, ReadStatus, ReaderOptions, RecordBatch, RecordKind, RecordStream};
use uuid::Uuid;

const FRAMES: u32 = 200;
const CALLS_PER_FRAME: u32 = 100;

fn write_trace() -> NamedTempFile {
    let mut tmp = NamedTempFile::new().unwrap();
    StartOfFile::new(Uuid::nil()).write(&mut tmp).unwrap();
    let payload = vec![0x5Au8; 96];
    for _ in 0..FRAMES {
        for _ in 0..CALLS_PER_FRAME {
            tmp.write_all(encode_record(RecordKind::Entrypoint, 0, &payload).as_bytes()).unwrap();
        }
        tmp.write_all(encode_record(RecordKind::FrameBoundary, 0, &[]).as_bytes()).unwrap();
    }
    tmp.write_all(encode_record(RecordKind::EndOfStream, 0, &[]).as_bytes()).unwrap();
    tmp.flush().unwrap();
    tmp
}

fn bench_sequential(c: &mut Criterion) {
    let trace = write_trace();
    let options = ReaderOptions::default();

    c.bench_function("read_all_20k_records", |b| {
        let mut stream = BinaryRecordStream::open(trace.path(), &options).unwrap();
        b.iter(|| {
            stream.seek_to_frame(0).unwrap();
            let mut n = 0u64;
            while stream.read_next_record().unwrap() == ReadStatus::Ok && !stream.record().is_end() {
                n += 1;
            }
            black_box(n)
        })
    });

    c.bench_function("batch_read_10_frames", |b| {
        let mut stream = BinaryRecordStream::open(trace.path(), &options).unwrap();
        let mut batch = RecordBatch::new();
        b.iter(|| black_box(stream.read_frame_records(black_box(100), 10, &mut batch).unwrap()))
    });
}

fn bench_seek(c: &mut Criterion) {
    let trace = write_trace();
    let options = ReaderOptions::default();

    c.bench_function("seek_indexed_frame", |b| {
        let mut stream = BinaryRecordStream::open(trace.path(), &options).unwrap();
        stream.max_frame_index().unwrap();
        let mut frame = 0;
        b.iter(|| {
            frame = (frame + 37) % FRAMES;
            stream.seek_to_frame(black_box(frame)).unwrap();
        })
    });

    c.bench_function("seek_unindexed_last_frame", |b| {
        b.iter(|| {
            let mut stream = BinaryRecordStream::open(trace.path(), &options).unwrap();
            stream.seek_to_frame(black_box(FRAMES - 1)).unwrap();
        })
    });
}

criterion_group!(benches, bench_sequential, bench_seek);
criterion_main!(benches);
