//! Performance benchmarks for the merge engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gravity_snapshot::{
    ChangeEvent, FileStore, FileStoreConfig, MemoryStore, Meta, Method, RecordMerger,
    SnapshotHandler, SnapshotRecord, SnapshotStore, Value,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::Span;

fn meta(revision: u64) -> Meta {
    let mut meta = Meta::new();
    meta.insert("revision".into(), json!(revision));
    meta
}

fn wide_record(fields: usize) -> serde_json::Value {
    let mut doc = serde_json::Map::new();
    for i in 0..fields {
        doc.insert(format!("field_{}", i), json!(i));
    }
    doc.insert("address".into(), json!({"city": "Taipei", "zip": "100"}));
    doc.insert("tags".into(), json!(["a", "b", "c"]));
    serde_json::Value::Object(doc)
}

/// Benchmark the merge callback against records of growing width
fn bench_merge_callback(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_callback");

    for fields in [4, 32, 256] {
        let origin = SnapshotRecord::new(Value::from_json(&wide_record(fields)))
            .with_meta(meta(1))
            .encode()
            .unwrap();
        let incoming = SnapshotRecord::new(Value::from_json(&json!({
            "field_0": -1,
            "address": {"zip": "200"},
            "tags": ["d"]
        })))
        .encode()
        .unwrap();
        let merger = RecordMerger::new(meta(2));

        group.bench_with_input(BenchmarkId::new("fields", fields), &fields, |b, _| {
            b.iter(|| black_box(merger.merge(&origin, &incoming)));
        });
    }

    group.finish();
}

fn update_events(keys: i64, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let key = i as i64 % keys;
            ChangeEvent::json("users", Method::Update, "id", &json!({"id": key, "n": i, "name": "user"}))
                .encode()
                .unwrap()
        })
        .collect()
}

/// Benchmark event handling throughput on each store
fn bench_handle(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle");
    let events = update_events(100, 1000);

    group.bench_function("memory_store", |b| {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemoryStore::new());
        let handler = SnapshotHandler::new(store, Span::none());
        let mut revision = 0;

        b.iter(|| {
            for event in &events {
                revision += 1;
                handler.handle(&meta(revision), event).unwrap();
            }
        });
    });

    group.bench_function("file_store", |b| {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn SnapshotStore> = Arc::new(
            FileStore::create(FileStoreConfig {
                path: dir.path().join("snapshot"),
                sync_interval: 1000,
                ..Default::default()
            })
            .unwrap(),
        );
        let handler = SnapshotHandler::new(store, Span::none());
        let mut revision = 0;

        b.iter(|| {
            for event in &events {
                revision += 1;
                handler.handle(&meta(revision), event).unwrap();
            }
        });
    });

    group.finish();
}

/// Benchmark reopening a store with a long log
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    group.sample_size(10);

    for entries in [1_000usize, 10_000] {
        let dir = TempDir::new().unwrap();
        let config = FileStoreConfig {
            path: dir.path().join("snapshot"),
            sync_interval: 10_000,
            // Keep every entry so replay sees the full log
            compact_min_entries: 0,
            ..Default::default()
        };

        {
            let store: Arc<dyn SnapshotStore> = Arc::new(FileStore::create(config.clone()).unwrap());
            let handler = SnapshotHandler::new(store, Span::none());
            for (i, event) in update_events(500, entries).iter().enumerate() {
                handler.handle(&meta(i as u64 + 1), event).unwrap();
            }
        }

        group.bench_with_input(BenchmarkId::new("entries", entries), &entries, |b, _| {
            b.iter(|| black_box(FileStore::open(config.clone()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_merge_callback, bench_handle, bench_replay);
criterion_main!(benches);
