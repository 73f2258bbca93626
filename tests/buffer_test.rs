//! Segment store + buffer index integration tests.
//!
//! Run with: `cargo test`

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use preroll::buffer::{BufferIndex, Segment};
use preroll::store::{parse_segment_start, SegmentStore};

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn open_store(dir: &TempDir) -> Arc<SegmentStore> {
    Arc::new(SegmentStore::open(dir.path()).expect("open store"))
}

/// Write a real file and build its descriptor, mimicking the capture worker.
fn seg(store: &SegmentStore, camera: &str, start: i64, dur: i64, bytes: usize) -> Segment {
    store.ensure_camera_dir(camera).expect("camera dir");
    let path = store.segment_path(camera, start);
    std::fs::write(&path, vec![0xABu8; bytes]).expect("write segment");
    Segment {
        camera_id: camera.to_string(),
        start_time: Utc.timestamp_opt(start, 0).unwrap(),
        duration: Duration::seconds(dur),
        path,
        size_bytes: bytes as u64,
        created_at: Utc::now(),
    }
}

const T0: i64 = 1_700_000_000; // multiple of 5, clock-aligned

#[test]
fn test_segment_path_naming() {
    let dir = tmp_dir();
    let store = open_store(&dir);

    let path = store.segment_path("camera_1", 42);
    assert_eq!(path.file_name().unwrap(), "0000000042.ts");
    assert_eq!(parse_segment_start(&path), Some(42));

    // Foreign files are not segments.
    assert_eq!(parse_segment_start(std::path::Path::new("a/playlist.m3u8")), None);
    assert_eq!(parse_segment_start(std::path::Path::new("a/notes.ts.txt")), None);
    assert_eq!(parse_segment_start(std::path::Path::new("a/12x4.ts")), None);
}

#[test]
fn test_list_sorted_and_filtered() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    let cam_dir = store.ensure_camera_dir("camera_1").expect("dir");

    for start in [100i64, 5, 10] {
        std::fs::write(store.segment_path("camera_1", start), b"data").unwrap();
    }
    // Foreign files must be ignored.
    std::fs::write(cam_dir.join("README"), b"x").unwrap();
    std::fs::write(cam_dir.join("clip.mp4"), b"x").unwrap();

    let files = store.list("camera_1").expect("list");
    let starts: Vec<i64> = files.iter().map(|f| f.start).collect();
    assert_eq!(starts, vec![5, 10, 100]);
    assert!(files.iter().all(|f| f.size_bytes == 4));

    // Unknown camera lists empty, not an error.
    assert!(store.list("camera_9").expect("list empty").is_empty());
}

#[test]
fn test_delete_tolerates_missing() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    let path = store.segment_path("camera_1", 5);
    store.delete(&path).expect("delete of missing file is ok");
}

#[test]
fn test_append_enforces_retention() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    // 30 s window, 5 s chunks.
    let index = BufferIndex::new(store.clone(), 30, 5);

    let mut paths = Vec::new();
    for k in 0..10 {
        let s = seg(&store, "camera_1", T0 + k * 5, 5, 64);
        paths.push(s.path.clone());
        index.append(s);

        // Retention bound holds after every append.
        let covered: i64 = index
            .snapshot("camera_1")
            .iter()
            .map(|s| s.duration.num_seconds())
            .sum();
        assert!(covered <= 35, "covered {covered}s exceeds window + chunk");
    }

    let snap = index.snapshot("camera_1");
    assert_eq!(snap.len(), 6, "30s window holds six 5s segments");
    assert_eq!(snap[0].start_time, Utc.timestamp_opt(T0 + 20, 0).unwrap());

    // Evicted files are unlinked, retained files still exist.
    for p in &paths[..4] {
        assert!(!p.exists(), "evicted segment still on disk: {p:?}");
    }
    for p in &paths[4..] {
        assert!(p.exists(), "live segment missing: {p:?}");
    }
}

#[test]
fn test_snapshot_monotonic_timestamps() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    let index = BufferIndex::new(store.clone(), 60, 5);

    for k in [0, 1, 3, 4, 7] {
        index.append(seg(&store, "camera_1", T0 + k * 5, 5, 16));
    }
    let snap = index.snapshot("camera_1");
    for pair in snap.windows(2) {
        assert!(pair[0].start_time < pair[1].start_time);
    }
}

#[test]
fn test_duplicate_start_retains_newer() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    let index = BufferIndex::new(store.clone(), 60, 5);

    index.append(seg(&store, "camera_1", T0, 5, 10));
    // Same start written again (encoder restart over the same boundary).
    index.append(seg(&store, "camera_1", T0, 5, 99));

    let snap = index.snapshot("camera_1");
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].size_bytes, 99);
    assert!(snap[0].path.exists());
}

#[test]
fn test_regressed_start_dropped() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    let index = BufferIndex::new(store.clone(), 60, 5);

    index.append(seg(&store, "camera_1", T0 + 100, 5, 16));
    let stale = seg(&store, "camera_1", T0, 5, 16);
    let stale_path = stale.path.clone();
    index.append(stale);

    let snap = index.snapshot("camera_1");
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].start_time, Utc.timestamp_opt(T0 + 100, 0).unwrap());
    // The dropped segment's file must not leak on the tmpfs.
    assert!(!stale_path.exists());
}

#[test]
fn test_snapshot_isolated_from_eviction() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    let index = BufferIndex::new(store.clone(), 60, 5);

    index.append(seg(&store, "camera_1", T0, 5, 16));
    index.append(seg(&store, "camera_1", T0 + 5, 5, 16));

    let snap = index.snapshot("camera_1");
    assert_eq!(snap.len(), 2);

    // Concurrent eviction after the snapshot does not mutate the view.
    index.evict_oldest("camera_1").expect("evict");
    assert_eq!(snap.len(), 2);
    assert_eq!(index.snapshot("camera_1").len(), 1);
}

#[test]
fn test_evict_oldest_unlinks() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    let index = BufferIndex::new(store.clone(), 60, 5);

    index.append(seg(&store, "camera_1", T0, 5, 16));
    index.append(seg(&store, "camera_1", T0 + 5, 5, 16));

    let evicted = index.evict_oldest("camera_1").expect("evict");
    assert_eq!(evicted.start_time, Utc.timestamp_opt(T0, 0).unwrap());
    assert!(!evicted.path.exists());

    // Nothing to evict for unknown cameras.
    assert!(index.evict_oldest("camera_9").is_none());
}

#[test]
fn test_status_aggregates() {
    let dir = tmp_dir();
    let store = open_store(&dir);
    let index = BufferIndex::new(store.clone(), 60, 5);
    index.register_camera("camera_1");
    index.register_camera("camera_2");

    index.append(seg(&store, "camera_1", T0, 5, 100));
    index.append(seg(&store, "camera_1", T0 + 5, 5, 100));

    let status = index.status();
    assert_eq!(status.len(), 2);

    let cam1 = &status[0];
    assert_eq!(cam1.camera_id, "camera_1");
    assert_eq!(cam1.segments, 2);
    assert_eq!(cam1.covered_seconds, 10.0);
    assert_eq!(cam1.total_bytes, 200);
    assert!(cam1.newest_age_seconds.is_some());

    // Registered but empty camera still shows up.
    let cam2 = &status[1];
    assert_eq!(cam2.camera_id, "camera_2");
    assert_eq!(cam2.segments, 0);
    assert!(cam2.newest_age_seconds.is_none());
}
