//! Buffer index — per-camera ordered sequences of segment descriptors.
//!
//! One writer per camera (the owning capture worker) appends; readers take
//! copy-on-read snapshots. The retention window is enforced on append:
//! oldest segments are evicted (file unlinked first, descriptor removed
//! under the same write lock) until the covered duration is back inside
//! `BUFFER_SECONDS`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::SegmentStore;

/// Descriptor of one closed, on-disk segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub camera_id: String,
    /// Wall-clock start, aligned to a multiple of the segment duration.
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + self.duration
    }
}

/// Aggregate per-camera statistics for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CameraBufferStatus {
    pub camera_id: String,
    pub segments: usize,
    pub covered_seconds: f64,
    /// Age of the newest segment's end, seconds. `None` until the first append.
    pub newest_age_seconds: Option<f64>,
    pub total_bytes: u64,
}

/// In-process registry mapping camera → ordered segment sequence.
pub struct BufferIndex {
    store: Arc<SegmentStore>,
    buffers: RwLock<HashMap<String, Vec<Segment>>>,
    buffer_seconds: u64,
    chunk_duration: u64,
}

impl BufferIndex {
    pub fn new(store: Arc<SegmentStore>, buffer_seconds: u64, chunk_duration: u64) -> Self {
        BufferIndex {
            store,
            buffers: RwLock::new(HashMap::new()),
            buffer_seconds,
            chunk_duration,
        }
    }

    /// Pre-register a camera so status reports list it before the first segment.
    pub fn register_camera(&self, camera_id: &str) {
        self.buffers
            .write()
            .entry(camera_id.to_string())
            .or_default();
    }

    /// Append a newly closed segment and enforce the retention window.
    ///
    /// Called by the owning capture worker only. Returns the number of
    /// segments evicted to restore the window.
    pub fn append(&self, segment: Segment) -> usize {
        let mut buffers = self.buffers.write();
        let seq = buffers.entry(segment.camera_id.clone()).or_default();

        if let Some(last) = seq.last() {
            if segment.start_time < last.start_time {
                warn!(
                    camera = segment.camera_id,
                    start = %segment.start_time,
                    newest = %last.start_time,
                    "Dropping segment older than newest (clock slew?)"
                );
                let _ = self.store.delete(&segment.path);
                return 0;
            }
            if segment.start_time == last.start_time {
                debug!(
                    camera = segment.camera_id,
                    start = %segment.start_time,
                    "Duplicate segment start, retaining newer"
                );
                seq.pop();
            }
        }

        if segment.duration.num_seconds() > 2 * self.chunk_duration as i64 {
            warn!(
                camera = segment.camera_id,
                start = %segment.start_time,
                duration_s = segment.duration.num_seconds(),
                "Oversized segment accepted"
            );
        }

        seq.push(segment);

        // Evict oldest until the covered duration is back inside the window.
        let window = Duration::seconds(self.buffer_seconds as i64);
        let mut evicted = 0;
        while covered(seq) > window && seq.len() > 1 {
            let oldest = seq.remove(0);
            let _ = self.store.delete(&oldest.path);
            evicted += 1;
            debug!(
                camera = oldest.camera_id,
                start = %oldest.start_time,
                "Segment evicted (retention window)"
            );
        }
        evicted
    }

    /// Immutable view of a camera's current sequence.
    ///
    /// Eviction after the snapshot may unlink files the view still names;
    /// readers must treat a missing file as a recoverable skip.
    pub fn snapshot(&self, camera_id: &str) -> Vec<Segment> {
        self.buffers
            .read()
            .get(camera_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a camera's oldest segment regardless of the retention window.
    /// Used by the supervisor under storage pressure.
    pub fn evict_oldest(&self, camera_id: &str) -> Option<Segment> {
        let mut buffers = self.buffers.write();
        let seq = buffers.get_mut(camera_id)?;
        if seq.is_empty() {
            return None;
        }
        let oldest = seq.remove(0);
        let _ = self.store.delete(&oldest.path);
        info!(
            camera = camera_id,
            start = %oldest.start_time,
            "Segment evicted (storage pressure)"
        );
        Some(oldest)
    }

    /// Registered camera ids, sorted.
    pub fn cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.buffers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start of the newest segment for a camera, if any.
    pub fn newest_start(&self, camera_id: &str) -> Option<DateTime<Utc>> {
        self.buffers
            .read()
            .get(camera_id)
            .and_then(|seq| seq.last().map(|s| s.start_time))
    }

    /// Aggregate statistics across all cameras, sorted by camera id.
    pub fn status(&self) -> Vec<CameraBufferStatus> {
        let now = Utc::now();
        let buffers = self.buffers.read();
        let mut out: Vec<CameraBufferStatus> = buffers
            .iter()
            .map(|(id, seq)| CameraBufferStatus {
                camera_id: id.clone(),
                segments: seq.len(),
                covered_seconds: covered(seq).num_milliseconds() as f64 / 1000.0,
                newest_age_seconds: seq
                    .last()
                    .map(|s| (now - s.end_time()).num_milliseconds() as f64 / 1000.0),
                total_bytes: seq.iter().map(|s| s.size_bytes).sum(),
            })
            .collect();
        out.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        out
    }
}

fn covered(seq: &[Segment]) -> Duration {
    seq.iter()
        .fold(Duration::zero(), |acc, s| acc + s.duration)
}
