//! Clip planning tests — cut-point selection over synthetic buffers.
//!
//! These mirror the operational scenarios: an aligned trigger takes the
//! concat fast path, a misaligned trigger trims both edges, and a window
//! that cannot cover the request fails with `InsufficientBuffer`.

use std::path::PathBuf;

use chrono::{DateTime, Duration, TimeZone, Utc};

use preroll::buffer::Segment;
use preroll::clip::{clip_file_name, plan_clip};
use preroll::error::PrerollError;

const T0: i64 = 1_700_000_000; // multiple of 5, clock-aligned

fn at(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(T0 + offset, 0).unwrap()
}

/// Synthetic closed segments of 5 s each at the given start offsets.
fn snapshot(offsets: &[i64]) -> Vec<Segment> {
    offsets
        .iter()
        .map(|o| Segment {
            camera_id: "camera_1".to_string(),
            start_time: at(*o),
            duration: Duration::seconds(5),
            path: PathBuf::from(format!("/tmp/buf/camera_1/{}.ts", T0 + o)),
            size_bytes: 1024,
            created_at: at(*o + 5),
        })
        .collect()
}

#[test]
fn test_aligned_trigger_takes_fast_path() {
    // Ten segments covering [0, 50); trigger exactly on the boundary.
    let snap = snapshot(&[0, 5, 10, 15, 20, 25, 30, 35, 40, 45]);
    let plan = plan_clip(&snap, "camera_1", 25, at(50)).expect("plan");

    assert!(plan.fast_path, "boundary-aligned cut must not re-encode");
    assert_eq!(plan.target_start, at(25));
    assert_eq!(plan.anchor_end, at(50));
    assert_eq!(plan.segments.len(), 5);
    assert_eq!(plan.segments[0].start_time, at(25));
    assert_eq!(plan.head_trim, 0.0);
    assert_eq!(plan.duration(), 25.0);
}

#[test]
fn test_misaligned_trigger_trims_both_edges() {
    let snap = snapshot(&[0, 5, 10, 15, 20, 25, 30, 35, 40, 45]);
    let plan = plan_clip(&snap, "camera_1", 25, at(47)).expect("plan");

    assert!(!plan.fast_path);
    assert_eq!(plan.anchor_end, at(47));
    assert_eq!(plan.target_start, at(22));
    // Covering [22, 47] needs the six segments starting at 20…45.
    assert_eq!(plan.segments.len(), 6);
    assert_eq!(plan.segments[0].start_time, at(20));
    assert_eq!(plan.head_trim, 2.0);
    assert_eq!(plan.tail_keep, 2.0);
    assert_eq!(plan.duration(), 25.0);
}

#[test]
fn test_insufficient_buffer() {
    // Only 15 s covered, 25 s requested.
    let snap = snapshot(&[0, 5, 10]);
    let err = plan_clip(&snap, "camera_1", 25, at(15)).unwrap_err();
    match err {
        PrerollError::InsufficientBuffer {
            id,
            available,
            requested,
        } => {
            assert_eq!(id, "camera_1");
            assert_eq!(available, 15.0);
            assert_eq!(requested, 25);
        }
        other => panic!("expected InsufficientBuffer, got {other}"),
    }
}

#[test]
fn test_empty_buffer() {
    let err = plan_clip(&[], "camera_1", 10, at(0)).unwrap_err();
    assert!(matches!(err, PrerollError::InsufficientBuffer { .. }));
}

#[test]
fn test_gap_inside_range_fails() {
    // Segment at 15 was lost; [10, 30] cannot be covered contiguously.
    let snap = snapshot(&[0, 5, 10, 20, 25]);
    let err = plan_clip(&snap, "camera_1", 20, at(30)).unwrap_err();
    assert!(matches!(err, PrerollError::InsufficientBuffer { .. }));
}

#[test]
fn test_gap_before_range_is_harmless() {
    // Same hole, but the request only needs [20, 30].
    let snap = snapshot(&[0, 5, 10, 20, 25]);
    let plan = plan_clip(&snap, "camera_1", 10, at(30)).expect("plan");
    assert!(plan.fast_path);
    assert_eq!(plan.segments.len(), 2);
    assert_eq!(plan.segments[0].start_time, at(20));
}

#[test]
fn test_anchor_clamps_to_newest_end() {
    // Trigger arrives well after the last closed segment.
    let snap = snapshot(&[0, 5, 10, 15]);
    let plan = plan_clip(&snap, "camera_1", 10, at(60)).expect("plan");
    assert_eq!(plan.anchor_end, at(20));
    assert_eq!(plan.target_start, at(10));
    assert!(plan.fast_path);
}

#[test]
fn test_request_inside_capture_gap() {
    // Coverage is [0,5) ∪ [10,15); the trigger lands in the hole, so the
    // clip ends at the last covered instant before it.
    let snap = snapshot(&[0, 10]);
    let plan = plan_clip(&snap, "camera_1", 5, at(7)).expect("plan");
    assert_eq!(plan.anchor_end, at(5));
    assert_eq!(plan.target_start, at(0));
    assert!(plan.fast_path);
    assert_eq!(plan.segments.len(), 1);
}

#[test]
fn test_single_segment_double_trim() {
    let snap = snapshot(&[0]);
    let plan = plan_clip(&snap, "camera_1", 2, at(4)).expect("plan");
    assert!(!plan.fast_path);
    assert_eq!(plan.segments.len(), 1);
    assert_eq!(plan.head_trim, 2.0);
    assert_eq!(plan.tail_keep, 4.0);
    assert_eq!(plan.duration(), 2.0);
}

#[test]
fn test_clip_file_name_is_canonical() {
    let t = Utc.with_ymd_and_hms(2026, 2, 19, 14, 30, 5).unwrap();
    assert_eq!(
        clip_file_name("camera_2", t),
        "camera_2_20260219T143005Z.mp4"
    );
}
