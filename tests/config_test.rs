//! Flat key/value configuration parsing tests.

use std::time::Duration;

use preroll::config::{Config, RtspTransport, TriggerMode};
use preroll::error::PrerollError;

#[test]
fn test_full_config() {
    let content = "
# cameras
CAMERA_1_URL=rtsp://10.0.0.10:554/stream1
CAMERA_2_URL=rtsp://10.0.0.11:554/stream1

CHUNK_DURATION=4
BUFFER_SECONDS=40
FINAL_CLIP_DURATION=20
TEMP_DIR=/dev/shm/buf
CLIPS_DIR=/var/lib/preroll/clips
TRIGGER_MODE=http
HTTP_PORT=9000
RTSP_TRANSPORT=udp
RECONNECT_INITIAL_DELAY=1
RECONNECT_MAX_DELAY=30
RECONNECT_MAX_ATTEMPTS=5
FFMPEG_KEYFRAME_INTERVAL=2
FFMPEG_PRESET=ultrafast
FFMPEG_CRF=28
";
    let cfg = Config::from_str_content(content).expect("parse");

    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].id, "camera_1");
    assert_eq!(cfg.cameras[0].url, "rtsp://10.0.0.10:554/stream1");
    assert_eq!(cfg.cameras[1].id, "camera_2");

    assert_eq!(cfg.chunk_duration, 4);
    assert_eq!(cfg.buffer_seconds, 40);
    assert_eq!(cfg.final_clip_duration, 20);
    assert_eq!(cfg.temp_dir, std::path::PathBuf::from("/dev/shm/buf"));
    assert_eq!(cfg.trigger_mode, TriggerMode::Http);
    assert_eq!(cfg.http_port, 9000);
    assert_eq!(cfg.rtsp_transport, RtspTransport::Udp);
    assert_eq!(cfg.reconnect.initial_delay, Duration::from_secs(1));
    assert_eq!(cfg.reconnect.max_delay, Duration::from_secs(30));
    assert_eq!(cfg.reconnect.max_attempts, 5);
    assert_eq!(cfg.encoder.preset, "ultrafast");
    assert_eq!(cfg.encoder.crf, 28);
}

#[test]
fn test_defaults() {
    let cfg = Config::from_str_content("CAMERA_1_URL=rtsp://cam/1").expect("parse");
    assert_eq!(cfg.chunk_duration, 5);
    assert_eq!(cfg.buffer_seconds, 30);
    assert_eq!(cfg.final_clip_duration, 25);
    assert_eq!(cfg.trigger_mode, TriggerMode::Keyboard);
    assert_eq!(cfg.rtsp_transport, RtspTransport::Tcp);
    assert_eq!(cfg.reconnect.initial_delay, Duration::from_secs(2));
    assert_eq!(cfg.reconnect.max_delay, Duration::from_secs(60));
    assert_eq!(cfg.reconnect.max_attempts, 0, "0 means retry forever");
    assert_eq!(cfg.encoder.preset, "veryfast");
}

#[test]
fn test_no_cameras_is_fatal() {
    let err = Config::from_str_content("CHUNK_DURATION=5").unwrap_err();
    assert!(matches!(err, PrerollError::ConfigInvalid(_)));

    // Numbering starts at 1; CAMERA_2_URL alone defines nothing.
    let err = Config::from_str_content("CAMERA_2_URL=rtsp://cam/2").unwrap_err();
    assert!(matches!(err, PrerollError::ConfigInvalid(_)));
}

#[test]
fn test_bad_values_rejected() {
    for content in [
        "CAMERA_1_URL=rtsp://cam/1\nCHUNK_DURATION=abc",
        "CAMERA_1_URL=rtsp://cam/1\nCHUNK_DURATION=0",
        "CAMERA_1_URL=rtsp://cam/1\nTRIGGER_MODE=telnet",
        "CAMERA_1_URL=rtsp://cam/1\nRTSP_TRANSPORT=carrier-pigeon",
        "CAMERA_1_URL=rtsp://cam/1\nthis is not a key value pair",
        // Clip longer than the retention window can never be served.
        "CAMERA_1_URL=rtsp://cam/1\nBUFFER_SECONDS=20\nFINAL_CLIP_DURATION=25",
        "CAMERA_1_URL=rtsp://cam/1\nBUFFER_SECONDS=3\nCHUNK_DURATION=5",
    ] {
        let err = Config::from_str_content(content).unwrap_err();
        assert!(
            matches!(err, PrerollError::ConfigInvalid(_)),
            "expected ConfigInvalid for: {content}"
        );
    }
}

#[test]
fn test_comments_blanks_and_unknown_keys() {
    let content = "
# a comment
CAMERA_1_URL = rtsp://cam/1

SOME_FUTURE_KEY=whatever
";
    let cfg = Config::from_str_content(content).expect("unknown keys are not fatal");
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.cameras[0].url, "rtsp://cam/1");
}

#[test]
fn test_clip_duration_clamping() {
    let cfg = Config::from_str_content("CAMERA_1_URL=rtsp://cam/1\nBUFFER_SECONDS=30").expect("parse");
    assert_eq!(cfg.clamp_clip_duration(None), 25, "default clip length");
    assert_eq!(cfg.clamp_clip_duration(Some(10)), 10);
    assert_eq!(cfg.clamp_clip_duration(Some(500)), 30, "capped at the window");
    assert_eq!(cfg.clamp_clip_duration(Some(0)), 1);
}
