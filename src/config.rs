use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::error::{PrerollError, Result};

/// Top-level configuration loaded from a flat `KEY=VALUE` file.
///
/// Immutable after load; components receive it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cameras in key order (`CAMERA_1_URL`, `CAMERA_2_URL`, …).
    pub cameras: Vec<CameraConfig>,
    /// Segment length in seconds.
    pub chunk_duration: u64,
    /// Retention window in seconds.
    pub buffer_seconds: u64,
    /// Default clip length in seconds.
    pub final_clip_duration: u64,
    /// Root of the memory-backed segment store.
    pub temp_dir: PathBuf,
    /// Persistent clip output root.
    pub clips_dir: PathBuf,
    /// Which trigger front-end to run.
    pub trigger_mode: TriggerMode,
    /// Listen port for the HTTP trigger.
    pub http_port: u16,
    /// RTSP transport preference, shared by all cameras.
    pub rtsp_transport: RtspTransport,
    /// Restart backoff policy.
    pub reconnect: ReconnectConfig,
    /// Encoder tuning, used wherever this system re-encodes.
    pub encoder: EncoderConfig,
}

/// Per-camera configuration.
#[derive(Debug, Clone, Serialize)]
pub struct CameraConfig {
    /// Stable identifier derived from the config key index (`camera_1`, …).
    pub id: String,
    /// RTSP URL of the camera stream.
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Keyboard,
    Http,
}

impl FromStr for TriggerMode {
    type Err = PrerollError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keyboard" => Ok(TriggerMode::Keyboard),
            "http" => Ok(TriggerMode::Http),
            other => Err(PrerollError::ConfigInvalid(format!(
                "TRIGGER_MODE must be 'keyboard' or 'http', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspTransport {
    Tcp,
    Udp,
}

impl RtspTransport {
    /// Value passed to the encoder's `-rtsp_transport` flag.
    pub fn as_flag(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

impl FromStr for RtspTransport {
    type Err = PrerollError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(RtspTransport::Tcp),
            "udp" => Ok(RtspTransport::Udp),
            other => Err(PrerollError::ConfigInvalid(format!(
                "RTSP_TRANSPORT must be 'tcp' or 'udp', got '{other}'"
            ))),
        }
    }
}

/// Exponential backoff policy for encoder restarts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0 = retry forever.
    pub max_attempts: u32,
}

/// Encoder tuning for the re-encode paths of clip assembly.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub keyframe_interval: u64,
    pub preset: String,
    pub crf: u32,
}

impl Config {
    /// Load configuration from a flat key/value file at `path`.
    ///
    /// Lines are `KEY=VALUE`; blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PrerollError::ConfigInvalid(format!("Cannot read config file {path:?}: {e}"))
        })?;
        Self::from_str_content(&content)
    }

    /// Parse configuration from file contents.
    pub fn from_str_content(content: &str) -> Result<Self> {
        let mut values: BTreeMap<String, String> = BTreeMap::new();
        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(PrerollError::ConfigInvalid(format!(
                    "Line {}: expected KEY=VALUE, got '{line}'",
                    lineno + 1
                )));
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut cameras = Vec::new();
        let mut n = 1u32;
        loop {
            let key = format!("CAMERA_{n}_URL");
            match values.remove(&key) {
                Some(url) => {
                    if url.is_empty() {
                        return Err(PrerollError::ConfigInvalid(format!("{key} is empty")));
                    }
                    cameras.push(CameraConfig {
                        id: format!("camera_{n}"),
                        url,
                    });
                    n += 1;
                }
                None => break,
            }
        }

        let chunk_duration = parse_or(&mut values, "CHUNK_DURATION", 5)?;
        let buffer_seconds = parse_or(&mut values, "BUFFER_SECONDS", 30)?;
        let final_clip_duration = parse_or(&mut values, "FINAL_CLIP_DURATION", 25)?;
        let temp_dir = values
            .remove("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/dev/shm/preroll"));
        let clips_dir = values
            .remove("CLIPS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("clips"));
        let trigger_mode = match values.remove("TRIGGER_MODE") {
            Some(s) => s.parse()?,
            None => TriggerMode::Keyboard,
        };
        let http_port = parse_or(&mut values, "HTTP_PORT", 8080u16)?;
        let rtsp_transport = match values.remove("RTSP_TRANSPORT") {
            Some(s) => s.parse()?,
            None => RtspTransport::Tcp,
        };
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_secs(parse_or(
                &mut values,
                "RECONNECT_INITIAL_DELAY",
                2,
            )?),
            max_delay: Duration::from_secs(parse_or(&mut values, "RECONNECT_MAX_DELAY", 60)?),
            max_attempts: parse_or(&mut values, "RECONNECT_MAX_ATTEMPTS", 0)?,
        };
        let encoder = EncoderConfig {
            keyframe_interval: parse_or(&mut values, "FFMPEG_KEYFRAME_INTERVAL", 2)?,
            preset: values
                .remove("FFMPEG_PRESET")
                .unwrap_or_else(|| "veryfast".to_string()),
            crf: parse_or(&mut values, "FFMPEG_CRF", 23)?,
        };

        for key in values.keys() {
            warn!(key, "Unrecognized config key ignored");
        }

        let config = Config {
            cameras,
            chunk_duration,
            buffer_seconds,
            final_clip_duration,
            temp_dir,
            clips_dir,
            trigger_mode,
            http_port,
            rtsp_transport,
            reconnect,
            encoder,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(PrerollError::ConfigInvalid(
                "No cameras defined (set CAMERA_1_URL)".into(),
            ));
        }
        if self.chunk_duration == 0 {
            return Err(PrerollError::ConfigInvalid("CHUNK_DURATION must be > 0".into()));
        }
        if self.buffer_seconds < self.chunk_duration {
            return Err(PrerollError::ConfigInvalid(
                "BUFFER_SECONDS must be >= CHUNK_DURATION".into(),
            ));
        }
        if self.final_clip_duration == 0 {
            return Err(PrerollError::ConfigInvalid(
                "FINAL_CLIP_DURATION must be > 0".into(),
            ));
        }
        if self.final_clip_duration > self.buffer_seconds {
            return Err(PrerollError::ConfigInvalid(format!(
                "FINAL_CLIP_DURATION ({}) exceeds BUFFER_SECONDS ({})",
                self.final_clip_duration, self.buffer_seconds
            )));
        }
        if self.trigger_mode == TriggerMode::Http && self.http_port == 0 {
            return Err(PrerollError::ConfigInvalid(
                "HTTP_PORT must be set when TRIGGER_MODE=http".into(),
            ));
        }
        if self.reconnect.initial_delay.is_zero() {
            return Err(PrerollError::ConfigInvalid(
                "RECONNECT_INITIAL_DELAY must be > 0".into(),
            ));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(PrerollError::ConfigInvalid(
                "RECONNECT_MAX_DELAY must be >= RECONNECT_INITIAL_DELAY".into(),
            ));
        }
        Ok(())
    }

    /// Clamp a requested clip duration to what the retention window can cover.
    pub fn clamp_clip_duration(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.final_clip_duration)
            .min(self.buffer_seconds)
            .max(1)
    }
}

fn parse_or<T: FromStr>(values: &mut BTreeMap<String, String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match values.remove(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| PrerollError::ConfigInvalid(format!("{key}: invalid value '{raw}': {e}"))),
        None => Ok(default),
    }
}
