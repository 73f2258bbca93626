use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrerollError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Camera '{id}' unreachable: {reason}")]
    CameraUnreachable { id: String, reason: String },

    #[error("Encoder exited for camera '{id}': {reason}")]
    EncoderExited { id: String, reason: String },

    #[error("Segment missing: {0}")]
    SegmentMissing(PathBuf),

    #[error("Insufficient buffer for camera '{id}': {available:.1}s covered, {requested}s requested")]
    InsufficientBuffer {
        id: String,
        available: f64,
        requested: u64,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage pressure: {0}")]
    StoragePressure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PrerollError>;
