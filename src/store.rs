//! Segment store — a directory tree on memory-backed storage.
//!
//! One subdirectory per camera under the tmpfs root. File names embed the
//! clock-aligned segment start as epoch seconds, so lexicographic order on
//! the fixed-width names equals chronological order:
//!
//! ```text
//! <TEMP_DIR>/camera_1/1722470400.ts
//! <TEMP_DIR>/camera_1/1722470405.ts
//! ```
//!
//! The store never parses media. Listing is a point-in-time snapshot; the
//! newest file may still be growing under the encoder.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PrerollError, Result};

/// Container extension for encoded segments.
pub const SEGMENT_EXT: &str = "ts";

/// A raw directory entry observed in a camera's segment directory.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    /// Segment start, epoch seconds (parsed from the file name).
    pub start: i64,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Root of the memory-backed segment tree.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    /// Open the store, creating the root directory if needed.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| PrerollError::Internal(format!("Cannot create store root {root:?}: {e}")))?;
        Ok(SegmentStore {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn camera_dir(&self, camera_id: &str) -> PathBuf {
        self.root.join(camera_id)
    }

    /// Create the camera's subdirectory and return it.
    pub fn ensure_camera_dir(&self, camera_id: &str) -> Result<PathBuf> {
        let dir = self.camera_dir(camera_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| PrerollError::Internal(format!("Cannot create {dir:?}: {e}")))?;
        Ok(dir)
    }

    /// Path for a segment starting at `start` (epoch seconds), zero-padded to
    /// fixed width.
    pub fn segment_path(&self, camera_id: &str, start: i64) -> PathBuf {
        self.camera_dir(camera_id)
            .join(format!("{start:010}.{SEGMENT_EXT}"))
    }

    /// Output template handed to the encoder's segment muxer. The muxer
    /// expands `%s` (strftime) to the segment's start in epoch seconds.
    pub fn encoder_output_pattern(&self, camera_id: &str) -> String {
        self.camera_dir(camera_id)
            .join(format!("%s.{SEGMENT_EXT}"))
            .to_string_lossy()
            .into_owned()
    }

    /// Point-in-time snapshot of a camera's segment files, sorted by embedded
    /// start time. Foreign files are skipped.
    pub fn list(&self, camera_id: &str) -> Result<Vec<SegmentFile>> {
        let dir = self.camera_dir(camera_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(start) = parse_segment_start(&path) else {
                debug!(path = ?path, "Skipping foreign file in segment dir");
                continue;
            };
            // The file can disappear between read_dir and stat; skip it.
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            files.push(SegmentFile {
                start,
                path,
                size_bytes: meta.len(),
            });
        }
        files.sort_by_key(|f| f.start);
        Ok(files)
    }

    /// Unlink a segment file. Already-gone files are not an error.
    pub fn delete(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = ?path, "Segment already gone at delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fraction of the store's filesystem that is still free, in `[0, 1]`.
    pub fn free_space_fraction(&self) -> Result<f64> {
        let stat = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| PrerollError::Internal(format!("statvfs {:?}: {e}", self.root)))?;
        let total = stat.blocks() as f64;
        if total <= 0.0 {
            return Ok(1.0);
        }
        Ok(stat.blocks_available() as f64 / total)
    }
}

/// Parse the segment start time embedded in a file name.
/// Returns `None` for anything that is not `<digits>.<SEGMENT_EXT>`.
pub fn parse_segment_start(path: &Path) -> Option<i64> {
    if path.extension()?.to_str()? != SEGMENT_EXT {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
