//! Clip assembler — turns a slice of the rolling buffer into a persistent
//! clip of exact duration.
//!
//! Planning is pure: pick an anchor end, walk backwards through the
//! snapshot for a minimal contiguous cover, and decide between the fast
//! path (cut points on segment boundaries, concat demuxer in stream-copy
//! mode) and the slow path (partial edge segments re-encoded, interior
//! stream-copied). Execution shells out to ffmpeg/ffprobe with hard
//! timeouts and verifies the container-reported duration before the
//! atomic rename into the clips directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::buffer::{BufferIndex, Segment};
use crate::config::Config;
use crate::error::{PrerollError, Result};

/// Subprocess timeout: `clip duration * factor + pad`.
pub const ASSEMBLY_TIMEOUT_FACTOR: u64 = 4;
const ASSEMBLY_TIMEOUT_PAD: StdDuration = StdDuration::from_secs(30);
const PROBE_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Duration tolerance fallback when the output's frame rate is unknown.
pub const DEFAULT_FRAME_INTERVAL: f64 = 1.0 / 25.0;

/// Cut points within this distance of a segment boundary count as aligned.
const BOUNDARY_TOLERANCE_MS: i64 = 50;

/// Container extension of persistent clips.
pub const CLIP_EXT: &str = "mp4";

/// Hard timeout for one encoder invocation while assembling a clip of
/// `target_s` seconds.
fn assembly_timeout(target_s: f64) -> StdDuration {
    StdDuration::from_secs(target_s.ceil() as u64 * ASSEMBLY_TIMEOUT_FACTOR) + ASSEMBLY_TIMEOUT_PAD
}

/// Overall deadline for a single trigger request. `save_clip` may run two
/// assembly attempts (one retry after a mid-assembly eviction), and each
/// attempt may need the full re-encode fallback on top of its main pass,
/// so the budget is four assembly timeouts.
pub fn request_deadline(duration_s: u64) -> StdDuration {
    assembly_timeout(duration_s as f64) * 4
}

/// Canonical clip file name: `<camera_id>_<UTC timestamp, second resolution>`.
pub fn clip_file_name(camera_id: &str, request_time: DateTime<Utc>) -> String {
    format!(
        "{camera_id}_{}.{CLIP_EXT}",
        request_time.format("%Y%m%dT%H%M%SZ")
    )
}

/// Resolved cut plan over a buffer snapshot.
#[derive(Debug, Clone)]
pub struct ClipPlan {
    /// Minimal contiguous cover, oldest first.
    pub segments: Vec<Segment>,
    pub target_start: DateTime<Utc>,
    pub anchor_end: DateTime<Utc>,
    /// Seconds to drop from the head of the first segment.
    pub head_trim: f64,
    /// Seconds of the last segment to keep.
    pub tail_keep: f64,
    /// Both cut points coincide with segment boundaries.
    pub fast_path: bool,
}

impl ClipPlan {
    pub fn duration(&self) -> f64 {
        (self.anchor_end - self.target_start).num_milliseconds() as f64 / 1000.0
    }
}

/// Choose the cut points and covering segments for a clip request.
///
/// The anchor end is the end of the newest closed segment, pulled back to
/// the request time when the request lands inside the covered window; the
/// target start is `duration` before it. Fails with `InsufficientBuffer`
/// when no contiguous cover exists.
pub fn plan_clip(
    snapshot: &[Segment],
    camera_id: &str,
    duration_s: u64,
    request_time: DateTime<Utc>,
) -> Result<ClipPlan> {
    let covered: f64 = snapshot
        .iter()
        .map(|s| s.duration.num_milliseconds() as f64 / 1000.0)
        .sum();
    let insufficient = || PrerollError::InsufficientBuffer {
        id: camera_id.to_string(),
        available: covered,
        requested: duration_s,
    };

    let newest = snapshot.last().ok_or_else(insufficient)?;
    let mut anchor_end = request_time.min(newest.end_time());

    // Newest segment that starts before the anchor.
    let mut j = snapshot.len() - 1;
    while j > 0 && snapshot[j].start_time >= anchor_end {
        j -= 1;
    }
    if snapshot[j].start_time >= anchor_end {
        return Err(insufficient());
    }
    // The request may fall inside a capture gap; clip up to the last
    // covered instant before it.
    anchor_end = anchor_end.min(snapshot[j].end_time());

    let target_start = anchor_end - Duration::seconds(duration_s as i64);
    let tolerance = Duration::milliseconds(BOUNDARY_TOLERANCE_MS);

    let mut i = j;
    while snapshot[i].start_time > target_start {
        if i == 0 {
            return Err(insufficient());
        }
        if snapshot[i - 1].end_time() + tolerance < snapshot[i].start_time {
            // Gap inside the needed range.
            return Err(insufficient());
        }
        i -= 1;
    }

    let head_trim =
        ((target_start - snapshot[i].start_time).num_milliseconds().max(0)) as f64 / 1000.0;
    let tail_keep = (anchor_end - snapshot[j].start_time).num_milliseconds() as f64 / 1000.0;
    let head_aligned = (target_start - snapshot[i].start_time).num_milliseconds().abs()
        <= BOUNDARY_TOLERANCE_MS;
    let tail_aligned =
        (snapshot[j].end_time() - anchor_end).num_milliseconds().abs() <= BOUNDARY_TOLERANCE_MS;

    Ok(ClipPlan {
        segments: snapshot[i..=j].to_vec(),
        target_start,
        anchor_end,
        head_trim,
        tail_keep,
        fast_path: head_aligned && tail_aligned,
    })
}

/// Outcome of a successful clip request.
#[derive(Debug, Clone)]
pub struct ClipOutcome {
    pub camera_id: String,
    pub path: PathBuf,
    pub duration: f64,
    /// Whether any re-encoding happened (slow path or fallback).
    pub reencoded: bool,
}

pub struct ClipAssembler {
    config: Arc<Config>,
    index: Arc<BufferIndex>,
}

impl ClipAssembler {
    pub fn new(config: Arc<Config>, index: Arc<BufferIndex>) -> Self {
        ClipAssembler { config, index }
    }

    /// Produce a clip for one camera. Retries once from a fresh snapshot if
    /// a selected segment is evicted mid-assembly.
    pub async fn save_clip(
        &self,
        camera_id: &str,
        duration_s: u64,
        request_time: DateTime<Utc>,
    ) -> Result<ClipOutcome> {
        std::fs::create_dir_all(&self.config.clips_dir)?;

        let mut last_missing: Option<PathBuf> = None;
        for attempt in 0..2 {
            let snapshot = self.index.snapshot(camera_id);
            let plan = plan_clip(&snapshot, camera_id, duration_s, request_time)?;
            debug!(
                camera = camera_id,
                segments = plan.segments.len(),
                fast = plan.fast_path,
                target_start = %plan.target_start,
                anchor_end = %plan.anchor_end,
                "Clip planned"
            );
            match self.execute(camera_id, &plan, request_time).await {
                Ok(outcome) => return Ok(outcome),
                Err(PrerollError::SegmentMissing(path)) => {
                    warn!(
                        camera = camera_id,
                        path = ?path,
                        attempt,
                        "Selected segment vanished during assembly"
                    );
                    last_missing = Some(path);
                }
                Err(e) => return Err(e),
            }
        }

        // Two strikes; report what the buffer can actually cover.
        let covered: f64 = self
            .index
            .snapshot(camera_id)
            .iter()
            .map(|s| s.duration.num_milliseconds() as f64 / 1000.0)
            .sum();
        debug!(camera = camera_id, path = ?last_missing, "Assembly retry exhausted");
        Err(PrerollError::InsufficientBuffer {
            id: camera_id.to_string(),
            available: covered,
            requested: duration_s,
        })
    }

    /// Same as [`save_clip`](Self::save_clip) with a hard deadline.
    pub async fn save_clip_with_deadline(
        &self,
        camera_id: &str,
        duration_s: u64,
        request_time: DateTime<Utc>,
        deadline: StdDuration,
    ) -> Result<ClipOutcome> {
        tokio::time::timeout(deadline, self.save_clip(camera_id, duration_s, request_time))
            .await
            .map_err(|_| {
                PrerollError::Timeout(format!("clip request for '{camera_id}' hit its deadline"))
            })?
    }

    /// Fan an ALL request out to every camera; failures are per camera.
    pub async fn save_all(
        self: Arc<Self>,
        duration_s: u64,
        request_time: DateTime<Utc>,
    ) -> Vec<(String, Result<ClipOutcome>)> {
        let mut set = JoinSet::new();
        for camera in &self.config.cameras {
            let assembler = self.clone();
            let id = camera.id.clone();
            set.spawn(async move {
                let result = assembler.save_clip(&id, duration_s, request_time).await;
                (id, result)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => results.push((
                    "unknown".to_string(),
                    Err(PrerollError::Internal(format!("assembler task: {e}"))),
                )),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    async fn execute(
        &self,
        camera_id: &str,
        plan: &ClipPlan,
        request_time: DateTime<Utc>,
    ) -> Result<ClipOutcome> {
        check_inputs(plan)?;

        let scratch = self
            .config
            .temp_dir
            .join(".assembly")
            .join(format!("{camera_id}_{}", request_time.timestamp()));
        std::fs::create_dir_all(&scratch)?;

        let file_name = clip_file_name(camera_id, request_time);
        let staging = self.config.clips_dir.join(format!(".{file_name}.part"));
        let final_path = self.config.clips_dir.join(&file_name);

        let target = plan.duration();
        let timeout = assembly_timeout(target);

        let build = if plan.fast_path {
            self.concat_copy(&plan.segments, &scratch, &staging, timeout).await
        } else {
            self.trim_and_concat(plan, &scratch, &staging, timeout).await
        };
        if let Err(e) = build {
            let _ = std::fs::remove_dir_all(&scratch);
            let _ = std::fs::remove_file(&staging);
            // Distinguish a concurrently evicted input from a real failure.
            return Err(missing_input(plan).unwrap_or(e));
        }

        let mut reencoded = !plan.fast_path;
        let mut measured = probe_duration(&staging).await?;
        let frame_interval = probe_frame_interval(&staging)
            .await
            .unwrap_or(DEFAULT_FRAME_INTERVAL);
        if (measured - target).abs() > frame_interval {
            warn!(
                camera = camera_id,
                measured,
                target,
                "Duration off after assembly, running full re-encode"
            );
            let fallback = self.full_reencode(plan, &scratch, &staging, timeout).await;
            if let Err(e) = fallback {
                let _ = std::fs::remove_dir_all(&scratch);
                let _ = std::fs::remove_file(&staging);
                return Err(missing_input(plan).unwrap_or(e));
            }
            reencoded = true;
            measured = probe_duration(&staging).await?;
            if (measured - target).abs() > frame_interval {
                warn!(camera = camera_id, measured, target, "Duration still off after re-encode");
            }
        }

        let _ = std::fs::remove_dir_all(&scratch);
        std::fs::rename(&staging, &final_path)?;
        info!(
            camera = camera_id,
            path = ?final_path,
            duration = measured,
            reencoded,
            "Clip saved"
        );
        Ok(ClipOutcome {
            camera_id: camera_id.to_string(),
            path: final_path,
            duration: measured,
            reencoded,
        })
    }

    /// Fast path: concat demuxer over the whole selection, stream copy.
    async fn concat_copy(
        &self,
        segments: &[Segment],
        scratch: &Path,
        out: &Path,
        timeout: StdDuration,
    ) -> Result<()> {
        let list = write_concat_list(scratch, "concat.txt", segments.iter().map(|s| s.path.as_path()))?;
        run_ffmpeg(
            &[
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
                path_str(&list)?,
                "-c",
                "copy",
                // The staging file has no container extension.
                "-f",
                "mp4",
                path_str(out)?,
            ],
            timeout,
        )
        .await
    }

    /// Slow path: re-encode the partial edge segments, stream-copy the
    /// interior, then concat the parts.
    async fn trim_and_concat(
        &self,
        plan: &ClipPlan,
        scratch: &Path,
        out: &Path,
        timeout: StdDuration,
    ) -> Result<()> {
        let segs = &plan.segments;
        let n = segs.len();
        let mut parts: Vec<PathBuf> = Vec::new();

        if n == 1 {
            // Both cuts land in the same segment: one trim pass.
            let part = scratch.join("part_only.ts");
            let ss = format!("{:.3}", plan.head_trim);
            let t = format!("{:.3}", plan.duration());
            let enc = self.encode_args();
            let mut args = vec!["-ss", ss.as_str(), "-i", path_str(&segs[0].path)?, "-t", t.as_str()];
            args.extend(enc.iter().map(String::as_str));
            let out_s = path_str(&part)?.to_string();
            args.push(out_s.as_str());
            run_ffmpeg(&args, timeout).await?;
            parts.push(part);
        } else {
            let head_partial = plan.head_trim > BOUNDARY_TOLERANCE_MS as f64 / 1000.0;
            let seg_j = &segs[n - 1];
            let tail_partial = (seg_j.end_time() - plan.anchor_end).num_milliseconds()
                > BOUNDARY_TOLERANCE_MS;

            if head_partial {
                let part = scratch.join("part_head.ts");
                let ss = format!("{:.3}", plan.head_trim);
                let enc = self.encode_args();
                let mut args = vec!["-ss", ss.as_str(), "-i", path_str(&segs[0].path)?];
                args.extend(enc.iter().map(String::as_str));
                let out_s = path_str(&part)?.to_string();
                args.push(out_s.as_str());
                run_ffmpeg(&args, timeout).await?;
                parts.push(part);
            }

            let interior_from = if head_partial { 1 } else { 0 };
            let interior_to = if tail_partial { n - 1 } else { n };
            if interior_from < interior_to {
                let part = scratch.join("part_mid.ts");
                let list = write_concat_list(
                    scratch,
                    "interior.txt",
                    segs[interior_from..interior_to].iter().map(|s| s.path.as_path()),
                )?;
                run_ffmpeg(
                    &[
                        "-f",
                        "concat",
                        "-safe",
                        "0",
                        "-i",
                        path_str(&list)?,
                        "-c",
                        "copy",
                        "-f",
                        "mpegts",
                        path_str(&part)?,
                    ],
                    timeout,
                )
                .await?;
                parts.push(part);
            }

            if tail_partial {
                let part = scratch.join("part_tail.ts");
                let t = format!("{:.3}", plan.tail_keep);
                let enc = self.encode_args();
                let mut args = vec!["-i", path_str(&seg_j.path)?, "-t", t.as_str()];
                args.extend(enc.iter().map(String::as_str));
                let out_s = path_str(&part)?.to_string();
                args.push(out_s.as_str());
                run_ffmpeg(&args, timeout).await?;
                parts.push(part);
            }
        }

        if parts.len() == 1 {
            // Remux the single part into the clip container.
            run_ffmpeg(
                &["-i", path_str(&parts[0])?, "-c", "copy", "-f", "mp4", path_str(out)?],
                timeout,
            )
            .await
        } else {
            let list = write_concat_list(scratch, "parts.txt", parts.iter().map(PathBuf::as_path))?;
            run_ffmpeg(
                &[
                    "-f",
                    "concat",
                    "-safe",
                    "0",
                    "-i",
                    path_str(&list)?,
                    "-c",
                    "copy",
                    "-f",
                    "mp4",
                    path_str(out)?,
                ],
                timeout,
            )
            .await
        }
    }

    /// Last resort: concat everything stream-copied, then trim the whole
    /// clip in one encoding pass.
    async fn full_reencode(
        &self,
        plan: &ClipPlan,
        scratch: &Path,
        out: &Path,
        timeout: StdDuration,
    ) -> Result<()> {
        let inter = scratch.join("full.ts");
        let list = write_concat_list(
            scratch,
            "full.txt",
            plan.segments.iter().map(|s| s.path.as_path()),
        )?;
        run_ffmpeg(
            &[
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
                path_str(&list)?,
                "-c",
                "copy",
                "-f",
                "mpegts",
                path_str(&inter)?,
            ],
            timeout,
        )
        .await?;

        let trimmed = scratch.join("full_trimmed.ts");
        let ss = format!("{:.3}", plan.head_trim);
        let t = format!("{:.3}", plan.duration());
        let enc = self.encode_args();
        let mut args = vec!["-ss", ss.as_str(), "-i", path_str(&inter)?, "-t", t.as_str()];
        args.extend(enc.iter().map(String::as_str));
        let out_s = path_str(&trimmed)?.to_string();
        args.push(out_s.as_str());
        run_ffmpeg(&args, timeout).await?;

        let _ = std::fs::remove_file(out);
        run_ffmpeg(
            &["-i", path_str(&trimmed)?, "-c", "copy", "-f", "mp4", path_str(out)?],
            timeout,
        )
        .await
    }

    /// Encoder arguments for the re-encode paths, from `FFMPEG_*` tuning.
    fn encode_args(&self) -> Vec<String> {
        let enc = &self.config.encoder;
        vec![
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            enc.preset.clone(),
            "-crf".into(),
            enc.crf.to_string(),
            "-force_key_frames".into(),
            format!("expr:gte(t,n_forced*{})", enc.keyframe_interval),
            "-an".into(),
            "-f".into(),
            "mpegts".into(),
        ]
    }
}

fn check_inputs(plan: &ClipPlan) -> Result<()> {
    match missing_input(plan) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn missing_input(plan: &ClipPlan) -> Option<PrerollError> {
    plan.segments
        .iter()
        .find(|s| !s.path.exists())
        .map(|s| PrerollError::SegmentMissing(s.path.clone()))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| PrerollError::Internal(format!("non-UTF8 path: {path:?}")))
}

fn write_concat_list<'a>(
    scratch: &Path,
    name: &str,
    paths: impl Iterator<Item = &'a Path>,
) -> Result<PathBuf> {
    let mut body = String::new();
    for p in paths {
        body.push_str(&format!("file '{}'\n", path_str(p)?));
    }
    let list = scratch.join(name);
    std::fs::write(&list, body)?;
    Ok(list)
}

/// Run ffmpeg with a hard timeout. The child is killed if the timeout
/// fires (`kill_on_drop`).
async fn run_ffmpeg(args: &[&str], timeout: StdDuration) -> Result<()> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PrerollError::Internal("ffmpeg not found in PATH".into())
        } else {
            PrerollError::Io(e)
        }
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| PrerollError::Timeout(format!("ffmpeg exceeded {timeout:?}")))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.lines().rev().take(4).collect::<Vec<_>>().join(" | ");
        return Err(PrerollError::Internal(format!(
            "ffmpeg failed ({}): {tail}",
            output.status
        )));
    }
    Ok(())
}

/// Container-reported duration in seconds.
pub async fn probe_duration(path: &Path) -> Result<f64> {
    let out = run_ffprobe(&[
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        path_str(path)?,
    ])
    .await?;
    out.trim()
        .parse()
        .map_err(|e| PrerollError::Internal(format!("unparseable duration '{}': {e}", out.trim())))
}

/// Frame interval (seconds per frame) of the first video stream.
pub async fn probe_frame_interval(path: &Path) -> Result<f64> {
    let out = run_ffprobe(&[
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=avg_frame_rate",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        path_str(path)?,
    ])
    .await?;
    let rate = out.trim();
    let (num, den) = rate
        .split_once('/')
        .ok_or_else(|| PrerollError::Internal(format!("unparseable frame rate '{rate}'")))?;
    let num: f64 = num
        .parse()
        .map_err(|e| PrerollError::Internal(format!("frame rate '{rate}': {e}")))?;
    let den: f64 = den
        .parse()
        .map_err(|e| PrerollError::Internal(format!("frame rate '{rate}': {e}")))?;
    if num <= 0.0 || den <= 0.0 {
        return Err(PrerollError::Internal(format!("degenerate frame rate '{rate}'")));
    }
    Ok(den / num)
}

async fn run_ffprobe(args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("ffprobe");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PrerollError::Internal("ffprobe not found in PATH".into())
        } else {
            PrerollError::Io(e)
        }
    })?;
    let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| PrerollError::Timeout("ffprobe".into()))??;
    if !output.status.success() {
        return Err(PrerollError::Internal(format!(
            "ffprobe failed ({})",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
