//! Capture worker — one per camera, owning an external encoder subprocess.
//!
//! The worker spawns ffmpeg with the segment muxer configured for
//! clock-aligned, stream-copied segments, then observes the output directory
//! instead of parsing encoder output. A segment counts as closed when a
//! newer file exists or its size is stable across two polls; closed segments
//! are appended to the [`BufferIndex`]. Observation is filesystem-derived so
//! a restarted worker resumes correctly over whatever the previous run left
//! behind.
//!
//! The worker never reads packet data; all timing precision comes from the
//! encoder's clock-aligned segmenter.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferIndex, Segment};
use crate::config::{CameraConfig, Config};
use crate::error::{PrerollError, Result};
use crate::store::SegmentStore;

/// Interval between output-directory polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a worker waits for the encoder after SIGTERM before SIGKILL.
pub const T_GRACEFUL: Duration = Duration::from_secs(5);

/// Lifecycle state of a capture worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Failed,
    Backoff,
    Stopped,
}

/// Shared status record, written by the worker and the supervisor,
/// read by the HTTP surface.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub last_heartbeat: Option<Instant>,
    pub last_segment_start: Option<DateTime<Utc>>,
    /// When the current encoder run started.
    pub run_started_at: Option<Instant>,
    pub backoff_attempt: u32,
    pub next_retry_at: Option<Instant>,
    pub quarantined: bool,
}

impl WorkerStatus {
    fn new() -> Self {
        WorkerStatus {
            state: WorkerState::Starting,
            last_heartbeat: None,
            last_segment_start: None,
            run_started_at: None,
            backoff_attempt: 0,
            next_retry_at: None,
            quarantined: false,
        }
    }
}

/// Registry of all worker statuses, keyed by camera id.
pub type StatusRegistry = Arc<RwLock<HashMap<String, WorkerStatus>>>;

pub fn new_registry(cameras: &[CameraConfig]) -> StatusRegistry {
    let map = cameras
        .iter()
        .map(|c| (c.id.clone(), WorkerStatus::new()))
        .collect();
    Arc::new(RwLock::new(map))
}

/// Commands the supervisor (and orchestrator) send to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Respawn the encoder now (backoff delay has elapsed).
    Restart,
    /// Kill the encoder and wait in `Failed` for a restart.
    Terminate,
    /// Graceful shutdown; the worker does not come back.
    Stop,
}

enum RunEnd {
    Stopped,
    Restarted,
    Failed(PrerollError),
}

enum SessionEvent {
    Shutdown,
    Command(Option<WorkerCommand>),
    Exited(std::io::Result<std::process::ExitStatus>),
    Stderr(Option<String>),
    Tick,
}

/// One capture worker task.
pub struct CaptureWorker {
    camera: CameraConfig,
    config: Arc<Config>,
    store: Arc<SegmentStore>,
    index: Arc<BufferIndex>,
    registry: StatusRegistry,
    commands: mpsc::Receiver<WorkerCommand>,
    shutdown: CancellationToken,
    /// Delay before the first encoder spawn (restart-storm stagger).
    startup_delay: Duration,
    /// Newest segment start already appended to the index.
    last_appended: Option<i64>,
    /// Size of the newest on-disk file at the previous poll.
    newest_candidate: Option<(i64, u64)>,
}

impl CaptureWorker {
    /// Spawn the worker task. Returns its handle and command channel.
    pub fn spawn(
        camera: CameraConfig,
        config: Arc<Config>,
        store: Arc<SegmentStore>,
        index: Arc<BufferIndex>,
        registry: StatusRegistry,
        shutdown: CancellationToken,
        startup_delay: Duration,
    ) -> (JoinHandle<()>, mpsc::Sender<WorkerCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let worker = CaptureWorker {
            camera,
            config,
            store,
            index,
            registry,
            commands: cmd_rx,
            shutdown,
            startup_delay,
            last_appended: None,
            newest_candidate: None,
        };
        let handle = tokio::spawn(worker.run());
        (handle, cmd_tx)
    }

    async fn run(mut self) {
        info!(camera = self.camera.id, url = self.camera.url, "Capture worker started");

        if !self.startup_delay.is_zero() {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.set_state(WorkerState::Stopped);
                    return;
                }
                _ = tokio::time::sleep(self.startup_delay) => {}
            }
        }

        loop {
            self.set_state(WorkerState::Starting);
            match self.encoder_session().await {
                RunEnd::Stopped => {
                    self.set_state(WorkerState::Stopped);
                    break;
                }
                RunEnd::Restarted => continue,
                RunEnd::Failed(reason) => {
                    self.set_state(WorkerState::Failed);
                    warn!(camera = self.camera.id, error = %reason, "Encoder run failed");

                    // Idle until the supervisor schedules a restart.
                    'idle: loop {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => {
                                self.set_state(WorkerState::Stopped);
                                return;
                            }
                            cmd = self.commands.recv() => match cmd {
                                Some(WorkerCommand::Restart) => break 'idle,
                                Some(WorkerCommand::Terminate) => {}
                                Some(WorkerCommand::Stop) | None => {
                                    self.set_state(WorkerState::Stopped);
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }

        info!(camera = self.camera.id, "Capture worker exited");
    }

    /// One encoder lifetime: spawn, observe, stop or fail.
    async fn encoder_session(&mut self) -> RunEnd {
        if let Err(e) = self.store.ensure_camera_dir(&self.camera.id) {
            return RunEnd::Failed(e);
        }

        let mut child = match self.spawn_encoder() {
            Ok(c) => c,
            Err(e) => return RunEnd::Failed(e),
        };
        // Used to tell a dead camera from a mid-run encoder crash.
        let baseline = self.last_appended;

        let mut stderr_lines = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut stderr_open = stderr_lines.is_some();

        {
            let mut reg = self.registry.write();
            if let Some(st) = reg.get_mut(&self.camera.id) {
                st.state = WorkerState::Running;
                st.run_started_at = Some(Instant::now());
                st.last_heartbeat = Some(Instant::now());
            }
        }
        info!(camera = self.camera.id, "Encoder started");

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => SessionEvent::Shutdown,
                cmd = self.commands.recv() => SessionEvent::Command(cmd),
                status = child.wait() => SessionEvent::Exited(status),
                line = next_stderr_line(&mut stderr_lines), if stderr_open => SessionEvent::Stderr(line),
                _ = ticker.tick() => SessionEvent::Tick,
            };

            match event {
                SessionEvent::Shutdown | SessionEvent::Command(Some(WorkerCommand::Stop)) | SessionEvent::Command(None) => {
                    self.stop_encoder(child).await;
                    return RunEnd::Stopped;
                }
                SessionEvent::Command(Some(WorkerCommand::Terminate)) => {
                    self.terminate_encoder(child).await;
                    return RunEnd::Failed(PrerollError::EncoderExited {
                        id: self.camera.id.clone(),
                        reason: "terminated by supervisor".into(),
                    });
                }
                SessionEvent::Command(Some(WorkerCommand::Restart)) => {
                    self.terminate_encoder(child).await;
                    return RunEnd::Restarted;
                }
                SessionEvent::Exited(status) => {
                    let reason = match status {
                        Ok(s) => format!("encoder exited: {s}"),
                        Err(e) => format!("encoder wait failed: {e}"),
                    };
                    // An exit before the first segment means the stream
                    // never came up.
                    let error = if self.last_appended == baseline {
                        PrerollError::CameraUnreachable {
                            id: self.camera.id.clone(),
                            reason,
                        }
                    } else {
                        PrerollError::EncoderExited {
                            id: self.camera.id.clone(),
                            reason,
                        }
                    };
                    return RunEnd::Failed(error);
                }
                SessionEvent::Stderr(Some(line)) => {
                    self.heartbeat(None);
                    trace!(camera = self.camera.id, "encoder: {line}");
                }
                SessionEvent::Stderr(None) => {
                    stderr_open = false;
                }
                SessionEvent::Tick => {
                    if let Err(e) = self.scan_closed() {
                        warn!(camera = self.camera.id, error = %e, "Segment scan failed");
                    }
                }
            }
        }
    }

    fn spawn_encoder(&self) -> Result<Child> {
        let pattern = self.store.encoder_output_pattern(&self.camera.id);
        let chunk = self.config.chunk_duration.to_string();

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "warning", "-nostdin"])
            .args(["-rtsp_transport", self.config.rtsp_transport.as_flag()])
            .args(["-i", &self.camera.url])
            // Stream copy: no decode, no re-encode. Segment boundaries land
            // on keyframes because the muxer waits for one.
            .args(["-c", "copy", "-an"])
            .args(["-f", "segment"])
            .args(["-segment_time", &chunk])
            .args(["-segment_atclocktime", "1"])
            .args(["-segment_format", "mpegts"])
            .args(["-reset_timestamps", "1"])
            .args(["-strftime", "1"])
            .arg(&pattern)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                crate::error::PrerollError::Internal("ffmpeg not found in PATH".into())
            } else {
                e.into()
            }
        })
    }

    /// Scan the output directory and append newly closed segments.
    fn scan_closed(&mut self) -> Result<()> {
        let files = self.store.list(&self.camera.id)?;
        if files.is_empty() {
            return Ok(());
        }

        let count = files.len();
        for (i, f) in files.iter().enumerate() {
            if self.last_appended.map_or(false, |last| f.start <= last) {
                continue;
            }

            let is_newest = i == count - 1;
            let closed = if !is_newest {
                true
            } else {
                match self.newest_candidate {
                    Some((start, size)) if start == f.start && size == f.size_bytes && size > 0 => {
                        true
                    }
                    _ => {
                        self.newest_candidate = Some((f.start, f.size_bytes));
                        false
                    }
                }
            };
            if !closed {
                continue;
            }

            let chunk = self.config.chunk_duration as i64;
            let duration_s = if is_newest {
                chunk
            } else {
                let gap = files[i + 1].start - f.start;
                if gap > chunk {
                    warn!(
                        camera = self.camera.id,
                        start = f.start,
                        gap_s = gap,
                        "Capture gap after segment"
                    );
                }
                gap.clamp(1, chunk)
            };

            let start_time = Utc
                .timestamp_opt(f.start, 0)
                .single()
                .unwrap_or_else(Utc::now);
            let evicted = self.index.append(Segment {
                camera_id: self.camera.id.clone(),
                start_time,
                duration: chrono::Duration::seconds(duration_s),
                path: f.path.clone(),
                size_bytes: f.size_bytes,
                created_at: Utc::now(),
            });
            self.last_appended = Some(f.start);
            if is_newest {
                self.newest_candidate = None;
            }
            self.heartbeat(Some(start_time));
            debug!(
                camera = self.camera.id,
                start = f.start,
                bytes = f.size_bytes,
                evicted,
                "Segment closed"
            );
        }
        Ok(())
    }

    /// Graceful stop: SIGTERM the process group, bounded wait, SIGKILL,
    /// then drop any half-written segment newer than the last closed one.
    async fn stop_encoder(&mut self, mut child: Child) {
        signal_group(&child, Signal::SIGTERM);
        match tokio::time::timeout(T_GRACEFUL, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(camera = self.camera.id, "Encoder ignored SIGTERM, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        // Pick up segments the encoder flushed on the way out, then remove
        // the trailing partial.
        if let Err(e) = self.scan_closed() {
            warn!(camera = self.camera.id, error = %e, "Final segment scan failed");
        }
        self.remove_partials();
        info!(camera = self.camera.id, "Encoder stopped");
    }

    /// Supervisor-initiated kill of a wedged encoder.
    async fn terminate_encoder(&mut self, mut child: Child) {
        signal_group(&child, Signal::SIGTERM);
        if tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .is_err()
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    fn remove_partials(&self) {
        let Ok(files) = self.store.list(&self.camera.id) else {
            return;
        };
        for f in files {
            if self.last_appended.map_or(true, |last| f.start > last) {
                info!(
                    camera = self.camera.id,
                    start = f.start,
                    "Removing half-written segment"
                );
                let _ = self.store.delete(&f.path);
            }
        }
    }

    fn heartbeat(&self, segment_start: Option<DateTime<Utc>>) {
        let mut reg = self.registry.write();
        if let Some(st) = reg.get_mut(&self.camera.id) {
            st.last_heartbeat = Some(Instant::now());
            if segment_start.is_some() {
                st.last_segment_start = segment_start;
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        let mut reg = self.registry.write();
        if let Some(st) = reg.get_mut(&self.camera.id) {
            if st.state != state {
                debug!(camera = self.camera.id, from = ?st.state, to = ?state, "Worker state");
            }
            st.state = state;
            if state != WorkerState::Running {
                st.run_started_at = None;
            }
        }
    }
}

async fn next_stderr_line(lines: &mut Option<Lines<BufReader<ChildStderr>>>) -> Option<String> {
    match lines {
        Some(l) => l.next_line().await.unwrap_or(None),
        None => None,
    }
}

/// Deliver a signal to the encoder's process group (the worker spawns the
/// encoder as its own group leader).
fn signal_group(child: &Child, sig: Signal) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(-(pid as i32)), sig) {
            error!(pid, error = %e, "Signal delivery failed");
        }
    }
}
