//! Orchestrator: wires the segment store, buffer index, capture workers,
//! supervisor and trigger front-end together, and owns shutdown.
//!
//! Workers launch with a staggered delay so a fleet power-on does not hit
//! every camera at the same instant. Shutdown cancels the shared token,
//! asks every worker to stop, waits inside a global deadline, and aborts
//! survivors. Segment files are left in place so a successor process can
//! reclaim them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::buffer::BufferIndex;
use crate::capture::{new_registry, CaptureWorker, StatusRegistry, WorkerCommand};
use crate::clip::ClipAssembler;
use crate::config::{Config, TriggerMode};
use crate::error::Result;
use crate::store::SegmentStore;
use crate::supervisor::Supervisor;
use crate::trigger::{self, TriggerEvent};

/// Delay between successive worker launches.
pub const WORKER_STAGGER: Duration = Duration::from_millis(250);

/// Total deadline for shutdown before survivors are aborted.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Process exit codes.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_GAVE_UP: i32 = 2;

struct WorkerHandle {
    camera_id: String,
    handle: JoinHandle<()>,
    cmd_tx: mpsc::Sender<WorkerCommand>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    registry: StatusRegistry,
    workers: Vec<WorkerHandle>,
    supervisor_handle: JoinHandle<()>,
    front_end: Option<JoinHandle<()>>,
    assembler: Arc<ClipAssembler>,
    trigger_rx: mpsc::Receiver<TriggerEvent>,
    /// Kept so the trigger channel never reports closed while we run.
    _trigger_tx: mpsc::Sender<TriggerEvent>,
    fatal_rx: tokio::sync::watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Build and start every component. Errors here are fatal (exit 1).
    pub fn start(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(SegmentStore::open(&config.temp_dir)?);
        std::fs::create_dir_all(&config.clips_dir)?;

        let index = Arc::new(BufferIndex::new(
            store.clone(),
            config.buffer_seconds,
            config.chunk_duration,
        ));
        for camera in &config.cameras {
            index.register_camera(&camera.id);
        }
        let registry = new_registry(&config.cameras);
        let shutdown = CancellationToken::new();

        info!(
            cameras = config.cameras.len(),
            chunk_s = config.chunk_duration,
            buffer_s = config.buffer_seconds,
            temp_dir = ?config.temp_dir,
            clips_dir = ?config.clips_dir,
            "Starting pre-roll recorder"
        );

        // Capture workers, staggered.
        let mut workers = Vec::new();
        let mut command_txs = HashMap::new();
        for (i, camera) in config.cameras.iter().enumerate() {
            let (handle, cmd_tx) = CaptureWorker::spawn(
                camera.clone(),
                config.clone(),
                store.clone(),
                index.clone(),
                registry.clone(),
                shutdown.clone(),
                WORKER_STAGGER * i as u32,
            );
            command_txs.insert(camera.id.clone(), cmd_tx.clone());
            workers.push(WorkerHandle {
                camera_id: camera.id.clone(),
                handle,
                cmd_tx,
            });
        }

        let (supervisor, fatal_rx, storage_report) = Supervisor::new(
            config.clone(),
            store.clone(),
            index.clone(),
            registry.clone(),
            command_txs,
            shutdown.clone(),
        );
        let supervisor_handle = supervisor.spawn();

        let assembler = Arc::new(ClipAssembler::new(config.clone(), index.clone()));

        let (trigger_tx, trigger_rx) = mpsc::channel(16);
        let front_end = match config.trigger_mode {
            TriggerMode::Keyboard => {
                Some(trigger::spawn_keyboard(trigger_tx.clone(), shutdown.clone()))
            }
            TriggerMode::Http => {
                let state = Arc::new(AppState {
                    config: config.clone(),
                    index: index.clone(),
                    registry: registry.clone(),
                    assembler: assembler.clone(),
                    storage: storage_report,
                });
                let port = config.http_port;
                let token = shutdown.clone();
                Some(tokio::spawn(async move {
                    api::start_server(state, port, token).await;
                }))
            }
        };

        Ok(Orchestrator {
            config,
            registry,
            workers,
            supervisor_handle,
            front_end,
            assembler,
            trigger_rx,
            _trigger_tx: trigger_tx,
            fatal_rx,
            shutdown,
        })
    }

    /// Main event loop; returns the process exit code.
    pub async fn run(mut self) -> i32 {
        let mut exit_code = EXIT_OK;
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Received CTRL+C, shutting down…"),
                        Err(e) => error!(error = %e, "Signal error, shutting down"),
                    }
                    break;
                }
                changed = self.fatal_rx.changed() => {
                    if changed.is_err() {
                        error!("Supervisor channel closed unexpectedly");
                        break;
                    }
                    if *self.fatal_rx.borrow() {
                        error!("Supervisor gave up on all cameras");
                        exit_code = EXIT_GAVE_UP;
                        break;
                    }
                }
                event = self.trigger_rx.recv() => match event {
                    Some(TriggerEvent::SaveClip { camera_id, duration, request_time }) => {
                        self.dispatch_clip(camera_id, duration, request_time);
                    }
                    Some(TriggerEvent::Shutdown) | None => {
                        info!("Shutdown requested by trigger");
                        break;
                    }
                }
            }
        }

        self.shutdown_all().await;
        exit_code
    }

    /// Run a clip request in the background; failures are logged, never fatal.
    fn dispatch_clip(
        &self,
        camera_id: Option<String>,
        duration: Option<u64>,
        request_time: chrono::DateTime<chrono::Utc>,
    ) {
        let assembler = self.assembler.clone();
        let duration = self.config.clamp_clip_duration(duration);
        tokio::spawn(async move {
            match camera_id {
                Some(id) => {
                    if let Err(e) = assembler.save_clip(&id, duration, request_time).await {
                        warn!(camera = id, error = %e, "Clip request failed");
                    }
                }
                None => {
                    for (id, result) in assembler.save_all(duration, request_time).await {
                        if let Err(e) = result {
                            warn!(camera = id, error = %e, "Clip request failed");
                        }
                    }
                }
            }
        });
    }

    async fn shutdown_all(self) {
        let deadline = Instant::now() + SHUTDOWN_DEADLINE;

        // Stop the trigger front-end first so no new requests arrive.
        self.shutdown.cancel();
        if let Some(handle) = self.front_end {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }

        for w in &self.workers {
            let _ = w.cmd_tx.try_send(WorkerCommand::Stop);
        }
        for w in self.workers {
            let abort = w.handle.abort_handle();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, w.handle).await.is_err() {
                warn!(camera = w.camera_id, "Worker missed the shutdown deadline, aborting");
                // Aborting drops the child handle; kill_on_drop reaps the
                // encoder's process group.
                abort.abort();
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, self.supervisor_handle).await.is_err() {
            warn!("Supervisor missed the shutdown deadline");
        }

        // Buffer segments stay on the memory-backed store for a successor.
        let states: Vec<String> = {
            let reg = self.registry.read();
            reg.iter()
                .map(|(id, st)| format!("{id}={:?}", st.state))
                .collect()
        };
        info!(workers = states.join(","), "Shutdown complete");
    }
}
