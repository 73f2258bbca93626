//! Resilience supervisor — periodic health evaluation for all capture
//! workers plus global storage-pressure relief.
//!
//! Every cycle the supervisor reads the status registry and the buffer
//! index, computes a verdict per worker, and drives restarts with
//! exponential backoff. Free space on the memory-backed store is checked
//! each cycle; below the floor, oldest segments are dropped round-robin
//! across cameras regardless of the retention window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::BufferIndex;
use crate::capture::{StatusRegistry, WorkerCommand, WorkerState};
use crate::config::{Config, ReconnectConfig};
use crate::store::SegmentStore;

/// Fixed evaluation interval.
pub const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(10);

/// A worker counts as stalled when its newest segment is older than
/// `CHUNK_DURATION * STALL_FACTOR`.
pub const STALL_FACTOR: u32 = 3;

/// Free-space floor on the memory-backed store.
pub const STORAGE_FLOOR: f64 = 0.10;

/// A run must survive this long before its backoff counter resets.
pub const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Health verdict for a single worker, derived from process liveness,
/// newest-segment age and heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// Starting up or inside the post-spawn grace window.
    Waiting,
    /// Process alive but segments not advancing.
    Stalled,
    /// Encoder down, restart wanted.
    Failed,
    Stopped,
}

/// Pure verdict function; the supervisor feeds it observed ages.
pub fn assess_worker(
    state: WorkerState,
    newest_age: Option<Duration>,
    heartbeat_age: Option<Duration>,
    run_age: Option<Duration>,
    chunk_duration: Duration,
) -> HealthVerdict {
    match state {
        WorkerState::Stopped => HealthVerdict::Stopped,
        WorkerState::Starting | WorkerState::Backoff => HealthVerdict::Waiting,
        WorkerState::Failed => HealthVerdict::Failed,
        WorkerState::Running => {
            let stall_limit = chunk_duration * STALL_FACTOR;
            let segments_fresh = newest_age.map_or(false, |a| a < stall_limit);
            let heartbeat_fresh = heartbeat_age.map_or(false, |a| a < stall_limit);
            if segments_fresh && heartbeat_fresh {
                HealthVerdict::Healthy
            } else if run_age.map_or(false, |a| a < stall_limit) {
                // Grace window: the encoder has not had time to produce
                // its first aligned segment yet.
                HealthVerdict::Waiting
            } else {
                HealthVerdict::Stalled
            }
        }
    }
}

/// Restart delay for the k-th consecutive attempt: `min(initial * 2^k, max)`.
pub fn backoff_delay(policy: &ReconnectConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    policy
        .initial_delay
        .checked_mul(factor)
        .map_or(policy.max_delay, |d| d.min(policy.max_delay))
}

/// Storage snapshot surfaced via `/status`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StorageReport {
    pub free_fraction: f64,
    pub pressure: bool,
}

pub struct Supervisor {
    config: Arc<Config>,
    store: Arc<SegmentStore>,
    index: Arc<BufferIndex>,
    registry: StatusRegistry,
    workers: HashMap<String, mpsc::Sender<WorkerCommand>>,
    report: Arc<RwLock<StorageReport>>,
    fatal_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
    /// Round-robin cursor for emergency eviction, persisted across cycles.
    evict_cursor: usize,
    /// Consecutive cycles spent under storage pressure.
    pressure_cycles: u32,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<SegmentStore>,
        index: Arc<BufferIndex>,
        registry: StatusRegistry,
        workers: HashMap<String, mpsc::Sender<WorkerCommand>>,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<bool>, Arc<RwLock<StorageReport>>) {
        let (fatal_tx, fatal_rx) = watch::channel(false);
        let report = Arc::new(RwLock::new(StorageReport {
            free_fraction: 1.0,
            pressure: false,
        }));
        let supervisor = Supervisor {
            config,
            store,
            index,
            registry,
            workers,
            report: report.clone(),
            fatal_tx,
            shutdown,
            evict_cursor: 0,
            pressure_cycles: 0,
        };
        (supervisor, fatal_rx, report)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            interval_s = SUPERVISOR_INTERVAL.as_secs(),
            "Supervisor started"
        );
        let mut ticker = tokio::time::interval(SUPERVISOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so workers get a full
        // interval to come up.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.cycle().await,
            }
        }
        info!("Supervisor stopped");
    }

    async fn cycle(&mut self) {
        let now = Instant::now();
        let chunk = Duration::from_secs(self.config.chunk_duration);
        let buffer_status: HashMap<String, Option<f64>> = self
            .index
            .status()
            .into_iter()
            .map(|s| (s.camera_id.clone(), s.newest_age_seconds))
            .collect();

        let mut quarantined = 0usize;
        let camera_ids: Vec<String> = self.workers.keys().cloned().collect();
        for camera_id in &camera_ids {
            let status = match self.registry.read().get(camera_id) {
                Some(s) => s.clone(),
                None => continue,
            };
            if status.quarantined {
                quarantined += 1;
                continue;
            }

            // A nominal-duration segment closed early can report a small
            // negative age; clamp instead of dropping it.
            let newest_age = buffer_status
                .get(camera_id)
                .copied()
                .flatten()
                .map(|a| Duration::from_secs_f64(a.max(0.0)));
            let heartbeat_age = status.last_heartbeat.map(|t| now.duration_since(t));
            let run_age = status.run_started_at.map(|t| now.duration_since(t));

            let verdict = assess_worker(status.state, newest_age, heartbeat_age, run_age, chunk);
            debug!(camera = %camera_id, ?verdict, "Health verdict");

            match verdict {
                HealthVerdict::Healthy => {
                    if status.backoff_attempt > 0
                        && run_age.map_or(false, |a| a > STABILITY_THRESHOLD)
                    {
                        info!(camera = %camera_id, "Stable run, backoff reset");
                        let mut reg = self.registry.write();
                        if let Some(st) = reg.get_mut(camera_id) {
                            st.backoff_attempt = 0;
                            st.next_retry_at = None;
                        }
                    }
                }
                HealthVerdict::Stalled => {
                    warn!(camera = %camera_id, "Worker stalled, terminating encoder");
                    self.send(camera_id, WorkerCommand::Terminate);
                }
                HealthVerdict::Failed => self.handle_failed(camera_id, &status, now),
                HealthVerdict::Waiting => {
                    // A scheduled restart fires here once its delay elapses.
                    if status.state == WorkerState::Backoff {
                        if let Some(at) = status.next_retry_at {
                            if now >= at {
                                info!(camera = %camera_id, attempt = status.backoff_attempt, "Restarting encoder");
                                self.send(camera_id, WorkerCommand::Restart);
                                let mut reg = self.registry.write();
                                if let Some(st) = reg.get_mut(camera_id) {
                                    st.next_retry_at = None;
                                }
                            }
                        }
                    }
                }
                HealthVerdict::Stopped => {}
            }
        }

        if !camera_ids.is_empty() && quarantined == camera_ids.len() {
            error!("All cameras quarantined, giving up");
            let _ = self.fatal_tx.send(true);
        }

        self.check_pressure();
    }

    /// Schedule a backoff restart for a failed worker, or quarantine it
    /// once the attempt cap is reached.
    fn handle_failed(&mut self, camera_id: &str, status: &crate::capture::WorkerStatus, now: Instant) {
        let policy = &self.config.reconnect;
        if policy.max_attempts > 0 && status.backoff_attempt >= policy.max_attempts {
            error!(
                camera = %camera_id,
                attempts = status.backoff_attempt,
                "Retry cap reached, camera quarantined"
            );
            let mut reg = self.registry.write();
            if let Some(st) = reg.get_mut(camera_id) {
                st.quarantined = true;
                st.next_retry_at = None;
            }
            return;
        }

        let delay = backoff_delay(policy, status.backoff_attempt);
        info!(
            camera = %camera_id,
            attempt = status.backoff_attempt + 1,
            delay_s = delay.as_secs(),
            "Restart scheduled"
        );
        let mut reg = self.registry.write();
        if let Some(st) = reg.get_mut(camera_id) {
            st.state = WorkerState::Backoff;
            st.backoff_attempt += 1;
            st.next_retry_at = Some(now + delay);
        }
    }

    fn send(&self, camera_id: &str, cmd: WorkerCommand) {
        if let Some(tx) = self.workers.get(camera_id) {
            if let Err(e) = tx.try_send(cmd) {
                warn!(camera = %camera_id, error = %e, "Worker command dropped");
            }
        }
    }

    /// Evaluate free space; under the floor, evict oldest segments
    /// round-robin across cameras until the floor clears.
    fn check_pressure(&mut self) {
        let free = match self.store.free_space_fraction() {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "Free-space check failed");
                return;
            }
        };

        if free >= STORAGE_FLOOR {
            self.pressure_cycles = 0;
            *self.report.write() = StorageReport {
                free_fraction: free,
                pressure: false,
            };
            return;
        }

        self.pressure_cycles += 1;
        *self.report.write() = StorageReport {
            free_fraction: free,
            pressure: true,
        };
        if self.pressure_cycles > 1 {
            warn!(
                free_pct = format!("{:.1}", free * 100.0),
                cycles = self.pressure_cycles,
                "Storage pressure persists"
            );
        }

        let cameras = self.index.cameras();
        if cameras.is_empty() {
            return;
        }
        let mut dropped = 0usize;
        let mut idle_rounds = 0usize;
        loop {
            let free_now = self.store.free_space_fraction().unwrap_or(1.0);
            if free_now >= STORAGE_FLOOR {
                break;
            }
            let camera = &cameras[self.evict_cursor % cameras.len()];
            self.evict_cursor = self.evict_cursor.wrapping_add(1);
            if self.index.evict_oldest(camera).is_some() {
                dropped += 1;
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                if idle_rounds >= cameras.len() {
                    // Nothing left to drop anywhere.
                    break;
                }
            }
        }
        if dropped > 0 {
            warn!(dropped, "Emergency eviction relieved storage pressure");
        }
    }
}
