//! Trigger events and the keyboard front-end.
//!
//! The keyboard trigger reads lines from standard input: `s` enqueues an
//! ALL clip request, `q` initiates shutdown. The HTTP front-end lives in
//! [`crate::api`] and calls the assembler directly because it has to wait
//! for the outcome.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A single-shot request delivered to the orchestrator.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    SaveClip {
        /// `None` = all cameras.
        camera_id: Option<String>,
        /// `None` = configured default duration.
        duration: Option<u64>,
        request_time: DateTime<Utc>,
    },
    Shutdown,
}

/// Spawn the stdin line reader.
pub fn spawn_keyboard(
    tx: mpsc::Sender<TriggerEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Keyboard trigger ready ('s' = save clip, 'q' = quit)");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(l)) => match l.trim() {
                    "s" => {
                        let _ = tx
                            .send(TriggerEvent::SaveClip {
                                camera_id: None,
                                duration: None,
                                request_time: Utc::now(),
                            })
                            .await;
                    }
                    "q" => {
                        let _ = tx.send(TriggerEvent::Shutdown).await;
                        break;
                    }
                    "" => {}
                    other => debug!(input = other, "Ignored keyboard input"),
                },
                Ok(None) => {
                    warn!("Stdin closed, keyboard trigger disabled");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Stdin read failed, keyboard trigger disabled");
                    break;
                }
            }
        }
    })
}
