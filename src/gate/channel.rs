//! Response signal channel.
//!
//! Responses arrive as small JSON files dropped into a signal
//! directory, one file per signal. A background watcher polls the
//! directory, delivers each signal to the gate, and removes the file.
//! Writing the file and consuming it are both atomic at the filesystem
//! level, so signals survive a process restart that happens between
//! the two.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SignalGate;

/// One inbound response signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSignal {
    pub question_id: Uuid,
    pub option_id: String,
}

/// Writes a response signal into `dir` for the watcher to pick up.
pub fn write_signal(dir: &Path, signal: &ResponseSignal) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(format!("{}.json", signal.question_id));
    let tmp_path = dir.join(format!(".{}.tmp", signal.question_id));
    let body = serde_json::to_vec_pretty(signal)?;
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}

/// Polls a signal directory and feeds signals to the gate.
pub struct SignalWatcher {
    gate: Arc<SignalGate>,
    dir: PathBuf,
    poll_interval: Duration,
}

impl SignalWatcher {
    pub fn new(gate: Arc<SignalGate>, dir: PathBuf) -> Self {
        Self {
            gate,
            dir,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs the polling loop until the task is aborted.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.drain_once() {
                tracing::warn!(dir = %self.dir.display(), error = %e, "signal poll failed");
            }
        }
    }

    /// Processes every signal file currently in the directory.
    pub fn drain_once(&self) -> std::io::Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let mut delivered = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|body| {
                    serde_json::from_str::<ResponseSignal>(&body).map_err(|e| e.to_string())
                }) {
                Ok(signal) => {
                    let resumed = self.gate.deliver(signal.question_id, &signal.option_id);
                    tracing::info!(
                        question_id = %signal.question_id,
                        option_id = %signal.option_id,
                        resumed,
                        "response signal consumed"
                    );
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "malformed signal file dropped");
                }
            }

            // Consumed either way; a malformed file would otherwise be
            // re-read forever.
            std::fs::remove_file(&path)?;
        }

        Ok(delivered)
    }
}
