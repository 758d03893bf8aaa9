//! Durable run checkpoints.
//!
//! Every phase transition is persisted before the next phase starts, so
//! a crash mid-pipeline resumes at the last completed phase instead of
//! replaying from scratch. Each checkpoint is a JSON envelope holding
//! the serialized run plus a sha256 checksum; a torn write fails the
//! checksum on load and is reported rather than silently resumed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::state::PipelineRun;
use crate::error::CheckpointError;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointEnvelope {
    run_id: Uuid,
    checksum: String,
    /// Serialized [`PipelineRun`], checksummed as written.
    payload: String,
}

/// File-backed checkpoint store, one file per run.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Persists the run state atomically (write to a temp file, then
    /// rename over the previous checkpoint).
    pub fn save(&self, run: &PipelineRun) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;

        let payload = serde_json::to_string(run)?;
        let envelope = CheckpointEnvelope {
            run_id: run.id,
            checksum: checksum(&payload),
            payload,
        };

        let final_path = self.path_for(run.id);
        let tmp_path = self.dir.join(format!(".{}.tmp", run.id));
        std::fs::write(&tmp_path, serde_json::to_vec_pretty(&envelope)?)?;
        std::fs::rename(&tmp_path, &final_path)?;

        tracing::debug!(
            run_id = %run.id,
            phase = %run.current_phase,
            path = %final_path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Loads and verifies a run checkpoint.
    pub fn load(&self, run_id: Uuid) -> Result<PipelineRun, CheckpointError> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Err(CheckpointError::NotFound(run_id));
        }

        let envelope: CheckpointEnvelope =
            serde_json::from_str(&std::fs::read_to_string(&path)?)?;

        let actual = checksum(&envelope.payload);
        if actual != envelope.checksum {
            return Err(CheckpointError::ChecksumMismatch {
                expected: envelope.checksum,
                actual,
            });
        }

        Ok(serde_json::from_str(&envelope.payload)?)
    }

    /// Removes a run's checkpoint, if present.
    pub fn remove(&self, run_id: Uuid) -> Result<(), CheckpointError> {
        let path = self.path_for(run_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Lists run ids with a stored checkpoint.
    pub fn list(&self) -> Result<Vec<Uuid>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(stem) = stem_of(&path) {
                if let Ok(id) = stem.parse() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn stem_of(path: &Path) -> Option<&str> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str())
}

fn checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}
