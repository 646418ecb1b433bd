//! Checkpointing and trainer state.
//!
//! Each checkpoint is a `checkpoint-<step>/` directory inside the run's
//! output directory holding the model record and a `trainer_state.json`
//! snapshot. The manager rotates old checkpoints when a limit is set and
//! never removes the best or the newest one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::classifier::{ImageClassifier, WEIGHTS_FILE};
use crate::utils::error::{Error, Result};

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One row of the log history (training or evaluation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

/// Progress of a run, persisted at every checkpoint and at the end
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<PathBuf>,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn new(max_steps: usize, num_train_epochs: usize) -> Self {
        Self {
            max_steps,
            num_train_epochs,
            ..Default::default()
        }
    }

    pub fn log(&mut self, values: BTreeMap<String, f64>) {
        self.log_history.push(LogEntry {
            step: self.global_step,
            epoch: self.epoch,
            values,
        });
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Serialization(format!("Failed to serialize trainer state: {}", e))
        })?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| {
            Error::Serialization(format!("Failed to deserialize trainer state: {}", e))
        })
    }
}

/// Writes and rotates `checkpoint-<step>` directories
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: Option<usize>,
}

impl CheckpointManager {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            save_total_limit: None,
        }
    }

    /// Keep at most `limit` checkpoints on disk
    pub fn save_total_limit(mut self, limit: Option<usize>) -> Self {
        self.save_total_limit = limit;
        self
    }

    pub fn checkpoint_dir(&self, step: usize) -> PathBuf {
        self.output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
    }

    /// Save model weights and trainer state for `state.global_step`
    pub fn save<B: Backend>(
        &self,
        model: &ImageClassifier<B>,
        state: &TrainerState,
    ) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(state.global_step);
        fs::create_dir_all(&dir)?;

        model.save(&dir.join(WEIGHTS_FILE))?;
        state.save(&dir.join(TRAINER_STATE_FILE))?;
        info!("Checkpoint saved to {:?}", dir);

        self.rotate(state.best_model_checkpoint.as_deref())?;
        Ok(dir)
    }

    /// All checkpoint directories, oldest step first
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.output_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.output_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let step = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(extract_step_from_dirname);
            if let Some(step) = step {
                checkpoints.push((step, path));
            }
        }
        checkpoints.sort_by_key(|(step, _)| *step);
        Ok(checkpoints)
    }

    /// Remove the oldest checkpoints beyond the limit, sparing `best`
    fn rotate(&self, best: Option<&Path>) -> Result<()> {
        let Some(limit) = self.save_total_limit else {
            return Ok(());
        };

        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= limit {
            return Ok(());
        }

        // The newest checkpoint is never a candidate
        let mut excess = checkpoints.len() - limit;
        for (_, path) in &checkpoints[..checkpoints.len() - 1] {
            if excess == 0 {
                break;
            }
            if best == Some(path.as_path()) {
                debug!("Keeping best checkpoint {:?}", path);
                continue;
            }
            match fs::remove_dir_all(path) {
                Ok(()) => info!("Removed old checkpoint: {:?}", path),
                Err(e) => warn!("Failed to remove old checkpoint {:?}: {}", path, e),
            }
            excess -= 1;
        }
        Ok(())
    }
}

/// Step number from a `checkpoint-<step>` directory name
pub fn extract_step_from_dirname(name: &str) -> Option<usize> {
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}
