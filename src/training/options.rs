//! Training options
//!
//! [`TrainingOptions`] is the typed form of `--training_args` and of the
//! `[training]` table in the config file. Unset fields keep the defaults
//! below; unknown keys are rejected.

use serde::{Deserialize, Serialize};

use crate::utils::error::{Error, Result};

/// When to run an action (evaluation or checkpointing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStrategy {
    No,
    Steps,
    Epoch,
}

/// Learning-rate schedule applied per optimizer step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Linear,
    Cosine,
    Constant,
}

/// Metric used to pick the best checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BestMetric {
    Accuracy,
    Loss,
}

impl BestMetric {
    /// Whether `candidate` beats `best`
    pub fn improves(&self, candidate: f64, best: f64) -> bool {
        match self {
            BestMetric::Accuracy => candidate > best,
            BestMetric::Loss => candidate < best,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BestMetric::Accuracy => "eval_accuracy",
            BestMetric::Loss => "eval_loss",
        }
    }
}

/// Where run metrics are reported besides the log directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportTo {
    Wandb,
    None,
}

/// Hyperparameters and bookkeeping for one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingOptions {
    #[serde(alias = "lr")]
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    /// Label smoothing factor for the weighted loss
    pub label_smoothing: f32,

    pub eval_strategy: IntervalStrategy,
    pub save_strategy: IntervalStrategy,
    pub eval_steps: usize,
    pub save_steps: usize,
    pub logging_steps: usize,

    pub load_best_model_at_end: bool,
    pub metric_for_best_model: BestMetric,
    /// Keep at most this many checkpoints (the best one is never removed)
    pub save_total_limit: Option<usize>,

    /// Relative to the run's output directory
    pub logging_dir: String,
    pub report_to: ReportTo,

    pub lr_scheduler_type: SchedulerKind,
    pub warmup_ratio: f64,
    /// Gradient clipping by global norm; `None` disables clipping
    pub max_grad_norm: Option<f32>,

    pub dataloader_num_workers: usize,
    pub seed: u64,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            weight_decay: 0.01,
            num_train_epochs: 50,
            per_device_train_batch_size: 16,
            per_device_eval_batch_size: 16,
            label_smoothing: 0.06,
            eval_strategy: IntervalStrategy::Epoch,
            save_strategy: IntervalStrategy::Epoch,
            eval_steps: 500,
            save_steps: 500,
            logging_steps: 10,
            load_best_model_at_end: true,
            metric_for_best_model: BestMetric::Accuracy,
            save_total_limit: None,
            logging_dir: "logs".to_string(),
            report_to: ReportTo::Wandb,
            lr_scheduler_type: SchedulerKind::Linear,
            warmup_ratio: 0.0,
            max_grad_norm: Some(1.0),
            dataloader_num_workers: 0,
            seed: 42,
        }
    }
}

impl TrainingOptions {
    /// Accepted alternative keys, mapped to their field names
    pub const KEY_ALIASES: &'static [(&'static str, &'static str)] = &[("lr", "learning_rate")];

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::Config("weight_decay must be non-negative".into()));
        }
        if self.num_train_epochs == 0 {
            return Err(Error::Config("num_train_epochs must be greater than 0".into()));
        }
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return Err(Error::Config("batch sizes must be greater than 0".into()));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(Error::Config(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(Error::Config("warmup_ratio must be in [0, 1]".into()));
        }
        if self.logging_steps == 0 {
            return Err(Error::Config("logging_steps must be greater than 0".into()));
        }
        if self.eval_strategy == IntervalStrategy::Steps && self.eval_steps == 0 {
            return Err(Error::Config("eval_steps must be greater than 0".into()));
        }
        if self.save_strategy == IntervalStrategy::Steps && self.save_steps == 0 {
            return Err(Error::Config("save_steps must be greater than 0".into()));
        }
        if self.save_total_limit == Some(0) {
            return Err(Error::Config("save_total_limit must be at least 1".into()));
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return Err(Error::Config("max_grad_norm must be positive".into()));
            }
        }

        if self.load_best_model_at_end {
            if self.eval_strategy == IntervalStrategy::No {
                return Err(Error::Config(
                    "load_best_model_at_end requires an evaluation strategy".into(),
                ));
            }
            if self.eval_strategy != self.save_strategy {
                return Err(Error::Config(format!(
                    "load_best_model_at_end requires save_strategy ({:?}) \
                     to match eval_strategy ({:?})",
                    self.save_strategy, self.eval_strategy
                )));
            }
            if self.eval_strategy == IntervalStrategy::Steps
                && self.save_steps % self.eval_steps != 0
            {
                return Err(Error::Config(format!(
                    "save_steps ({}) must be a multiple of eval_steps ({})",
                    self.save_steps, self.eval_steps
                )));
            }
        }
        Ok(())
    }

    /// Number of optimizer steps for the whole run
    pub fn total_steps(&self, train_len: usize) -> usize {
        self.steps_per_epoch(train_len) * self.num_train_epochs
    }

    pub fn steps_per_epoch(&self, train_len: usize) -> usize {
        train_len.div_ceil(self.per_device_train_batch_size).max(1)
    }

    pub fn warmup_steps(&self, total_steps: usize) -> usize {
        (self.warmup_ratio * total_steps as f64).ceil() as usize
    }

    /// Whether evaluation runs after `global_step` (mid-epoch) under the steps strategy
    pub fn eval_at_step(&self, global_step: usize) -> bool {
        self.eval_strategy == IntervalStrategy::Steps && global_step % self.eval_steps == 0
    }

    pub fn save_at_step(&self, global_step: usize) -> bool {
        self.save_strategy == IntervalStrategy::Steps && global_step % self.save_steps == 0
    }
}
