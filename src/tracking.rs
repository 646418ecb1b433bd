//! Experiment tracking
//!
//! Runs report their config, per-step metrics and a final summary through the
//! [`Tracker`] trait. [`LocalTracker`] mirrors a hosted tracker's run layout
//! on disk under `<output_dir>/tracking/<project>/<run>/`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::utils::error::Result;

/// Environment variable that disables tracking when set to `disabled`
pub const TRACKING_MODE_ENV: &str = "WANDB_MODE";

pub trait Tracker {
    /// Record the run configuration once, before training starts
    fn log_config(&mut self, config: &Value) -> Result<()>;

    /// Record metrics for an optimizer step
    fn log_metrics(&mut self, step: usize, metrics: &BTreeMap<String, f64>) -> Result<()>;

    /// Record the final summary and close the run
    fn finish(&mut self, summary: &BTreeMap<String, f64>) -> Result<()>;
}

/// Tracker that records nothing
#[derive(Debug, Default)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn log_config(&mut self, _config: &Value) -> Result<()> {
        Ok(())
    }

    fn log_metrics(&mut self, _step: usize, _metrics: &BTreeMap<String, f64>) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, _summary: &BTreeMap<String, f64>) -> Result<()> {
        Ok(())
    }
}

/// Project and run naming for a tracked run
#[derive(Debug, Clone, Serialize)]
pub struct TrackingConfig {
    pub project: String,
    pub run_name: String,
    pub enabled: bool,
}

impl TrackingConfig {
    /// `disabled` wins over everything, including the environment
    pub fn new(project: &str, run_name: &str, disabled: bool) -> Self {
        let env_disabled = std::env::var(TRACKING_MODE_ENV)
            .map(|v| v.eq_ignore_ascii_case("disabled"))
            .unwrap_or(false);
        Self {
            project: project.to_string(),
            run_name: run_name.to_string(),
            enabled: !disabled && !env_disabled,
        }
    }
}

/// Tracker writing JSON files into a run directory
pub struct LocalTracker {
    run_dir: PathBuf,
    metrics: BufWriter<File>,
}

impl LocalTracker {
    pub fn create(root: &Path, config: &TrackingConfig) -> Result<Self> {
        let run_dir = root.join("tracking").join(&config.project).join(&config.run_name);
        fs::create_dir_all(&run_dir)?;

        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("metrics.jsonl"))?;

        info!("Tracking run '{}' in {:?}", config.run_name, run_dir);
        Ok(Self {
            run_dir,
            metrics: BufWriter::new(metrics),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

impl Tracker for LocalTracker {
    fn log_config(&mut self, config: &Value) -> Result<()> {
        fs::write(self.run_dir.join("config.json"), serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    fn log_metrics(&mut self, step: usize, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let line = json!({ "step": step, "metrics": metrics });
        writeln!(self.metrics, "{}", line)?;
        debug!("Tracked step {}: {:?}", step, metrics);
        Ok(())
    }

    fn finish(&mut self, summary: &BTreeMap<String, f64>) -> Result<()> {
        self.metrics.flush()?;
        let summary = json!({
            "finished_at": Local::now().to_rfc3339(),
            "summary": summary,
        });
        fs::write(self.run_dir.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;
        Ok(())
    }
}

/// Build the tracker selected by `config`
pub fn create_tracker(root: &Path, config: &TrackingConfig) -> Result<Box<dyn Tracker>> {
    if config.enabled {
        Ok(Box::new(LocalTracker::create(root, config)?))
    } else {
        info!("Experiment tracking disabled");
        Ok(Box::new(NoopTracker))
    }
}
