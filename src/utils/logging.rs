//! Logging Module
//!
//! Structured logging on top of `tracing`. The subscriber is installed once by
//! [`init_logging`], which hands back a [`LogContext`]. The context is then
//! passed explicitly to the registry, the model wrapper and the trainer, so
//! nothing below `main` depends on a global "debug mode" flag.

use std::time::Instant;

use tracing::Span;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::utils::error::{Error, Result};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose config used by `--debug`
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
        }
    }

    /// Pick the default or verbose config from the `--debug` flag
    pub fn from_debug_flag(debug: bool) -> Self {
        if debug {
            Self::verbose()
        } else {
            Self::default()
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_filter().to_uppercase())
    }
}

/// Logging handle threaded through the training pipeline.
///
/// Cloning is cheap; the span is reference counted by `tracing`.
#[derive(Debug, Clone)]
pub struct LogContext {
    level: LogLevel,
    span: Span,
}

impl LogContext {
    /// Create a context without touching the global subscriber.
    ///
    /// Library callers and tests use this when a subscriber is already
    /// installed (or not wanted at all).
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            span: Span::none(),
        }
    }

    /// Whether debug-level diagnostics (class weights, per-step losses) are wanted
    pub fn is_debug(&self) -> bool {
        matches!(self.level, LogLevel::Debug | LogLevel::Trace)
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// The run span; enter it around work that belongs to this run
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Derive a context whose span is nested under this one
    pub fn child(&self, name: &str) -> Self {
        let span = tracing::info_span!(parent: &self.span, "stage", name = %name);
        Self {
            level: self.level,
            span,
        }
    }

    /// Attach a run span carrying the run name
    pub fn with_run(mut self, run_name: &str) -> Self {
        self.span = tracing::info_span!("run", name = %run_name);
        self
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

/// Install the global subscriber and return the context to pass around.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(config: &LogConfig) -> Result<LogContext> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_ansi(config.ansi_colors)
                .with_target(config.include_target)
                .with_thread_ids(config.include_thread_ids),
        )
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    Ok(LogContext::new(config.level))
}

/// Epoch timing and summary logging for the training loop
pub struct TrainingLogger {
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl TrainingLogger {
    pub fn new(total_epochs: usize) -> Self {
        Self {
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    /// Log start of an epoch (0-indexed)
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();
        tracing::info!("Epoch {}/{} started", epoch + 1, self.total_epochs);
    }

    /// Log end of an epoch and return its duration in seconds
    pub fn end_epoch(&self, train_loss: f64, learning_rate: f64) -> f64 {
        let elapsed = self.epoch_start.elapsed().as_secs_f64();
        tracing::info!(
            "Epoch {}/{} done in {:.1}s - loss: {:.4}, lr: {:.2e}",
            self.epoch + 1,
            self.total_epochs,
            elapsed,
            train_loss,
            learning_rate
        );
        elapsed
    }

    /// Seconds since training started
    pub fn total_elapsed(&self) -> f64 {
        self.training_start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_selects_level() {
        assert_eq!(LogConfig::from_debug_flag(true).level, LogLevel::Debug);
        assert_eq!(LogConfig::from_debug_flag(false).level, LogLevel::Info);
    }

    #[test]
    fn test_context_debug() {
        assert!(LogContext::new(LogLevel::Debug).is_debug());
        assert!(LogContext::new(LogLevel::Trace).is_debug());
        assert!(!LogContext::new(LogLevel::Info).is_debug());
    }

    #[test]
    fn test_child_keeps_level() {
        let ctx = LogContext::new(LogLevel::Debug).with_run("ViT_test");
        let child = ctx.child("train");
        assert_eq!(child.level(), LogLevel::Debug);
    }

    #[test]
    fn test_level_display() {
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
    }
}
