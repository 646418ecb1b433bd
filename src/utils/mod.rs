//! Utilities: error type, logging context and evaluation metrics

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig, LogContext, LogLevel};
pub use metrics::{ConfusionMatrix, EvalMetrics, RunningAverage};
