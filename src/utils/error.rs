//! Error Handling Module
//!
//! Defines the error type shared by the registry, dataset loading, and the
//! training loop. Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for training harness operations
#[derive(Error, Debug)]
pub enum Error {
    /// Model name not present in the registry
    #[error("Unknown model '{name}' (registered: {available})")]
    UnknownModel { name: String, available: String },

    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    Image(PathBuf, String),

    /// Error with dataset layout or contents
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error building or loading a model (missing pretrained files, bad head size)
    #[error("Model error: {0}")]
    Model(String),

    /// Error reading or writing a Burn record
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Error raised while training
    #[error("Training error: {0}")]
    Training(String),

    /// Invalid options, malformed JSON/TOML overrides
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

/// Convenience Result type for harness operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
