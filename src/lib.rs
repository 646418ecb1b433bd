//! # cassava_train
//!
//! Fine-tunes image classifiers (ViT, ConvNeXtV2, MobileNetV3) on an
//! image-folder dataset using the Burn framework. The training loss is a
//! class-weighted, label-smoothed cross-entropy whose weights are derived from
//! the training partition's label frequencies.
//!
//! ## Modules
//!
//! - `dataset`: image-folder discovery, label mapping, transforms, Burn batching
//! - `model`: architectures, the model registry and the model wrapper
//! - `training`: class weights, weighted loss, options, scheduler, trainer loop
//! - `tracking`: local experiment tracker
//! - `config`: TOML run config and JSON overrides
//! - `backend`: compile-time backend and runtime device selection
//! - `utils`: errors, logging and metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cassava_train::dataset::load_splits;
//! use cassava_train::model::{load_model, ModelArgs};
//! use cassava_train::training::TrainingOptions;
//! use cassava_train::utils::LogContext;
//!
//! let splits = load_splits("data/cassava".as_ref(), "default", 42)?;
//! let ctx = LogContext::default();
//! let mut model = load_model("vit", &ModelArgs::default(), &splits.labels, &ctx)?;
//! let options = TrainingOptions::default();
//! model.train(&splits.train, &splits.validation, "output/vit".as_ref(), &options)?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod model;
pub mod tracking;
pub mod training;
pub mod utils;

pub use config::{load_toml_config, merge_json_overrides, RunConfig};
pub use dataset::{load_splits, DatasetSplits, ImageFolder, LabelMapping};
pub use model::{load_model, ModelArgs, ModelKind, ModelRegistry, ModelWrapper};
pub use training::{ClassWeights, TrainingOptions, WeightedCrossEntropyLoss};
pub use utils::error::{Error, Result};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
