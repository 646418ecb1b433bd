//! Model module
//!
//! - Burn implementations of ViT, ConvNeXtV2 and MobileNetV3 classifiers
//! - [`ImageClassifier`], the closed enum the trainer works with
//! - Typed model arguments and serialized architecture configs
//! - The name registry and the [`ModelWrapper`] that owns preprocessing

pub mod classifier;
pub mod config;
pub mod convnext;
pub mod mobilenet;
pub mod registry;
pub mod vit;
pub mod wrapper;

pub use classifier::ImageClassifier;
pub use config::{ArchitectureConfig, ModelArgs, ModelKind};
pub use registry::{load_model, ModelRegistry, ModelSpec};
pub use wrapper::ModelWrapper;
