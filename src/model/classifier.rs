//! The closed set of trainable image classifiers

use std::path::Path;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};

use crate::model::config::{ArchitectureConfig, ModelKind};
use crate::model::convnext::ConvNextV2;
use crate::model::mobilenet::MobileNetV3;
use crate::model::vit::VisionTransformer;
use crate::utils::error::{Error, Result};

/// Weights file written next to `config.json`
pub const WEIGHTS_FILE: &str = "model.mpk";

type WeightsRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Module, Debug)]
pub enum ImageClassifier<B: Backend> {
    Vit(VisionTransformer<B>),
    ConvNextV2(ConvNextV2<B>),
    MobileNetV3(MobileNetV3<B>),
}

impl<B: Backend> ImageClassifier<B> {
    /// Freshly initialized weights for `config`
    pub fn init(config: &ArchitectureConfig, device: &B::Device) -> Self {
        match config {
            ArchitectureConfig::Vit(c) => ImageClassifier::Vit(c.init(device)),
            ArchitectureConfig::ConvNextV2(c) => ImageClassifier::ConvNextV2(c.init(device)),
            ArchitectureConfig::MobileNetV3(c) => ImageClassifier::MobileNetV3(c.init(device)),
        }
    }

    /// Images `[batch, 3, H, W]` to logits `[batch, num_classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            ImageClassifier::Vit(m) => m.forward(images),
            ImageClassifier::ConvNextV2(m) => m.forward(images),
            ImageClassifier::MobileNetV3(m) => m.forward(images),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            ImageClassifier::Vit(_) => ModelKind::Vit,
            ImageClassifier::ConvNextV2(_) => ModelKind::ConvNextV2,
            ImageClassifier::MobileNetV3(_) => ModelKind::MobileNetV3,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            ImageClassifier::Vit(m) => m.num_classes(),
            ImageClassifier::ConvNextV2(m) => m.num_classes(),
            ImageClassifier::MobileNetV3(m) => m.num_classes(),
        }
    }

    /// Swap the classification head for a new, randomly initialized one
    pub fn with_new_head(self, num_classes: usize, device: &B::Device) -> Self {
        match self {
            ImageClassifier::Vit(m) => ImageClassifier::Vit(m.with_new_head(num_classes, device)),
            ImageClassifier::ConvNextV2(m) => {
                ImageClassifier::ConvNextV2(m.with_new_head(num_classes, device))
            }
            ImageClassifier::MobileNetV3(m) => {
                ImageClassifier::MobileNetV3(m.with_new_head(num_classes, device))
            }
        }
    }

    /// Initialize from `config`, then load weights from `path`
    pub fn load(config: &ArchitectureConfig, path: &Path, device: &B::Device) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Model(format!("weights not found at {}", path.display())));
        }
        Self::init(config, device).load_weights(path, device)
    }

    /// Replace this model's parameters with the record at `path`
    pub fn load_weights(self, path: &Path, device: &B::Device) -> Result<Self> {
        self.load_file(path.to_path_buf(), &WeightsRecorder::new(), device)
            .map_err(|e| Error::Checkpoint(format!("failed to load {}: {:?}", path.display(), e)))
    }

    /// Write full-precision weights to `path` (the recorder picks the extension)
    pub fn save(&self, path: &Path) -> Result<()> {
        self.clone()
            .save_file(path.to_path_buf(), &WeightsRecorder::new())
            .map_err(|e| Error::Checkpoint(format!("failed to save {}: {:?}", path.display(), e)))
    }
}
