//! Model wrapper
//!
//! [`ModelWrapper`] bundles a classifier with its preprocessor settings, the
//! label mapping it predicts over and the transform pipelines derived from
//! the preprocessor. Its `train` method computes class weights, installs the
//! weighted loss and hands off to [`WeightedTrainer`].
//!
//! A model directory (pretrained input or training output) contains
//! `config.json`, `model.mpk`, `preprocessor_config.json` and `labels.json`;
//! only the first two are required when loading a pretrained starting point.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::DataLoaderBuilder,
    module::{AutodiffModule, Module},
    tensor::backend::AutodiffBackend,
};
use tracing::{debug, info, warn};

use crate::dataset::burn_dataset::{ImageBatcher, TransformedImageDataset};
use crate::dataset::labels::LabelMapping;
use crate::dataset::loader::ImageFolder;
use crate::dataset::transform::{PreprocessorConfig, TransformPipeline};
use crate::model::classifier::{ImageClassifier, WEIGHTS_FILE};
use crate::model::config::{ArchitectureConfig, ModelArgs, ModelKind};
use crate::tracking::{create_tracker, NoopTracker, Tracker, TrackingConfig};
use crate::training::class_weights::ClassWeights;
use crate::training::loss::WeightedCrossEntropyLossConfig;
use crate::training::options::{ReportTo, TrainingOptions};
use crate::training::trainer::{evaluate_model, WeightedTrainer};
use crate::utils::error::{Error, Result};
use crate::utils::logging::LogContext;
use crate::utils::metrics::EvalMetrics;

pub const CONFIG_FILE: &str = "config.json";
pub const PREPROCESSOR_FILE: &str = "preprocessor_config.json";
pub const LABELS_FILE: &str = "labels.json";

/// A classifier plus everything needed to feed it and to persist it
pub struct ModelWrapper<B: AutodiffBackend> {
    model: ImageClassifier<B>,
    architecture: ArchitectureConfig,
    preprocessor: PreprocessorConfig,
    labels: LabelMapping,
    device: B::Device,
    ctx: LogContext,
    tracking: Option<TrackingConfig>,
}

impl<B: AutodiffBackend> std::fmt::Debug for ModelWrapper<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelWrapper")
            .field("name", &self.name())
            .field("num_classes", &self.labels.len())
            .field("preprocessor", &self.preprocessor)
            .finish()
    }
}

impl<B: AutodiffBackend> ModelWrapper<B> {
    /// Build a wrapper for `kind`: from `args.pretrained` if set, freshly
    /// initialized otherwise. The head always ends up with `labels.len()` outputs.
    pub fn new(
        kind: ModelKind,
        args: &ModelArgs,
        labels: LabelMapping,
        device: B::Device,
        ctx: LogContext,
    ) -> Result<Self> {
        args.validate_for(kind)?;
        let num_classes = labels.len();

        let (model, architecture, preprocessor) = match &args.pretrained {
            Some(dir) => Self::load_pretrained(kind, dir, args, num_classes, &device)?,
            None => {
                let architecture = args.architecture(kind, num_classes)?;
                let model = ImageClassifier::init(&architecture, &device);
                (model, architecture, args.preprocessor(kind))
            }
        };

        preprocessor.validate()?;
        architecture.check_input_size(preprocessor.crop_size())?;

        info!("Built {} with {} output classes", kind, num_classes);
        Ok(Self {
            model,
            architecture,
            preprocessor,
            labels,
            device,
            ctx,
            tracking: None,
        })
    }

    fn load_pretrained(
        kind: ModelKind,
        dir: &Path,
        args: &ModelArgs,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<(ImageClassifier<B>, ArchitectureConfig, PreprocessorConfig)> {
        if !dir.is_dir() {
            return Err(Error::Model(format!(
                "pretrained directory {} does not exist",
                dir.display()
            )));
        }
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(Error::Model(format!("missing {} in {}", CONFIG_FILE, dir.display())));
        }

        let architecture = ArchitectureConfig::load(&config_path)?;
        if architecture.kind() != kind {
            return Err(Error::Model(format!(
                "{} holds a {} checkpoint, not {}",
                dir.display(),
                architecture.kind(),
                kind
            )));
        }

        let mut model = ImageClassifier::load(&architecture, &dir.join(WEIGHTS_FILE), device)?;
        info!("Loaded pretrained {} from {:?}", kind, dir);

        let architecture = if architecture.num_classes() != num_classes {
            warn!(
                "Checkpoint head has {} classes but the dataset has {}; reinitializing the head",
                architecture.num_classes(),
                num_classes
            );
            model = model.with_new_head(num_classes, device);
            architecture.with_num_classes(num_classes)
        } else {
            architecture
        };

        if args.dropout.is_some() {
            warn!("dropout is fixed by the pretrained config; ignoring the override");
        }

        let preprocessor_path = dir.join(PREPROCESSOR_FILE);
        let base = if preprocessor_path.exists() {
            PreprocessorConfig::load(&preprocessor_path).map_err(|e| {
                Error::Model(format!("invalid {}: {}", preprocessor_path.display(), e))
            })?
        } else {
            debug!("No {} in {:?}; using {} defaults", PREPROCESSOR_FILE, dir, kind);
            let size = architecture
                .fixed_image_size()
                .map(|s| s as u32)
                .unwrap_or(crate::model::config::DEFAULT_IMAGE_SIZE);
            kind.default_preprocessor(size)
        };

        Ok((model, architecture, args.apply_preprocessor_overrides(base)))
    }

    /// Reload a directory written by [`ModelWrapper::save_pretrained`]
    pub fn from_dir(dir: &Path, device: B::Device, ctx: LogContext) -> Result<Self> {
        let labels_path = dir.join(LABELS_FILE);
        if !labels_path.exists() {
            return Err(Error::Model(format!("missing {} in {}", LABELS_FILE, dir.display())));
        }
        let labels = LabelMapping::load(&labels_path)?;
        let kind = ArchitectureConfig::load(&dir.join(CONFIG_FILE))?.kind();

        let args = ModelArgs {
            pretrained: Some(dir.to_path_buf()),
            ..Default::default()
        };
        Self::new(kind, &args, labels, device, ctx)
    }

    /// Report metrics to a tracker during `train`
    pub fn with_tracking(mut self, tracking: TrackingConfig) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Display name, e.g. "ViT"
    pub fn name(&self) -> &'static str {
        self.kind().display_name()
    }

    pub fn kind(&self) -> ModelKind {
        self.architecture.kind()
    }

    pub fn model(&self) -> &ImageClassifier<B> {
        &self.model
    }

    pub fn architecture(&self) -> &ArchitectureConfig {
        &self.architecture
    }

    pub fn preprocessor(&self) -> &PreprocessorConfig {
        &self.preprocessor
    }

    pub fn labels(&self) -> &LabelMapping {
        &self.labels
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Random resized crop, horizontal flip, to-tensor, normalize
    pub fn train_transforms(&self) -> TransformPipeline {
        TransformPipeline::train(&self.preprocessor)
    }

    /// Resize, center crop, to-tensor, normalize
    pub fn eval_transforms(&self) -> TransformPipeline {
        TransformPipeline::eval(&self.preprocessor)
    }

    /// Train on `train_set`, evaluating on `val_set`, writing checkpoints, logs
    /// and the final model files into `output_dir`.
    pub fn train(
        &mut self,
        train_set: &ImageFolder,
        val_set: &ImageFolder,
        output_dir: &Path,
        options: &TrainingOptions,
    ) -> Result<()> {
        options.validate()?;
        let ctx = self.ctx.child("train");
        let _span = ctx.span().clone().entered();

        let train_transforms = self.train_transforms();
        let eval_transforms = self.eval_transforms();

        let class_weights = ClassWeights::from_labels(&train_set.labels());
        if ctx.is_debug() {
            for (label, weight) in class_weights.iter() {
                debug!(
                    "class weight {} ({}): {:.4} over {} samples",
                    label,
                    self.labels.name(label).unwrap_or("?"),
                    weight,
                    class_weights.count(label)
                );
            }
        }
        let weights = class_weights.dense(self.labels.len())?;

        let loss = WeightedCrossEntropyLossConfig::new(weights)
            .with_smoothing(options.label_smoothing)
            .init()?;

        let tracker: Box<dyn Tracker> = match (&self.tracking, options.report_to) {
            (Some(tracking), ReportTo::Wandb) => create_tracker(output_dir, tracking)?,
            _ => Box::new(NoopTracker),
        };

        let train_data = TransformedImageDataset::new(train_set, train_transforms, options.seed);
        let val_data = TransformedImageDataset::new(val_set, eval_transforms, options.seed);

        let outcome = WeightedTrainer::new(
            self.model.clone(),
            loss,
            options.clone(),
            output_dir,
            self.device.clone(),
            ctx.child("loop"),
        )
        .with_tracker(tracker)
        .train(train_data, val_data)?;

        self.model = outcome.model;
        let saved = self.save_pretrained(output_dir)?;
        info!("Saved {} to {:?}", self.name(), saved);
        Ok(())
    }

    /// Evaluate on `folder` with the eval transforms.
    ///
    /// The reported loss is unweighted cross-entropy: evaluation has no
    /// training partition to derive class weights from.
    pub fn evaluate(&self, folder: &ImageFolder, batch_size: usize) -> Result<EvalMetrics> {
        let model = self.model.valid();
        let device = model.devices().into_iter().next().unwrap_or_default();
        let size = self.preprocessor.crop_size() as usize;

        let loader = DataLoaderBuilder::new(ImageBatcher::<B::InnerBackend>::new(device, size))
            .batch_size(batch_size.max(1))
            .build(TransformedImageDataset::new(folder, self.eval_transforms(), 0));
        let loss = WeightedCrossEntropyLossConfig::new(vec![1.0; self.labels.len()]).init()?;

        Ok(evaluate_model(&model, &loss, &loader)?.with_class_names(&self.labels.names()))
    }

    /// Write `config.json`, `model.mpk`, `preprocessor_config.json` and `labels.json`
    pub fn save_pretrained(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        self.architecture.save(&dir.join(CONFIG_FILE))?;
        self.model.save(&dir.join(WEIGHTS_FILE))?;
        self.preprocessor.save(&dir.join(PREPROCESSOR_FILE))?;
        self.labels.save(&dir.join(LABELS_FILE))?;
        Ok(dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::loader::load_splits;
    use crate::dataset::loader::tests::write_image_folder;
    use crate::training::checkpoint::TRAINER_STATE_FILE;
    use crate::training::options::IntervalStrategy;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_vit_args() -> ModelArgs {
        ModelArgs {
            image_size: Some(16),
            patch_size: Some(8),
            hidden_size: Some(8),
            num_hidden_layers: Some(1),
            num_attention_heads: Some(2),
            intermediate_size: Some(16),
            ..Default::default()
        }
    }

    fn labels(n: usize) -> LabelMapping {
        LabelMapping::from_class_names((0..n).map(|i| format!("class_{}", i))).unwrap()
    }

    fn build(kind: ModelKind, args: &ModelArgs, n: usize) -> Result<ModelWrapper<TestBackend>> {
        ModelWrapper::new(kind, args, labels(n), Default::default(), LogContext::default())
    }

    fn wrapper(n: usize) -> ModelWrapper<TestBackend> {
        build(ModelKind::Vit, &tiny_vit_args(), n).unwrap()
    }

    #[test]
    fn test_fresh_wrapper() {
        let w = wrapper(3);
        assert_eq!(w.name(), "ViT");
        assert_eq!(w.model().num_classes(), 3);
        assert_eq!(w.preprocessor().image_mean, [0.5; 3]);
        assert_eq!(w.train_transforms().output_size(), 16);
        assert!(w.train_transforms().is_random());
        assert!(!w.eval_transforms().is_random());
    }

    #[test]
    fn test_vit_size_mismatch_is_config_error() {
        let dir = TempDir::new().unwrap();
        wrapper(2).save_pretrained(dir.path()).unwrap();
        let args = ModelArgs {
            pretrained: Some(dir.path().to_path_buf()),
            image_size: Some(32),
            ..Default::default()
        };
        let result = build(ModelKind::Vit, &args, 2);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_convnext_rejects_undersized_inputs() {
        let args = ModelArgs {
            image_size: Some(16),
            depths: Some(vec![1, 1, 1, 1]),
            hidden_sizes: Some(vec![4, 4, 4, 4]),
            ..Default::default()
        };
        let result = build(ModelKind::ConvNextV2, &args, 2);
        assert!(matches!(result, Err(Error::Config(_))));

        let args = ModelArgs {
            image_size: Some(32),
            ..args
        };
        let w = build(ModelKind::ConvNextV2, &args, 2).unwrap();
        assert_eq!(w.model().num_classes(), 2);
    }

    #[test]
    fn test_missing_pretrained_dir() {
        let args = ModelArgs {
            pretrained: Some(PathBuf::from("/nonexistent/checkpoint")),
            ..Default::default()
        };
        let result = build(ModelKind::Vit, &args, 2);
        assert!(matches!(result, Err(Error::Model(_))));
    }

    #[test]
    fn test_pretrained_head_mismatch_reinitializes() {
        let dir = TempDir::new().unwrap();
        wrapper(5).save_pretrained(dir.path()).unwrap();

        let args = ModelArgs {
            pretrained: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let w = build(ModelKind::Vit, &args, 2).unwrap();
        assert_eq!(w.model().num_classes(), 2);
        assert_eq!(w.architecture().num_classes(), 2);
        assert_eq!(w.preprocessor().crop_size(), 16);
    }

    #[test]
    fn test_pretrained_kind_mismatch() {
        let dir = TempDir::new().unwrap();
        wrapper(2).save_pretrained(dir.path()).unwrap();
        let args = ModelArgs {
            pretrained: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let result = build(ModelKind::MobileNetV3, &args, 2);
        assert!(matches!(result, Err(Error::Model(_))));
    }

    #[test]
    fn test_train_one_epoch_end_to_end() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_image_folder(data.path(), "train", &[("cbb", 4), ("healthy", 2)]);
        write_image_folder(data.path(), "validation", &[("cbb", 1), ("healthy", 1)]);
        let splits = load_splits(data.path(), "default", 3).unwrap();

        let mut w = ModelWrapper::<TestBackend>::new(
            ModelKind::Vit,
            &tiny_vit_args(),
            splits.labels.clone(),
            Default::default(),
            LogContext::default(),
        )
        .unwrap()
        .with_tracking(TrackingConfig {
            project: "test".into(),
            run_name: "run".into(),
            enabled: true,
        });

        let options = TrainingOptions {
            num_train_epochs: 1,
            per_device_train_batch_size: 4,
            per_device_eval_batch_size: 2,
            eval_strategy: IntervalStrategy::Epoch,
            save_strategy: IntervalStrategy::Epoch,
            ..Default::default()
        };
        w.train(&splits.train, &splits.validation, out.path(), &options).unwrap();

        let expected = [
            CONFIG_FILE,
            WEIGHTS_FILE,
            PREPROCESSOR_FILE,
            LABELS_FILE,
            TRAINER_STATE_FILE,
        ];
        for file in expected {
            assert!(out.path().join(file).exists(), "{} missing", file);
        }
        assert!(out.path().join("checkpoint-2").is_dir());
        assert!(out.path().join("tracking/test/run/summary.json").exists());

        let ctx = LogContext::default();
        let reloaded =
            ModelWrapper::<TestBackend>::from_dir(out.path(), Default::default(), ctx).unwrap();
        assert_eq!(reloaded.labels(), &splits.labels);
        let metrics = reloaded.evaluate(&splits.validation, 2).unwrap();
        assert_eq!(metrics.total_samples, 2);
        assert_eq!(metrics.per_class[0].class_name.as_deref(), Some("cbb"));
    }

    #[test]
    fn test_train_rejects_missing_class() {
        let data = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_image_folder(data.path(), "train", &[("a", 2), ("b", 2)]);
        write_image_folder(data.path(), "validation", &[("a", 1)]);
        let splits = load_splits(data.path(), "default", 3).unwrap();

        // a third label the training partition never shows
        let mut w = build(ModelKind::Vit, &tiny_vit_args(), 3).unwrap();
        let options = TrainingOptions::default();
        let result = w.train(&splits.train, &splits.validation, out.path(), &options);
        assert!(matches!(result, Err(Error::Training(_))));
    }
}
