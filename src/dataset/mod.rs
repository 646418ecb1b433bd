//! Dataset handling
//!
//! - Image-folder discovery with train/validation partitions
//! - Label id <-> class name mapping derived from the training partition
//! - Train/eval transform pipelines (random resized crop, flip, resize, center crop)
//! - Burn `Dataset`/`Batcher` glue that applies the transforms lazily

pub mod burn_dataset;
pub mod labels;
pub mod loader;
pub mod transform;

pub use burn_dataset::{ImageBatch, ImageBatcher, ImageItem, TransformedImageDataset};
pub use labels::LabelMapping;
pub use loader::{
    dataset_root, load_split, load_splits, DatasetSplits, ImageFolder, ImageSample, Split,
};
pub use transform::{PreprocessorConfig, TransformPipeline, TransformStep};
