//! Burn Dataset Integration
//!
//! [`TransformedImageDataset`] decodes an image and runs the attached
//! [`TransformPipeline`] each time an item is requested, so augmentation is
//! re-drawn every epoch. [`ImageBatcher`] stacks items into tensors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::ImageReader;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::warn;

use crate::dataset::loader::{ImageFolder, ImageSample};
use crate::dataset::transform::TransformPipeline;

/// A transformed image ready for batching
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Normalized CHW data `[3 * size * size]`
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// Image-folder partition with a transform applied on access
pub struct TransformedImageDataset {
    samples: Vec<ImageSample>,
    transform: TransformPipeline,
    seed: u64,
    draws: Arc<AtomicU64>,
}

impl TransformedImageDataset {
    pub fn new(folder: &ImageFolder, transform: TransformPipeline, seed: u64) -> Self {
        Self {
            samples: folder.samples.clone(),
            transform,
            seed,
            draws: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn transform(&self) -> &TransformPipeline {
        &self.transform
    }

    /// Per-access RNG: deterministic for a given seed and access order
    fn rng_for(&self, index: usize) -> ChaCha8Rng {
        let draw = self.draws.fetch_add(1, Ordering::Relaxed);
        let mixed = self
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(draw.rotate_left(32))
            .wrapping_add(index as u64);
        ChaCha8Rng::seed_from_u64(mixed)
    }
}

impl Dataset<ImageItem> for TransformedImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let sample = self.samples.get(index)?;
        let size = self.transform.output_size() as usize;

        // Headers were verified at load time; a failure here means the file
        // changed underneath us. Emit a black image rather than ending the epoch.
        let pixels = match ImageReader::open(&sample.path)
            .map_err(|e| e.to_string())
            .and_then(|r| r.decode().map_err(|e| e.to_string()))
        {
            Ok(img) => self.transform.apply(img, &mut self.rng_for(index)),
            Err(e) => {
                warn!("Failed to decode {:?}: {}", sample.path, e);
                vec![0.0; 3 * size * size]
            }
        };

        Some(ImageItem {
            pixels,
            label: sample.label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch of images with labels
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[batch_size, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
}

/// Stacks [`ImageItem`]s onto a fixed device
#[derive(Clone, Debug)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let mut pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size);
        for item in items {
            pixels.extend_from_slice(&item.pixels);
            targets.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(pixels, [batch_size, 3, size, size]),
            &self.device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [batch_size]), &self.device);

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::loader::tests::write_image_folder;
    use crate::dataset::loader::load_splits;
    use crate::dataset::transform::PreprocessorConfig;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn test_dataset_items_are_transformed() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), "train", &[("a", 2), ("b", 1)]);
        write_image_folder(dir.path(), "validation", &[("a", 1)]);
        let splits = load_splits(dir.path(), "default", 0).unwrap();

        let dataset = TransformedImageDataset::new(
            &splits.train,
            TransformPipeline::train(&PreprocessorConfig::imagenet(8)),
            0,
        );

        assert_eq!(dataset.len(), 3);
        let item = dataset.get(0).unwrap();
        assert_eq!(item.pixels.len(), 3 * 8 * 8);
        assert!(item.label < 2);
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn test_eval_items_are_stable() {
        let dir = TempDir::new().unwrap();
        write_image_folder(dir.path(), "train", &[("a", 1)]);
        write_image_folder(dir.path(), "validation", &[("a", 1)]);
        let splits = load_splits(dir.path(), "default", 0).unwrap();

        let dataset = TransformedImageDataset::new(
            &splits.validation,
            TransformPipeline::eval(&PreprocessorConfig::half(6)),
            0,
        );

        assert_eq!(dataset.get(0).unwrap().pixels, dataset.get(0).unwrap().pixels);
    }

    #[test]
    fn test_batcher_shapes() {
        let device = Default::default();
        let batcher = ImageBatcher::<TestBackend>::new(device, 4);
        let items = vec![
            ImageItem {
                pixels: vec![0.5; 48],
                label: 1,
            },
            ImageItem {
                pixels: vec![-0.5; 48],
                label: 0,
            },
        ];

        let batch = batcher.batch(items, &Default::default());

        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(batch.targets.dims(), [2]);
        let targets: Vec<i64> = batch.targets.into_data().to_vec().unwrap();
        assert_eq!(targets, vec![1, 0]);
    }
}
