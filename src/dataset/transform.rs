//! Image preprocessing and transform pipelines
//!
//! A [`TransformPipeline`] is an ordered list of geometric steps followed by
//! the tensor conversion: RGB, CHW, scaled to `[0, 1]`, then normalized with
//! the preprocessor's per-channel mean and std.
//!
//! Training pipeline: random resized crop, horizontal flip, normalize.
//! Evaluation pipeline: resize shorter side, center crop, normalize.

use std::fs;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Error, Result};

/// ImageNet channel statistics
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Target spatial size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

impl ImageSize {
    pub fn square(size: u32) -> Self {
        Self {
            height: size,
            width: size,
        }
    }
}

/// How raw images become model input. Persisted as `preprocessor_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub size: ImageSize,
}

impl PreprocessorConfig {
    pub fn new(image_mean: [f32; 3], image_std: [f32; 3], size: u32) -> Self {
        Self {
            image_mean,
            image_std,
            size: ImageSize::square(size),
        }
    }

    /// Mean/std of 0.5 on every channel (maps `[0, 1]` to `[-1, 1]`)
    pub fn half(size: u32) -> Self {
        Self::new([0.5; 3], [0.5; 3], size)
    }

    pub fn imagenet(size: u32) -> Self {
        Self::new(IMAGENET_MEAN, IMAGENET_STD, size)
    }

    /// Crop edge used by both pipelines (the configured height)
    pub fn crop_size(&self) -> u32 {
        self.size.height
    }

    pub fn validate(&self) -> Result<()> {
        if self.size.height == 0 || self.size.width == 0 {
            return Err(Error::Config("preprocessor size must be non-zero".into()));
        }
        if self.image_std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(Error::Config(format!(
                "preprocessor std must be positive, got {:?}",
                self.image_std
            )));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

/// One geometric step of a pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum TransformStep {
    /// Crop a random area fraction in `scale` with aspect ratio in `ratio`,
    /// then resize to `size x size`
    RandomResizedCrop {
        size: u32,
        scale: (f64, f64),
        ratio: (f64, f64),
    },
    RandomHorizontalFlip { p: f64 },
    /// Resize so the shorter side equals `size`, keeping aspect ratio
    Resize { size: u32 },
    /// Crop the central `size x size` region, zero-padding small images
    CenterCrop { size: u32 },
}

impl TransformStep {
    pub fn random_resized_crop(size: u32) -> Self {
        Self::RandomResizedCrop {
            size,
            scale: (0.08, 1.0),
            ratio: (3.0 / 4.0, 4.0 / 3.0),
        }
    }

    fn apply<R: Rng>(&self, img: DynamicImage, rng: &mut R) -> DynamicImage {
        match self {
            TransformStep::RandomResizedCrop { size, scale, ratio } => {
                let (x, y, w, h) = random_crop_box(img.width(), img.height(), *scale, *ratio, rng);
                img.crop_imm(x, y, w, h)
                    .resize_exact(*size, *size, FilterType::Triangle)
            }
            TransformStep::RandomHorizontalFlip { p } => {
                if rng.gen::<f64>() < *p {
                    img.fliph()
                } else {
                    img
                }
            }
            TransformStep::Resize { size } => resize_shorter_side(img, *size),
            TransformStep::CenterCrop { size } => center_crop(img, *size),
        }
    }

    fn is_random(&self) -> bool {
        matches!(
            self,
            TransformStep::RandomResizedCrop { .. } | TransformStep::RandomHorizontalFlip { .. }
        )
    }
}

/// Geometric steps plus normalization
#[derive(Debug, Clone, PartialEq)]
pub struct TransformPipeline {
    steps: Vec<TransformStep>,
    mean: [f32; 3],
    std: [f32; 3],
    output_size: u32,
}

impl TransformPipeline {
    /// Random resized crop, horizontal flip, to-tensor, normalize
    pub fn train(preprocessor: &PreprocessorConfig) -> Self {
        let size = preprocessor.crop_size();
        Self {
            steps: vec![
                TransformStep::random_resized_crop(size),
                TransformStep::RandomHorizontalFlip { p: 0.5 },
            ],
            mean: preprocessor.image_mean,
            std: preprocessor.image_std,
            output_size: size,
        }
    }

    /// Resize, center crop, to-tensor, normalize
    pub fn eval(preprocessor: &PreprocessorConfig) -> Self {
        let size = preprocessor.crop_size();
        Self {
            steps: vec![TransformStep::Resize { size }, TransformStep::CenterCrop { size }],
            mean: preprocessor.image_mean,
            std: preprocessor.image_std,
            output_size: size,
        }
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    /// Side length of the square output
    pub fn output_size(&self) -> u32 {
        self.output_size
    }

    /// Whether the pipeline draws from the RNG
    pub fn is_random(&self) -> bool {
        self.steps.iter().any(TransformStep::is_random)
    }

    /// Run every step and return normalized CHW data of length `3 * size * size`
    pub fn apply<R: Rng>(&self, img: DynamicImage, rng: &mut R) -> Vec<f32> {
        let mut img = img;
        for step in &self.steps {
            img = step.apply(img, rng);
        }
        if img.width() != self.output_size || img.height() != self.output_size {
            img = img.resize_exact(self.output_size, self.output_size, FilterType::Triangle);
        }
        self.to_normalized_chw(&img)
    }

    fn to_normalized_chw(&self, img: &DynamicImage) -> Vec<f32> {
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; 3 * plane];

        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                data[c * plane + i] = (value - self.mean[c]) / self.std[c];
            }
        }
        data
    }
}

/// Pick a crop box `(x, y, w, h)` the way torchvision's RandomResizedCrop does:
/// ten rejection-sampling attempts, then a ratio-clamped center crop.
fn random_crop_box<R: Rng>(
    width: u32,
    height: u32,
    scale: (f64, f64),
    ratio: (f64, f64),
    rng: &mut R,
) -> (u32, u32, u32, u32) {
    let area = (width as f64) * (height as f64);
    let (log_lo, log_hi) = (ratio.0.ln(), ratio.1.ln());

    for _ in 0..10 {
        let target_area = area * rng.gen_range(scale.0..=scale.1);
        let aspect = rng.gen_range(log_lo..=log_hi).exp();

        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;

        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.gen_range(0..=width - w);
            let y = rng.gen_range(0..=height - h);
            return (x, y, w, h);
        }
    }

    let in_ratio = width as f64 / height as f64;
    let (w, h) = if in_ratio < ratio.0 {
        (width, ((width as f64 / ratio.0).round() as u32).clamp(1, height))
    } else if in_ratio > ratio.1 {
        (((height as f64 * ratio.1).round() as u32).clamp(1, width), height)
    } else {
        (width, height)
    };
    ((width - w) / 2, (height - h) / 2, w, h)
}

fn resize_shorter_side(img: DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img;
    }
    let (new_w, new_h) = if width <= height {
        (size, ((size as u64 * height as u64) / width as u64).max(1) as u32)
    } else {
        (((size as u64 * width as u64) / height as u64).max(1) as u32, size)
    };
    if (new_w, new_h) == (width, height) {
        return img;
    }
    img.resize_exact(new_w, new_h, FilterType::Triangle)
}

fn center_crop(img: DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width < size || height < size {
        let mut canvas = RgbImage::new(size.max(width), size.max(height));
        let offset_x = (canvas.width() - width) / 2;
        let offset_y = (canvas.height() - height) / 2;
        image::imageops::overlay(&mut canvas, &img.to_rgb8(), offset_x as i64, offset_y as i64);
        return center_crop(DynamicImage::ImageRgb8(canvas), size);
    }
    let x = ((width - size) as f64 / 2.0).round() as u32;
    let y = ((height - size) as f64 / 2.0).round() as u32;
    img.crop_imm(x, y, size, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::TempDir;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn uniform_image(width: u32, height: u32, value: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(value)))
    }

    #[test]
    fn test_train_pipeline_output_shape() {
        let pipeline = TransformPipeline::train(&PreprocessorConfig::imagenet(32));
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for (w, h) in [(64, 48), (20, 90), (32, 32)] {
            let data = pipeline.apply(create_test_image(w, h), &mut rng);
            assert_eq!(data.len(), 3 * 32 * 32);
        }
        assert!(pipeline.is_random());
    }

    #[test]
    fn test_eval_pipeline_output_shape() {
        let pipeline = TransformPipeline::eval(&PreprocessorConfig::half(24));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let data = pipeline.apply(create_test_image(100, 40), &mut rng);
        assert_eq!(data.len(), 3 * 24 * 24);
        assert!(!pipeline.is_random());
    }

    #[test]
    fn test_eval_pipeline_is_deterministic() {
        let pipeline = TransformPipeline::eval(&PreprocessorConfig::imagenet(16));
        let a = pipeline.apply(create_test_image(50, 30), &mut ChaCha8Rng::seed_from_u64(1));
        let b = pipeline.apply(create_test_image(50, 30), &mut ChaCha8Rng::seed_from_u64(2));
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalization_of_uniform_image() {
        let pipeline = TransformPipeline::eval(&PreprocessorConfig::half(8));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let data = pipeline.apply(uniform_image(8, 8, [255, 0, 128]), &mut rng);

        let plane = 64;
        assert!(data[..plane].iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(data[plane..2 * plane].iter().all(|v| (v + 1.0).abs() < 1e-6));
        let expected_blue = (128.0 / 255.0 - 0.5) / 0.5;
        assert!(data[2 * plane..].iter().all(|v| (v - expected_blue).abs() < 1e-6));
    }

    #[test]
    fn test_resize_shorter_side() {
        let resized = resize_shorter_side(create_test_image(200, 100), 50);
        assert_eq!(resized.dimensions(), (100, 50));

        let resized = resize_shorter_side(create_test_image(30, 90), 10);
        assert_eq!(resized.dimensions(), (10, 30));
    }

    #[test]
    fn test_center_crop_takes_middle() {
        let img = create_test_image(10, 10);
        let cropped = center_crop(img, 4);
        assert_eq!(cropped.dimensions(), (4, 4));
        // top-left of the crop is pixel (3, 3) of the source
        assert_eq!(cropped.to_rgb8().get_pixel(0, 0), &Rgb([3, 3, 6]));
    }

    #[test]
    fn test_center_crop_pads_small_images() {
        let cropped = center_crop(uniform_image(2, 2, [9, 9, 9]), 4);
        assert_eq!(cropped.dimensions(), (4, 4));
        assert_eq!(cropped.to_rgb8().get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(cropped.to_rgb8().get_pixel(1, 1), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_random_crop_box_within_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..200 {
            let (x, y, w, h) = random_crop_box(120, 80, (0.08, 1.0), (0.75, 4.0 / 3.0), &mut rng);
            assert!(w > 0 && h > 0);
            assert!(x + w <= 120);
            assert!(y + h <= 80);
        }
    }

    #[test]
    fn test_random_crop_box_fallback_clamps_ratio() {
        // scale above 1.0 can never fit, forcing the fallback
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let (x, y, w, h) = random_crop_box(400, 100, (2.0, 3.0), (0.75, 4.0 / 3.0), &mut rng);
        assert_eq!(h, 100);
        assert_eq!(w, 133);
        assert_eq!((x, y), ((400 - 133) / 2, 0));
    }

    #[test]
    fn test_flip_probability_extremes() {
        let img = create_test_image(4, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let always = TransformStep::RandomHorizontalFlip { p: 1.0 }.apply(img.clone(), &mut rng);
        assert_eq!(always.to_rgb8().get_pixel(0, 0)[0], 3);

        let never = TransformStep::RandomHorizontalFlip { p: 0.0 }.apply(img, &mut rng);
        assert_eq!(never.to_rgb8().get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_preprocessor_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preprocessor_config.json");
        let config = PreprocessorConfig::imagenet(224);

        config.save(&path).unwrap();
        assert_eq!(PreprocessorConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_preprocessor_validation() {
        let mut config = PreprocessorConfig::half(224);
        config.image_std[1] = 0.0;
        assert!(config.validate().is_err());
        assert!(PreprocessorConfig::half(0).validate().is_err());
    }
}
