//! Image-folder dataset discovery
//!
//! Expected layout:
//!
//! ```text
//! <dataset>/[<subset>/]
//! ├── train/
//! │   ├── <class_a>/img001.jpg
//! │   └── <class_b>/...
//! └── validation/        (or valid/, val/)
//!     └── <class_a>/...
//! ```
//!
//! A subset named `default` means no subset directory. Only the file list is
//! read here; pixels are decoded lazily when a batch is assembled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::dataset::labels::LabelMapping;
use crate::utils::error::{Error, Result};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];
const TRAIN_DIRS: [&str; 1] = ["train"];
const VALIDATION_DIRS: [&str; 3] = ["validation", "valid", "val"];

/// Which partition to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    fn dir_names(&self) -> &'static [&'static str] {
        match self {
            Split::Train => &TRAIN_DIRS,
            Split::Validation => &VALIDATION_DIRS,
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "validation"),
        }
    }
}

impl std::str::FromStr for Split {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "validation" | "valid" | "val" => Ok(Split::Validation),
            other => Err(Error::Config(format!("unknown split '{}'", other))),
        }
    }
}

/// A single image with its label id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: usize,
}

/// One partition of an image-folder dataset
#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub root: PathBuf,
    pub samples: Vec<ImageSample>,
}

impl ImageFolder {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Label of every sample, in sample order
    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label).collect()
    }

    /// Shuffle the samples in place with a given seed
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.samples.shuffle(&mut rng);
    }

    /// Per-class sample counts for `num_classes` classes
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0usize; num_classes];
        for sample in &self.samples {
            if let Some(count) = counts.get_mut(sample.label) {
                *count += 1;
            }
        }
        counts
    }

    /// Read every image header in parallel; any unreadable file is an error
    pub fn verify(&self) -> Result<()> {
        let failures: Vec<(PathBuf, String)> = self
            .samples
            .par_iter()
            .filter_map(|s| {
                image::image_dimensions(&s.path)
                    .err()
                    .map(|e| (s.path.clone(), e.to_string()))
            })
            .collect();

        match failures.into_iter().next() {
            Some((path, reason)) => Err(Error::Image(path, reason)),
            None => Ok(()),
        }
    }
}

/// Train/validation partitions plus the label mapping derived from train
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageFolder,
    pub validation: ImageFolder,
    pub labels: LabelMapping,
}

/// Resolve `<dataset>/<subset>`, where `default` means the dataset root
pub fn dataset_root(dataset: &Path, subset: &str) -> PathBuf {
    if subset.is_empty() || subset == "default" {
        dataset.to_path_buf()
    } else {
        dataset.join(subset)
    }
}

/// Load both partitions, derive labels from train, and shuffle train with `seed`
pub fn load_splits(dataset: &Path, subset: &str, seed: u64) -> Result<DatasetSplits> {
    let root = dataset_root(dataset, subset);
    info!("Loading dataset from {:?}", root);

    let train_dir = find_split_dir(&root, Split::Train)?;
    let train_classes = discover_classes(&train_dir)?;

    let labels = LabelMapping::from_class_names(
        train_classes
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(name, _)| name.clone()),
    )?;

    let mut train = build_folder(train_dir, train_classes, &labels, Split::Train)?;
    train.shuffle(seed);

    let validation = load_split(dataset, subset, Split::Validation, &labels)?;

    train.verify()?;
    validation.verify()?;

    info!(
        "Loaded {} train / {} validation samples across {} classes",
        train.len(),
        validation.len(),
        labels.len()
    );

    Ok(DatasetSplits {
        train,
        validation,
        labels,
    })
}

/// Load one partition against an existing label mapping
pub fn load_split(
    dataset: &Path,
    subset: &str,
    split: Split,
    labels: &LabelMapping,
) -> Result<ImageFolder> {
    let root = dataset_root(dataset, subset);
    let dir = find_split_dir(&root, split)?;
    let classes = discover_classes(&dir)?;
    build_folder(dir, classes, labels, split)
}

fn find_split_dir(root: &Path, split: Split) -> Result<PathBuf> {
    if !root.is_dir() {
        return Err(Error::PathNotFound(root.to_path_buf()));
    }
    split
        .dir_names()
        .iter()
        .map(|name| root.join(name))
        .find(|dir| dir.is_dir())
        .ok_or_else(|| {
            Error::Dataset(format!(
                "no {} split under {:?} (looked for {:?})",
                split,
                root,
                split.dir_names()
            ))
        })
}

/// Class directory name -> image files, sorted for reproducibility
fn discover_classes(split_dir: &Path) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let mut classes = BTreeMap::new();

    for entry in std::fs::read_dir(split_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };

        let mut files: Vec<PathBuf> = WalkDir::new(entry.path())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| p.is_file() && is_image_file(p))
            .collect();
        files.sort();

        debug!("Class '{}': {} images", name, files.len());
        classes.insert(name, files);
    }

    Ok(classes)
}

fn build_folder(
    root: PathBuf,
    classes: BTreeMap<String, Vec<PathBuf>>,
    labels: &LabelMapping,
    split: Split,
) -> Result<ImageFolder> {
    let mut samples = Vec::new();
    for (name, files) in classes {
        if files.is_empty() {
            continue;
        }
        let label = labels.id(&name).ok_or_else(|| {
            Error::Dataset(format!(
                "class '{}' in the {} split does not occur in the training split",
                name, split
            ))
        })?;
        samples.extend(files.into_iter().map(|path| ImageSample { path, label }));
    }

    if samples.is_empty() {
        return Err(Error::Dataset(format!("{} split under {:?} has no images", split, root)));
    }

    Ok(ImageFolder { root, samples })
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}
