//! Model Configuration Module
//!
//! [`ModelArgs`] is the user-facing, strongly typed set of model options
//! (`--model_args` JSON or the `[model]` table of the config file). It is
//! turned into one of the per-architecture Burn configs by
//! [`ModelArgs::architecture`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::transform::PreprocessorConfig;
use crate::model::convnext::ConvNextV2Config;
use crate::model::mobilenet::{MobileNetV3Config, MobileNetVariant};
use crate::model::vit::VitConfig;
use crate::utils::error::{Error, Result};

/// Default input resolution for every architecture
pub const DEFAULT_IMAGE_SIZE: u32 = 224;

/// The closed set of supported architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Vit,
    ConvNextV2,
    MobileNetV3,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Vit, ModelKind::ConvNextV2, ModelKind::MobileNetV3];

    /// Display name, also used as the output directory prefix
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelKind::Vit => "ViT",
            ModelKind::ConvNextV2 => "ConvNeXtV2",
            ModelKind::MobileNetV3 => "MobileNetV3",
        }
    }

    /// Registry key the kind is registered under by default
    pub fn default_key(&self) -> &'static str {
        match self {
            ModelKind::Vit => "vit",
            ModelKind::ConvNextV2 => "convnextv2",
            ModelKind::MobileNetV3 => "mobilenetv3",
        }
    }

    /// Normalization statistics used when no pretrained preprocessor exists
    pub fn default_preprocessor(&self, size: u32) -> PreprocessorConfig {
        match self {
            ModelKind::Vit => PreprocessorConfig::half(size),
            ModelKind::ConvNextV2 | ModelKind::MobileNetV3 => PreprocessorConfig::imagenet(size),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Model options. Every field is optional; unset fields fall back to the
/// registry entry's defaults, then to the architecture defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelArgs {
    /// Directory holding `config.json`, `model.mpk` and optionally
    /// `preprocessor_config.json`
    pub pretrained: Option<PathBuf>,
    pub image_size: Option<u32>,
    pub image_mean: Option<[f32; 3]>,
    pub image_std: Option<[f32; 3]>,
    pub dropout: Option<f64>,

    // ViT
    pub patch_size: Option<usize>,
    pub hidden_size: Option<usize>,
    pub num_hidden_layers: Option<usize>,
    pub num_attention_heads: Option<usize>,
    pub intermediate_size: Option<usize>,

    // ConvNeXtV2
    pub depths: Option<Vec<usize>>,
    pub hidden_sizes: Option<Vec<usize>>,

    // MobileNetV3
    pub variant: Option<MobileNetVariant>,
}

impl ModelArgs {
    /// Overlay `self` on top of `base`: fields set here win
    pub fn merged_over(&self, base: &ModelArgs) -> ModelArgs {
        ModelArgs {
            pretrained: self.pretrained.clone().or_else(|| base.pretrained.clone()),
            image_size: self.image_size.or(base.image_size),
            image_mean: self.image_mean.or(base.image_mean),
            image_std: self.image_std.or(base.image_std),
            dropout: self.dropout.or(base.dropout),
            patch_size: self.patch_size.or(base.patch_size),
            hidden_size: self.hidden_size.or(base.hidden_size),
            num_hidden_layers: self.num_hidden_layers.or(base.num_hidden_layers),
            num_attention_heads: self.num_attention_heads.or(base.num_attention_heads),
            intermediate_size: self.intermediate_size.or(base.intermediate_size),
            depths: self.depths.clone().or_else(|| base.depths.clone()),
            hidden_sizes: self.hidden_sizes.clone().or_else(|| base.hidden_sizes.clone()),
            variant: self.variant.or(base.variant),
        }
    }

    fn architecture_fields(&self) -> Vec<(&'static str, ModelKind, bool)> {
        vec![
            ("patch_size", ModelKind::Vit, self.patch_size.is_some()),
            ("hidden_size", ModelKind::Vit, self.hidden_size.is_some()),
            ("num_hidden_layers", ModelKind::Vit, self.num_hidden_layers.is_some()),
            ("num_attention_heads", ModelKind::Vit, self.num_attention_heads.is_some()),
            ("intermediate_size", ModelKind::Vit, self.intermediate_size.is_some()),
            ("depths", ModelKind::ConvNextV2, self.depths.is_some()),
            ("hidden_sizes", ModelKind::ConvNextV2, self.hidden_sizes.is_some()),
            ("variant", ModelKind::MobileNetV3, self.variant.is_some()),
        ]
    }

    /// Check that the options make sense for `kind`
    pub fn validate_for(&self, kind: ModelKind) -> Result<()> {
        for (field, owner, set) in self.architecture_fields() {
            if set && owner != kind {
                return Err(Error::Config(format!(
                    "model argument '{}' applies to {}, not {}",
                    field, owner, kind
                )));
            }
            if set && self.pretrained.is_some() {
                return Err(Error::Config(format!(
                    "model argument '{}' cannot override the architecture of a \
                     pretrained checkpoint",
                    field
                )));
            }
        }

        if let Some(dropout) = self.dropout {
            if kind == ModelKind::ConvNextV2 {
                return Err(Error::Config(format!("{} has no dropout; remove 'dropout'", kind)));
            }
            if !(0.0..1.0).contains(&dropout) {
                return Err(Error::Config(format!("dropout must be in [0, 1), got {}", dropout)));
            }
        }
        if self.image_size == Some(0) {
            return Err(Error::Config("image_size must be positive".into()));
        }
        if let Some(std) = self.image_std {
            if std.iter().any(|s| *s <= 0.0) {
                return Err(Error::Config(format!("image_std must be positive, got {:?}", std)));
            }
        }
        Ok(())
    }

    /// Build the architecture config for a freshly initialized model
    pub fn architecture(&self, kind: ModelKind, num_classes: usize) -> Result<ArchitectureConfig> {
        self.validate_for(kind)?;
        let image_size = self.image_size.unwrap_or(DEFAULT_IMAGE_SIZE) as usize;

        let config = match kind {
            ModelKind::Vit => {
                let mut config = VitConfig::new(num_classes).with_image_size(image_size);
                if let Some(v) = self.patch_size {
                    config = config.with_patch_size(v);
                }
                if let Some(v) = self.hidden_size {
                    config = config.with_hidden_size(v);
                }
                if let Some(v) = self.num_hidden_layers {
                    config = config.with_num_hidden_layers(v);
                }
                if let Some(v) = self.num_attention_heads {
                    config = config.with_num_attention_heads(v);
                }
                if let Some(v) = self.intermediate_size {
                    config = config.with_intermediate_size(v);
                }
                if let Some(v) = self.dropout {
                    config = config.with_dropout(v);
                }
                ArchitectureConfig::Vit(config)
            }
            ModelKind::ConvNextV2 => {
                let mut config = ConvNextV2Config::new(num_classes);
                if let Some(v) = &self.depths {
                    config = config.with_depths(v.clone());
                }
                if let Some(v) = &self.hidden_sizes {
                    config = config.with_hidden_sizes(v.clone());
                }
                ArchitectureConfig::ConvNextV2(config)
            }
            ModelKind::MobileNetV3 => {
                let mut config = MobileNetV3Config::new(num_classes);
                if let Some(v) = self.variant {
                    config = config.with_variant(v);
                }
                if let Some(v) = self.dropout {
                    config = config.with_dropout(v);
                }
                ArchitectureConfig::MobileNetV3(config)
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Preprocessor for a fresh model: architecture defaults plus overrides
    pub fn preprocessor(&self, kind: ModelKind) -> PreprocessorConfig {
        let base = kind.default_preprocessor(self.image_size.unwrap_or(DEFAULT_IMAGE_SIZE));
        self.apply_preprocessor_overrides(base)
    }

    /// Apply mean/std/size overrides onto an existing preprocessor
    pub fn apply_preprocessor_overrides(
        &self,
        mut preprocessor: PreprocessorConfig,
    ) -> PreprocessorConfig {
        if let Some(mean) = self.image_mean {
            preprocessor.image_mean = mean;
        }
        if let Some(std) = self.image_std {
            preprocessor.image_std = std;
        }
        if let Some(size) = self.image_size {
            preprocessor.size = crate::dataset::transform::ImageSize::square(size);
        }
        preprocessor
    }
}

/// Serialized architecture description (`config.json` in a model directory)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "architecture", rename_all = "lowercase")]
pub enum ArchitectureConfig {
    Vit(VitConfig),
    ConvNextV2(ConvNextV2Config),
    MobileNetV3(MobileNetV3Config),
}

impl ArchitectureConfig {
    pub fn kind(&self) -> ModelKind {
        match self {
            ArchitectureConfig::Vit(_) => ModelKind::Vit,
            ArchitectureConfig::ConvNextV2(_) => ModelKind::ConvNextV2,
            ArchitectureConfig::MobileNetV3(_) => ModelKind::MobileNetV3,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            ArchitectureConfig::Vit(c) => c.num_classes,
            ArchitectureConfig::ConvNextV2(c) => c.num_classes,
            ArchitectureConfig::MobileNetV3(c) => c.num_classes,
        }
    }

    /// Same architecture with a different classifier width
    pub fn with_num_classes(&self, num_classes: usize) -> Self {
        match self {
            ArchitectureConfig::Vit(c) => {
                let mut c = c.clone();
                c.num_classes = num_classes;
                ArchitectureConfig::Vit(c)
            }
            ArchitectureConfig::ConvNextV2(c) => {
                let mut c = c.clone();
                c.num_classes = num_classes;
                ArchitectureConfig::ConvNextV2(c)
            }
            ArchitectureConfig::MobileNetV3(c) => {
                let mut c = c.clone();
                c.num_classes = num_classes;
                ArchitectureConfig::MobileNetV3(c)
            }
        }
    }

    /// Fixed input resolution, if the architecture has one
    pub fn fixed_image_size(&self) -> Option<usize> {
        match self {
            ArchitectureConfig::Vit(c) => Some(c.image_size),
            _ => None,
        }
    }

    /// Check that `crop`-pixel inputs fit the architecture
    pub fn check_input_size(&self, crop: u32) -> Result<()> {
        let crop = crop as usize;
        match self {
            ArchitectureConfig::Vit(c) if crop != c.image_size => {
                Err(Error::Config(format!(
                    "{} expects {}x{} inputs but the preprocessor crops to {}",
                    self.kind(),
                    c.image_size,
                    c.image_size,
                    crop
                )))
            }
            ArchitectureConfig::ConvNextV2(c) if crop < c.min_input_size() => {
                Err(Error::Config(format!(
                    "{} with {} stages needs inputs of at least {}x{}, got {}",
                    self.kind(),
                    c.depths.len(),
                    c.min_input_size(),
                    c.min_input_size(),
                    crop
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes() == 0 {
            return Err(Error::Config("num_classes must be greater than 0".into()));
        }
        match self {
            ArchitectureConfig::Vit(c) => c.validate(),
            ArchitectureConfig::ConvNextV2(c) => c.validate(),
            ArchitectureConfig::MobileNetV3(c) => c.validate(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Model(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Model(format!("invalid model config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kind_names() {
        assert_eq!(ModelKind::Vit.display_name(), "ViT");
        assert_eq!(ModelKind::ConvNextV2.display_name(), "ConvNeXtV2");
        assert_eq!(ModelKind::MobileNetV3.to_string(), "MobileNetV3");
        assert_eq!(ModelKind::Vit.default_key(), "vit");
    }

    #[test]
    fn test_args_reject_unknown_fields() {
        let parsed: std::result::Result<ModelArgs, _> =
            serde_json::from_str(r#"{"hiden_size": 8}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_args_reject_foreign_architecture_field() {
        let args = ModelArgs {
            depths: Some(vec![1, 1, 1, 1]),
            ..Default::default()
        };
        assert!(args.validate_for(ModelKind::ConvNextV2).is_ok());
        assert!(args.validate_for(ModelKind::Vit).is_err());
    }

    #[test]
    fn test_args_reject_architecture_override_with_pretrained() {
        let args = ModelArgs {
            pretrained: Some(PathBuf::from("weights/vit")),
            hidden_size: Some(64),
            ..Default::default()
        };
        assert!(args.validate_for(ModelKind::Vit).is_err());
    }

    #[test]
    fn test_merge_prefers_overrides() {
        let base = ModelArgs {
            hidden_size: Some(192),
            num_hidden_layers: Some(12),
            ..Default::default()
        };
        let user = ModelArgs {
            num_hidden_layers: Some(2),
            ..Default::default()
        };
        let merged = user.merged_over(&base);
        assert_eq!(merged.hidden_size, Some(192));
        assert_eq!(merged.num_hidden_layers, Some(2));
    }

    #[test]
    fn test_vit_architecture_from_args() {
        let args = ModelArgs {
            image_size: Some(32),
            patch_size: Some(8),
            hidden_size: Some(16),
            num_hidden_layers: Some(1),
            num_attention_heads: Some(2),
            intermediate_size: Some(32),
            ..Default::default()
        };
        let arch = args.architecture(ModelKind::Vit, 5).unwrap();
        assert_eq!(arch.kind(), ModelKind::Vit);
        assert_eq!(arch.num_classes(), 5);
        assert_eq!(arch.fixed_image_size(), Some(32));
    }

    #[test]
    fn test_vit_defaults_match_base_model() {
        match ModelArgs::default().architecture(ModelKind::Vit, 5).unwrap() {
            ArchitectureConfig::Vit(c) => {
                assert_eq!(c.hidden_size, 768);
                assert_eq!(c.num_hidden_layers, 12);
                assert_eq!(c.num_attention_heads, 12);
                assert_eq!(c.intermediate_size, 3072);
                assert_eq!(c.patch_size, 16);
                assert_eq!(c.image_size, 224);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_preprocessor_defaults_per_kind() {
        let args = ModelArgs::default();
        assert_eq!(args.preprocessor(ModelKind::Vit).image_mean, [0.5; 3]);
        assert_eq!(
            args.preprocessor(ModelKind::MobileNetV3).image_std,
            crate::dataset::transform::IMAGENET_STD
        );
        assert_eq!(args.preprocessor(ModelKind::ConvNextV2).crop_size(), 224);

        let sized = ModelArgs {
            image_size: Some(64),
            ..Default::default()
        };
        assert_eq!(sized.preprocessor(ModelKind::Vit).crop_size(), 64);
    }

    #[test]
    fn test_architecture_config_roundtrip_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let arch = ModelArgs::default().architecture(ModelKind::MobileNetV3, 3).unwrap();

        arch.save(&path).unwrap();
        let loaded = ArchitectureConfig::load(&path).unwrap();

        assert_eq!(loaded.kind(), ModelKind::MobileNetV3);
        assert_eq!(loaded.num_classes(), 3);
        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"architecture\": \"mobilenetv3\""));
    }

    #[test]
    fn test_convnext_rejects_dropout() {
        let args = ModelArgs {
            dropout: Some(0.5),
            ..Default::default()
        };
        assert!(matches!(args.architecture(ModelKind::ConvNextV2, 2), Err(Error::Config(_))));
        assert!(args.architecture(ModelKind::MobileNetV3, 2).is_ok());
    }

    #[test]
    fn test_convnext_minimum_input_size() {
        let arch = ModelArgs::default().architecture(ModelKind::ConvNextV2, 2).unwrap();
        assert!(matches!(arch.check_input_size(16), Err(Error::Config(_))));
        assert!(arch.check_input_size(32).is_ok());

        let shallow = ModelArgs {
            depths: Some(vec![1, 1]),
            hidden_sizes: Some(vec![8, 16]),
            ..Default::default()
        }
        .architecture(ModelKind::ConvNextV2, 2)
        .unwrap();
        assert!(shallow.check_input_size(8).is_ok());
        assert!(shallow.check_input_size(4).is_err());
    }

    #[test]
    fn test_vit_input_size_must_match() {
        let arch = ModelArgs::default().architecture(ModelKind::Vit, 2).unwrap();
        assert!(arch.check_input_size(224).is_ok());
        assert!(matches!(arch.check_input_size(192), Err(Error::Config(_))));
    }

    #[test]
    fn test_with_num_classes() {
        let arch = ModelArgs::default().architecture(ModelKind::ConvNextV2, 10).unwrap();
        assert_eq!(arch.with_num_classes(4).num_classes(), 4);
    }
}
