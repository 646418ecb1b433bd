//! Model registry
//!
//! Maps a lowercase model name (`--model`) to the architecture it builds and
//! the default [`ModelArgs`] for that name. The set of architectures is closed
//! ([`ModelKind`]); [`ModelRegistry::register`] adds further names for them,
//! e.g. a small ViT preset.

use std::collections::BTreeMap;

use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

use crate::backend::{auto_device, TrainingBackend};
use crate::dataset::labels::LabelMapping;
use crate::model::config::{ModelArgs, ModelKind};
use crate::model::wrapper::ModelWrapper;
use crate::utils::error::{Error, Result};
use crate::utils::logging::LogContext;

/// One registry entry
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub key: String,
    pub kind: ModelKind,
    pub defaults: ModelArgs,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    /// `vit`, `convnextv2` and `mobilenetv3` with architecture defaults
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in ModelKind::ALL {
            registry.register(kind.default_key(), kind, ModelArgs::default());
        }
        registry
    }
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register `key` (case-insensitive), replacing any previous entry
    pub fn register(&mut self, key: &str, kind: ModelKind, defaults: ModelArgs) -> &mut Self {
        let key = key.to_lowercase();
        debug!("Registering model '{}' -> {}", key, kind);
        self.entries.insert(
            key.clone(),
            ModelSpec {
                key,
                kind,
                defaults,
            },
        );
        self
    }

    pub fn lookup(&self, name: &str) -> Result<&ModelSpec> {
        self.entries
            .get(&name.to_lowercase())
            .ok_or_else(|| Error::UnknownModel {
                name: name.to_string(),
                available: self.keys().join(", "),
            })
    }

    /// Registered names in sorted order
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn specs(&self) -> impl Iterator<Item = &ModelSpec> {
        self.entries.values()
    }

    /// Build the wrapper for `name` on `device`, with `args` layered over the
    /// entry's defaults
    pub fn load_model<B: AutodiffBackend>(
        &self,
        name: &str,
        args: &ModelArgs,
        labels: &LabelMapping,
        device: B::Device,
        ctx: &LogContext,
    ) -> Result<ModelWrapper<B>> {
        let spec = self.lookup(name)?;
        let args = args.merged_over(&spec.defaults);
        info!("Loading model '{}' ({})", spec.key, spec.kind);
        ModelWrapper::new(spec.kind, &args, labels.clone(), device, ctx.child(&spec.key))
    }
}

/// Build `name` from the default registry on the automatically selected device
pub fn load_model(
    name: &str,
    args: &ModelArgs,
    labels: &LabelMapping,
    ctx: &LogContext,
) -> Result<ModelWrapper<TrainingBackend>> {
    ModelRegistry::default().load_model::<TrainingBackend>(name, args, labels, auto_device(), ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

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

    fn labels() -> LabelMapping {
        LabelMapping::from_class_names(["cbb", "cbsd", "cgm", "cmd", "healthy"]).unwrap()
    }

    fn load(
        registry: &ModelRegistry,
        name: &str,
        args: &ModelArgs,
    ) -> Result<ModelWrapper<TestBackend>> {
        registry.load_model(name, args, &labels(), Default::default(), &LogContext::default())
    }

    #[test]
    fn test_default_keys() {
        assert_eq!(ModelRegistry::default().keys(), vec!["convnextv2", "mobilenetv3", "vit"]);
    }

    #[test]
    fn test_vit_wrapper_name() {
        let registry = ModelRegistry::default();
        let wrapper = load(&registry, "vit", &tiny_vit_args()).unwrap();
        assert_eq!(wrapper.name(), "ViT");
        assert_eq!(wrapper.model().num_classes(), 5);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = ModelRegistry::default();
        assert_eq!(registry.lookup("ViT").unwrap().kind, ModelKind::Vit);
    }

    #[test]
    fn test_unknown_model() {
        let registry = ModelRegistry::default();
        let err = load(&registry, "resnet", &ModelArgs::default()).unwrap_err();
        match err {
            Error::UnknownModel { name, available } => {
                assert_eq!(name, "resnet");
                assert!(available.contains("vit"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_registered_preset_defaults_apply() {
        let mut registry = ModelRegistry::default();
        registry.register("vit-tiny", ModelKind::Vit, tiny_vit_args());

        let wrapper = load(&registry, "vit-tiny", &ModelArgs::default()).unwrap();
        assert_eq!(wrapper.preprocessor().crop_size(), 16);

        // user args still win over the preset
        let args = ModelArgs {
            image_size: Some(32),
            ..Default::default()
        };
        let wrapper = load(&registry, "vit-tiny", &args).unwrap();
        assert_eq!(wrapper.preprocessor().crop_size(), 32);
    }
}
