//! Run configuration
//!
//! A run is configured in three layers, later layers winning:
//! built-in defaults, an optional TOML file with `[model]` and `[training]`
//! tables, then the `--model_args` / `--training_args` JSON strings.
//! JSON overrides replace only the keys they name.

use std::fs;
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::model::config::ModelArgs;
use crate::training::options::TrainingOptions;
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub model: ModelArgs,
    pub training: TrainingOptions,
}

impl RunConfig {
    /// Apply the CLI JSON strings (either may be absent)
    pub fn with_overrides(
        self,
        model_args: Option<&str>,
        training_args: Option<&str>,
    ) -> Result<Self> {
        let model = match model_args {
            Some(json) => merge_json_overrides(&self.model, json, &[])?,
            None => self.model,
        };
        let training = match training_args {
            Some(json) => merge_json_overrides(&self.training, json, TrainingOptions::KEY_ALIASES)?,
            None => self.training,
        };
        Ok(Self { model, training })
    }
}

/// Read a TOML run configuration
pub fn load_toml_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        return Err(Error::PathNotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let config: RunConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("invalid config file {}: {}", path.display(), e)))?;
    debug!("Loaded run config from {:?}", path);
    Ok(config)
}

/// Overlay the keys of the JSON object `json` onto `base`.
///
/// `aliases` maps alternative key names onto the serialized field name, so an
/// alias replaces the base value instead of colliding with it. An empty string
/// leaves `base` unchanged. Keys the target type does not know are rejected
/// when the merged value is deserialized.
pub fn merge_json_overrides<T>(base: &T, json: &str, aliases: &[(&str, &str)]) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let json = json.trim();
    let mut merged = serde_json::to_value(base)?;
    if json.is_empty() {
        return serde_json::from_value(merged).map_err(|e| Error::Config(e.to_string()));
    }

    let overrides: Value = serde_json::from_str(json)
        .map_err(|e| Error::Config(format!("malformed JSON '{}': {}", json, e)))?;
    let Value::Object(overrides) = overrides else {
        return Err(Error::Config(format!("expected a JSON object, got '{}'", json)));
    };

    match &mut merged {
        Value::Object(target) => {
            for (key, value) in overrides {
                let key = aliases
                    .iter()
                    .find(|(alias, _)| *alias == key)
                    .map(|(_, field)| field.to_string())
                    .unwrap_or(key);
                target.insert(key, value);
            }
        }
        _ => return Err(Error::Config("override target is not a JSON object".into())),
    }

    serde_json::from_value(merged).map_err(|e| Error::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::options::{IntervalStrategy, SchedulerKind};
    use tempfile::TempDir;

    #[test]
    fn test_json_override_replaces_named_fields_only() {
        let base = TrainingOptions::default();
        let merged = merge_json_overrides(
            &base,
            r#"{"num_train_epochs": 3, "lr_scheduler_type": "cosine"}"#,
            TrainingOptions::KEY_ALIASES,
        )
        .unwrap();

        assert_eq!(merged.num_train_epochs, 3);
        assert_eq!(merged.lr_scheduler_type, SchedulerKind::Cosine);
        assert_eq!(merged.learning_rate, base.learning_rate);
        assert_eq!(merged.label_smoothing, base.label_smoothing);
    }

    #[test]
    fn test_lr_alias() {
        let merged = merge_json_overrides(
            &TrainingOptions::default(),
            r#"{"lr": 0.001}"#,
            TrainingOptions::KEY_ALIASES,
        )
        .unwrap();
        assert!((merged.learning_rate - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let result = merge_json_overrides(&TrainingOptions::default(), r#"{"epochs": 3}"#, &[]);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = merge_json_overrides(&ModelArgs::default(), r#"{"hidden": 3}"#, &[]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(merge_json_overrides(&ModelArgs::default(), "{not json", &[]).is_err());
        assert!(merge_json_overrides(&ModelArgs::default(), "[1, 2]", &[]).is_err());
    }

    #[test]
    fn test_empty_override_is_identity() {
        let base = ModelArgs {
            image_size: Some(64),
            ..Default::default()
        };
        assert_eq!(merge_json_overrides(&base, "  ", &[]).unwrap(), base);
    }

    #[test]
    fn test_model_args_override() {
        let merged = merge_json_overrides(
            &ModelArgs::default(),
            r#"{"variant": "small", "dropout": 0.1}"#,
            &[],
        )
        .unwrap();
        assert_eq!(merged.variant, Some(crate::model::mobilenet::MobileNetVariant::Small));
        assert_eq!(merged.dropout, Some(0.1));
    }

    #[test]
    fn test_toml_then_json_layering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
[model]
image_size = 128

[training]
num_train_epochs = 5
eval_strategy = "steps"
save_strategy = "steps"
eval_steps = 20
save_steps = 20
"#,
        )
        .unwrap();

        let config = load_toml_config(&path)
            .unwrap()
            .with_overrides(None, Some(r#"{"num_train_epochs": 2}"#))
            .unwrap();

        assert_eq!(config.model.image_size, Some(128));
        assert_eq!(config.training.num_train_epochs, 2);
        assert_eq!(config.training.eval_strategy, IntervalStrategy::Steps);
        assert_eq!(config.training.eval_steps, 20);
        assert!(config.training.validate().is_ok());
    }

    #[test]
    fn test_toml_rejects_unknown_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, "[optimizer]\nname = \"sgd\"\n").unwrap();
        assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_toml() {
        let result = load_toml_config(Path::new("/nonexistent/run.toml"));
        assert!(matches!(result, Err(Error::PathNotFound(_))));
    }
}
