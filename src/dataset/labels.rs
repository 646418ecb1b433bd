//! Label id <-> class name mapping
//!
//! Ids are dense (`0..K`) and assigned in sorted class-name order, so the same
//! training partition always yields the same mapping.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::{Error, Result};

/// Bidirectional mapping, serialized as `{"id2label": {...}, "label2id": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapping {
    id2label: BTreeMap<usize, String>,
    label2id: BTreeMap<String, usize>,
}

impl LabelMapping {
    /// Build from the distinct class names observed in training data.
    ///
    /// Duplicates collapse; order of the input does not matter.
    pub fn from_class_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();

        if names.is_empty() {
            return Err(Error::Dataset("no class labels found".into()));
        }

        let id2label: BTreeMap<usize, String> = names.into_iter().enumerate().collect();
        let label2id = id2label
            .iter()
            .map(|(&id, name)| (name.clone(), id))
            .collect();

        Ok(Self { id2label, label2id })
    }

    pub fn len(&self) -> usize {
        self.id2label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2label.is_empty()
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.label2id.get(name).copied()
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.id2label.get(&id).map(String::as_str)
    }

    /// Class names ordered by id
    pub fn names(&self) -> Vec<String> {
        self.id2label.values().cloned().collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load and check that ids are exactly `0..K` and both directions agree
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mapping: Self = serde_json::from_str(&content)?;

        let dense = mapping.id2label.keys().copied().eq(0..mapping.id2label.len());
        let consistent = mapping.label2id.len() == mapping.id2label.len()
            && mapping
                .id2label
                .iter()
                .all(|(id, name)| mapping.label2id.get(name) == Some(id));
        if !dense || !consistent || mapping.is_empty() {
            return Err(Error::Model(format!(
                "label mapping in {} is not a dense bijection",
                path.display()
            )));
        }
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sorted_dense_ids() {
        let labels = LabelMapping::from_class_names(["cmd", "cbb", "healthy", "cbb"]).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.id("cbb"), Some(0));
        assert_eq!(labels.id("cmd"), Some(1));
        assert_eq!(labels.id("healthy"), Some(2));
        assert_eq!(labels.name(2), Some("healthy"));
        assert_eq!(labels.id("cgm"), None);
    }

    #[test]
    fn test_empty_rejected() {
        let names: Vec<String> = Vec::new();
        assert!(LabelMapping::from_class_names(names).is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.json");
        let labels = LabelMapping::from_class_names(["b", "a"]).unwrap();

        labels.save(&path).unwrap();
        let loaded = LabelMapping::load(&path).unwrap();

        assert_eq!(loaded, labels);
        assert_eq!(loaded.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_load_rejects_gaps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.json");
        fs::write(
            &path,
            r#"{"id2label": {"0": "a", "2": "b"}, "label2id": {"a": 0, "b": 2}}"#,
        )
        .unwrap();

        assert!(LabelMapping::load(&path).is_err());
    }
}
