//! Inverse-frequency class weights
//!
//! `weight(c) = total / (num_observed_classes * count(c))`, computed over the
//! labels that actually occur in the training partition. The table is built
//! fresh for every run and never persisted.

use std::collections::BTreeMap;

use tracing::warn;

use crate::utils::error::{Error, Result};

/// Label id -> weight, only for labels observed in training
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassWeights {
    weights: BTreeMap<usize, f64>,
    counts: BTreeMap<usize, usize>,
    total: usize,
}

impl ClassWeights {
    /// Count labels and derive weights.
    ///
    /// A class absent from `labels` gets no entry at all.
    pub fn from_labels(labels: &[usize]) -> Self {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for &label in labels {
            *counts.entry(label).or_insert(0) += 1;
        }

        let total = labels.len();
        let num_classes = counts.len() as f64;
        let weights = counts
            .iter()
            .map(|(&label, &count)| (label, total as f64 / (num_classes * count as f64)))
            .collect();

        Self {
            weights,
            counts,
            total,
        }
    }

    pub fn get(&self, label: usize) -> Option<f64> {
        self.weights.get(&label).copied()
    }

    /// Number of training examples carrying `label`
    pub fn count(&self, label: usize) -> usize {
        self.counts.get(&label).copied().unwrap_or(0)
    }

    /// Number of labels with a weight
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Total number of training labels the table was built from
    pub fn total(&self) -> usize {
        self.total
    }

    /// Iterate `(label, weight)` in ascending label order
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.weights.iter().map(|(&label, &weight)| (label, weight))
    }

    /// Labels in `0..num_classes` that have no weight entry
    pub fn missing(&self, num_classes: usize) -> Vec<usize> {
        (0..num_classes)
            .filter(|label| !self.weights.contains_key(label))
            .collect()
    }

    /// Per-class weight vector indexed by label id, as consumed by the loss.
    ///
    /// A class with no training examples has no defined weight; that is
    /// reported as an error naming the classes rather than silently
    /// substituting a value.
    pub fn dense(&self, num_classes: usize) -> Result<Vec<f32>> {
        if let Some((&label, _)) = self.weights.range(num_classes..).next() {
            return Err(Error::Training(format!(
                "label {} is outside the {} known classes",
                label, num_classes
            )));
        }

        let missing = self.missing(num_classes);
        if !missing.is_empty() {
            warn!(
                "{} of {} classes have no training examples: {:?}",
                missing.len(),
                num_classes,
                missing
            );
            return Err(Error::Training(format!(
                "no class weight for labels {:?}: they never occur in the training set",
                missing
            )));
        }

        Ok(self.weights.values().map(|&w| w as f32).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_imbalanced_three_classes() {
        // A=0 x100, B=1 x50, C=2 x50
        let mut labels = vec![0usize; 100];
        labels.extend(vec![1usize; 50]);
        labels.extend(vec![2usize; 50]);

        let weights = ClassWeights::from_labels(&labels);

        assert_eq!(weights.len(), 3);
        assert!(approx(weights.get(0).unwrap(), 0.667));
        assert!(approx(weights.get(1).unwrap(), 1.333));
        assert!(approx(weights.get(2).unwrap(), 1.333));
    }

    #[test]
    fn test_balanced_labels() {
        let weights = ClassWeights::from_labels(&[0, 0, 1, 1]);
        assert_eq!(weights.get(0), Some(1.0));
        assert_eq!(weights.get(1), Some(1.0));
    }

    #[test]
    fn test_skewed_labels() {
        let weights = ClassWeights::from_labels(&[0, 0, 0, 1]);
        assert!(approx(weights.get(0).unwrap(), 0.667));
        assert!(approx(weights.get(1).unwrap(), 2.0));
    }

    #[test]
    fn test_weighted_counts_sum_to_total() {
        let labels = vec![0, 0, 0, 0, 0, 1, 1, 2, 3, 3, 3];
        let weights = ClassWeights::from_labels(&labels);

        let sum: f64 = weights
            .iter()
            .map(|(label, w)| w * weights.count(label) as f64)
            .sum();
        assert!((sum - labels.len() as f64).abs() < 1e-9);
        assert!(weights.iter().all(|(_, w)| w > 0.0));
    }

    #[test]
    fn test_rarer_class_gets_larger_weight() {
        let weights = ClassWeights::from_labels(&[0, 0, 0, 0, 1, 1, 2]);
        assert!(weights.get(2).unwrap() > weights.get(1).unwrap());
        assert!(weights.get(1).unwrap() > weights.get(0).unwrap());
    }

    #[test]
    fn test_absent_class_has_no_entry() {
        let weights = ClassWeights::from_labels(&[0, 0, 2, 2]);
        assert_eq!(weights.get(1), None);
        assert_eq!(weights.missing(3), vec![1]);
        // num_classes counts observed labels only
        assert_eq!(weights.get(0), Some(1.0));
    }

    #[test]
    fn test_dense_vector() {
        let weights = ClassWeights::from_labels(&[0, 0, 0, 1]);
        let dense = weights.dense(2).unwrap();
        assert_eq!(dense.len(), 2);
        assert!((dense[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_dense_rejects_missing_class() {
        let weights = ClassWeights::from_labels(&[0, 0, 2, 2]);
        assert!(matches!(weights.dense(3), Err(Error::Training(_))));
    }

    #[test]
    fn test_dense_rejects_out_of_range_label() {
        let weights = ClassWeights::from_labels(&[0, 1, 5]);
        assert!(weights.dense(2).is_err());
    }

    #[test]
    fn test_empty_labels() {
        let weights = ClassWeights::from_labels(&[]);
        assert!(weights.is_empty());
        assert_eq!(weights.total(), 0);
    }
}
