//! Evaluation metrics
//!
//! Accuracy is the metric used for model selection; the per-class table and
//! F1 scores are reported by the `eval` command and stored next to the model.

use serde::{Deserialize, Serialize};

/// Metrics for one evaluation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Total number of samples evaluated
    pub total_samples: usize,
    /// Number of correct predictions
    pub correct_predictions: usize,
    /// Overall accuracy (correct / total)
    pub accuracy: f64,
    /// Mean batch loss, set by the trainer
    pub loss: Option<f64>,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    /// F1 weighted by class support
    pub weighted_f1: f64,
    pub per_class: Vec<ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

impl EvalMetrics {
    /// Build metrics from predicted and true label ids.
    ///
    /// Pairs beyond the shorter slice are ignored. Classes with no support are
    /// excluded from the macro averages.
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let confusion_matrix =
            ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);
        let total_samples = confusion_matrix.total();
        if total_samples == 0 {
            return Self {
                confusion_matrix,
                ..Self::default()
            };
        }

        let correct_predictions = confusion_matrix.correct();
        let per_class: Vec<ClassMetrics> = (0..num_classes)
            .map(|class_idx| ClassMetrics::from_confusion_matrix(&confusion_matrix, class_idx))
            .collect();

        let supported: Vec<&ClassMetrics> = per_class.iter().filter(|m| m.support > 0).collect();
        let macro_avg = |f: fn(&ClassMetrics) -> f64| {
            if supported.is_empty() {
                0.0
            } else {
                supported.iter().map(|m| f(m)).sum::<f64>() / supported.len() as f64
            }
        };
        let macro_precision = macro_avg(|m| m.precision);
        let macro_recall = macro_avg(|m| m.recall);
        let macro_f1 = macro_avg(|m| m.f1);

        let weighted_f1 = per_class
            .iter()
            .map(|m| m.f1 * m.support as f64)
            .sum::<f64>()
            / total_samples as f64;

        Self {
            total_samples,
            correct_predictions,
            accuracy: correct_predictions as f64 / total_samples as f64,
            loss: None,
            macro_precision,
            macro_recall,
            macro_f1,
            weighted_f1,
            per_class,
            confusion_matrix,
        }
    }

    /// Attach class names from an id-ordered list
    pub fn with_class_names(mut self, names: &[String]) -> Self {
        for class in self.per_class.iter_mut() {
            class.class_name = names.get(class.class_idx).cloned();
        }
        self
    }

    /// Render the summary and per-class table
    pub fn report(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Samples:          {}\n", self.total_samples));
        out.push_str(&format!("Accuracy:         {:6.2}%\n", self.accuracy * 100.0));
        if let Some(loss) = self.loss {
            out.push_str(&format!("Loss:             {:.4}\n", loss));
        }
        out.push_str(&format!("Macro precision:  {:6.2}%\n", self.macro_precision * 100.0));
        out.push_str(&format!("Macro recall:     {:6.2}%\n", self.macro_recall * 100.0));
        out.push_str(&format!("Macro F1:         {:6.2}%\n", self.macro_f1 * 100.0));
        out.push_str(&format!("Weighted F1:      {:6.2}%\n\n", self.weighted_f1 * 100.0));

        out.push_str(&format!(
            "{:<32} {:>9} {:>9} {:>9} {:>8}\n",
            "class", "precision", "recall", "f1", "support"
        ));
        for class in &self.per_class {
            let name = class
                .class_name
                .clone()
                .unwrap_or_else(|| class.class_idx.to_string());
            out.push_str(&format!(
                "{:<32} {:>9.4} {:>9.4} {:>9.4} {:>8}\n",
                name, class.precision, class.recall, class.f1, class.support
            ));
        }
        out
    }
}

/// Per-class metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_idx: usize,
    pub class_name: Option<String>,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of ground-truth samples of this class
    pub support: usize,
}

impl ClassMetrics {
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);
        let predicted = cm.col_sum(class_idx);
        let support = cm.row_sum(class_idx);
        let false_positives = predicted - true_positives;
        let false_negatives = support - true_positives;

        let ratio = |num: usize, den: usize| if den > 0 { num as f64 / den as f64 } else { 0.0 };
        let precision = ratio(true_positives, predicted);
        let recall = ratio(true_positives, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            class_name: None,
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            support,
        }
    }
}

/// Confusion matrix, rows = actual, columns = predicted, row-major
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub num_classes: usize,
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let mut cm = Self::new(num_classes);
        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }
        cm
    }

    /// Record one prediction; out-of-range ids are dropped
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    fn row_sum(&self, row: usize) -> usize {
        (0..self.num_classes).map(|col| self.get(row, col)).sum()
    }

    fn col_sum(&self, col: usize) -> usize {
        (0..self.num_classes).map(|row| self.get(row, col)).sum()
    }
}

/// Running mean of a scalar (per-step training loss)
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confusion_matrix() {
        let predictions = vec![0, 1, 2, 0, 1, 2, 0, 0, 2, 2];
        let ground_truth = vec![0, 1, 2, 0, 2, 2, 1, 0, 1, 2];

        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth, 3);

        assert_eq!(cm.get(0, 0), 3);
        assert_eq!(cm.get(1, 1), 1);
        assert_eq!(cm.get(2, 2), 3);
        assert_eq!(cm.total(), 10);
        assert_eq!(cm.correct(), 7);
    }

    #[test]
    fn test_metrics_from_predictions() {
        let predictions = vec![0, 1, 2, 0, 1, 2, 0, 0, 2, 2];
        let ground_truth = vec![0, 1, 2, 0, 2, 2, 1, 0, 1, 2];

        let metrics = EvalMetrics::from_predictions(&predictions, &ground_truth, 3);

        assert_eq!(metrics.total_samples, 10);
        assert_eq!(metrics.correct_predictions, 7);
        assert!((metrics.accuracy - 0.7).abs() < 1e-9);
        assert_eq!(metrics.per_class.len(), 3);
    }

    #[test]
    fn test_class_metrics() {
        let predictions = vec![0, 0, 0, 1, 1];
        let ground_truth = vec![0, 0, 1, 1, 0];

        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth, 2);
        let class0 = ClassMetrics::from_confusion_matrix(&cm, 0);

        assert_eq!(class0.true_positives, 2);
        assert_eq!(class0.false_positives, 1);
        assert_eq!(class0.false_negatives, 1);
        assert_eq!(class0.support, 3);
        assert!((class0.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((class0.recall - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unsupported_class_excluded_from_macro() {
        // class 2 never appears in ground truth
        let metrics = EvalMetrics::from_predictions(&[0, 1], &[0, 1], 3);
        assert!((metrics.macro_f1 - 1.0).abs() < 1e-9);
        assert!((metrics.weighted_f1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_predictions() {
        let metrics = EvalMetrics::from_predictions(&[], &[], 4);
        assert_eq!(metrics.total_samples, 0);
        assert_eq!(metrics.accuracy, 0.0);
        assert_eq!(metrics.confusion_matrix.num_classes, 4);
    }

    #[test]
    fn test_report_uses_class_names() {
        let names = vec!["healthy".to_string(), "mosaic".to_string()];
        let metrics = EvalMetrics::from_predictions(&[0, 1], &[0, 0], 2).with_class_names(&names);
        let report = metrics.report();
        assert!(report.contains("healthy"));
        assert!(report.contains("mosaic"));
    }

    #[test]
    fn test_running_average() {
        let mut avg = RunningAverage::new();
        avg.add(1.0);
        avg.add(2.0);
        avg.add(3.0);
        assert_eq!(avg.count(), 3);
        assert!((avg.average() - 2.0).abs() < 1e-9);
        avg.reset();
        assert_eq!(avg.average(), 0.0);
    }
}
