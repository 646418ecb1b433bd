//! Class-weighted, label-smoothed cross-entropy
//!
//! For logits `[N, K]` and labels `[N]`:
//!
//! ```text
//! target_k = 1 - eps          if k == y
//!          = eps / (K - 1)    otherwise
//! loss_i   = -sum_k target_k * log_softmax(logits_i)_k
//! loss     = mean_i(weight[y_i] * loss_i)
//! ```
//!
//! The smoothed target is never materialised: the true-class term is gathered
//! and the off-class mass is the row sum of log-probabilities minus that term.

use burn::{
    config::Config,
    tensor::{activation::log_softmax, backend::Backend, Int, Tensor},
};

use crate::utils::error::{self, Error};

/// Configuration for [`WeightedCrossEntropyLoss`]
#[derive(Config, Debug)]
pub struct WeightedCrossEntropyLossConfig {
    /// Per-class weights indexed by label id
    pub weights: Vec<f32>,

    /// Label smoothing factor in `[0, 1)`
    #[config(default = "0.0")]
    pub smoothing: f32,
}

impl WeightedCrossEntropyLossConfig {
    /// Validate the weights and smoothing factor
    pub fn init(&self) -> error::Result<WeightedCrossEntropyLoss> {
        if self.weights.is_empty() {
            return Err(Error::Config("loss needs at least one class weight".into()));
        }
        if let Some((class, w)) = self
            .weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w <= 0.0)
        {
            return Err(Error::Config(format!(
                "class weight for label {} must be finite and positive, got {}",
                class, w
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(Error::Config(format!(
                "label smoothing must be in [0, 1), got {}",
                self.smoothing
            )));
        }

        Ok(WeightedCrossEntropyLoss {
            weights: self.weights.clone(),
            smoothing: self.smoothing,
        })
    }
}

/// Weighted cross-entropy with optional label smoothing.
///
/// Holds no tensors, so one instance serves both the autodiff backend during
/// training and the inner backend during evaluation.
#[derive(Debug, Clone)]
pub struct WeightedCrossEntropyLoss {
    weights: Vec<f32>,
    smoothing: f32,
}

impl WeightedCrossEntropyLoss {
    pub fn num_classes(&self) -> usize {
        self.weights.len()
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Compute the batch loss.
    ///
    /// - logits: `[batch_size, num_classes]`
    /// - targets: `[batch_size]`
    ///
    /// # Panics
    ///
    /// Panics if `num_classes` differs from the number of configured class
    /// weights. Callers check [`Self::num_classes`] against the model first.
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let [batch_size, num_classes] = logits.dims();
        assert_eq!(
            num_classes,
            self.weights.len(),
            "logits have {} classes but {} class weights were configured",
            num_classes,
            self.weights.len()
        );

        let device = logits.device();
        let log_probs = log_softmax(logits, 1);

        let true_class = log_probs
            .clone()
            .gather(1, targets.clone().reshape([batch_size, 1]));

        let nll = if self.smoothing > 0.0 && num_classes > 1 {
            let off_class_mass = self.smoothing as f64 / (num_classes - 1) as f64;
            let other_classes = log_probs.sum_dim(1) - true_class.clone();
            let on_class = true_class.mul_scalar(1.0 - self.smoothing as f64);
            (on_class + other_classes.mul_scalar(off_class_mass)).neg()
        } else {
            true_class.neg()
        };
        let nll: Tensor<B, 1> = nll.reshape([batch_size]);

        let class_weights = Tensor::<B, 1>::from_floats(self.weights.as_slice(), &device);
        let example_weights = class_weights.select(0, targets);

        (nll * example_weights).mean()
    }
}
