//! Training module
//!
//! - Inverse-frequency class weights
//! - Weighted, label-smoothed cross-entropy
//! - Typed training options, learning rate schedules and checkpoint rotation
//! - The step-based trainer loop

pub mod checkpoint;
pub mod class_weights;
pub mod loss;
pub mod options;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointManager, TrainerState};
pub use class_weights::ClassWeights;
pub use loss::{WeightedCrossEntropyLoss, WeightedCrossEntropyLossConfig};
pub use options::{BestMetric, IntervalStrategy, ReportTo, SchedulerKind, TrainingOptions};
pub use scheduler::LrSchedule;
pub use trainer::{evaluate_model, TrainOutcome, WeightedTrainer};
