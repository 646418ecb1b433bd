//! Weighted training loop
//!
//! A plain loop over Burn primitives: epochs of shuffled batches, the
//! class-weighted label-smoothed loss, AdamW with a per-step learning-rate
//! schedule, periodic evaluation and checkpointing, and best-model selection.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    grad_clipping::GradientClippingConfig,
    module::{AutodiffModule, Module},
    optim::{AdamWConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::dataset::burn_dataset::{ImageBatch, ImageBatcher, TransformedImageDataset};
use crate::model::classifier::{ImageClassifier, WEIGHTS_FILE};
use crate::tracking::{NoopTracker, Tracker};
use crate::training::checkpoint::{CheckpointManager, TrainerState, TRAINER_STATE_FILE};
use crate::training::loss::WeightedCrossEntropyLoss;
use crate::training::options::{BestMetric, IntervalStrategy, TrainingOptions};
use crate::training::scheduler::LrSchedule;
use crate::utils::error::{Error, Result};
use crate::utils::logging::{LogContext, TrainingLogger};
use crate::utils::metrics::{EvalMetrics, RunningAverage};

/// Result of a completed run
pub struct TrainOutcome<B: AutodiffBackend> {
    /// Final model (the best checkpoint when `load_best_model_at_end` is set)
    pub model: ImageClassifier<B>,
    pub state: TrainerState,
    /// Last evaluation performed, if any
    pub last_eval: Option<EvalMetrics>,
}

/// Trainer whose loss is the class-weighted, label-smoothed cross-entropy
pub struct WeightedTrainer<B: AutodiffBackend> {
    model: ImageClassifier<B>,
    loss: WeightedCrossEntropyLoss,
    options: TrainingOptions,
    output_dir: PathBuf,
    device: B::Device,
    ctx: LogContext,
    tracker: Box<dyn Tracker>,
}

impl<B: AutodiffBackend> WeightedTrainer<B> {
    pub fn new(
        model: ImageClassifier<B>,
        loss: WeightedCrossEntropyLoss,
        options: TrainingOptions,
        output_dir: &Path,
        device: B::Device,
        ctx: LogContext,
    ) -> Self {
        Self {
            model,
            loss,
            options,
            output_dir: output_dir.to_path_buf(),
            device,
            ctx,
            tracker: Box::new(NoopTracker),
        }
    }

    pub fn with_tracker(mut self, tracker: Box<dyn Tracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Run the full training schedule
    pub fn train(
        self,
        train_set: TransformedImageDataset,
        val_set: TransformedImageDataset,
    ) -> Result<TrainOutcome<B>> {
        let Self {
            mut model,
            loss,
            options,
            output_dir,
            device,
            ctx,
            mut tracker,
        } = self;
        let _span = ctx.span().clone().entered();

        options.validate()?;
        if loss.num_classes() != model.num_classes() {
            return Err(Error::Training(format!(
                "loss has {} class weights but the model predicts {} classes",
                loss.num_classes(),
                model.num_classes()
            )));
        }
        if train_set.is_empty() {
            return Err(Error::Training("training partition is empty".into()));
        }

        fs::create_dir_all(&output_dir)?;
        let logging_dir = output_dir.join(&options.logging_dir);
        fs::create_dir_all(&logging_dir)?;
        let metrics_log = logging_dir.join("metrics.jsonl");

        let image_size = train_set.transform().output_size() as usize;
        let eval_size = val_set.transform().output_size() as usize;
        let train_len = train_set.len();
        let val_len = val_set.len();

        let train_batcher = ImageBatcher::<B>::new(device.clone(), image_size);
        let train_loader = DataLoaderBuilder::new(train_batcher)
            .batch_size(options.per_device_train_batch_size)
            .shuffle(options.seed)
            .num_workers(options.dataloader_num_workers)
            .build(train_set);

        let inner_device = model.valid().devices().into_iter().next().unwrap_or_default();
        let valid_batcher = ImageBatcher::<B::InnerBackend>::new(inner_device, eval_size);
        let valid_loader = DataLoaderBuilder::new(valid_batcher)
            .batch_size(options.per_device_eval_batch_size)
            .num_workers(options.dataloader_num_workers)
            .build(val_set);

        let steps_per_epoch = options.steps_per_epoch(train_len);
        let total_steps = options.total_steps(train_len);
        let schedule = LrSchedule::new(
            options.lr_scheduler_type,
            options.learning_rate,
            options.warmup_steps(total_steps),
            total_steps,
        );

        let mut optim = AdamWConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(1e-8)
            .with_weight_decay(options.weight_decay as f32)
            .with_grad_clipping(options.max_grad_norm.map(GradientClippingConfig::Norm))
            .init();

        let checkpoints =
            CheckpointManager::new(output_dir.clone()).save_total_limit(options.save_total_limit);
        let mut state = TrainerState::new(total_steps, options.num_train_epochs);
        let mut last_eval: Option<EvalMetrics> = None;
        let mut epoch_logger = TrainingLogger::new(options.num_train_epochs);

        tracker.log_config(&json!({
            "training": &options,
            "num_classes": model.num_classes(),
            "model": model.kind().display_name(),
            "train_samples": train_len,
            "eval_samples": val_len,
        }))?;

        info!(
            "Training {} on {} samples ({} eval) for {} epochs, {} steps",
            model.kind(),
            train_len,
            val_len,
            options.num_train_epochs,
            total_steps
        );

        for epoch in 0..options.num_train_epochs {
            epoch_logger.start_epoch(epoch);
            let progress = progress_bar(steps_per_epoch as u64, ctx.is_debug());

            let mut epoch_loss = RunningAverage::new();
            let mut window_loss = RunningAverage::new();
            let mut lr = schedule.lr_at(state.global_step);

            for (batch_idx, batch) in train_loader.iter().enumerate() {
                lr = schedule.lr_at(state.global_step);

                let logits = model.forward(batch.images);
                let batch_loss = loss.forward(logits, batch.targets);
                let loss_value: f64 = batch_loss.clone().into_scalar().elem();

                let grads = GradientsParams::from_grads(batch_loss.backward(), &model);
                model = optim.step(lr, model, grads);

                state.global_step += 1;
                state.epoch = epoch as f64 + (batch_idx + 1) as f64 / steps_per_epoch as f64;
                epoch_loss.add(loss_value);
                window_loss.add(loss_value);
                progress.inc(1);

                if ctx.is_debug() {
                    debug!("step {} loss {:.5} lr {:.3e}", state.global_step, loss_value, lr);
                }

                if state.global_step % options.logging_steps == 0 {
                    let values = BTreeMap::from([
                        ("loss".to_string(), window_loss.average()),
                        ("learning_rate".to_string(), lr),
                    ]);
                    record(&mut state, tracker.as_mut(), &metrics_log, values)?;
                    window_loss.reset();
                }

                let eval = if options.eval_at_step(state.global_step) {
                    Some(evaluate(
                        &model.valid(),
                        &loss,
                        &valid_loader,
                        &mut state,
                        tracker.as_mut(),
                        &metrics_log,
                    )?)
                } else {
                    None
                };
                if options.save_at_step(state.global_step) {
                    save_checkpoint(&checkpoints, &model, &mut state, eval.as_ref(), &options)?;
                } else if let Some(metrics) = &eval {
                    update_best(&mut state, metrics, None, &options);
                }
                if eval.is_some() {
                    last_eval = eval;
                }
            }
            progress.finish_and_clear();

            epoch_logger.end_epoch(epoch_loss.average(), lr);

            let eval = if options.eval_strategy == IntervalStrategy::Epoch {
                let metrics = evaluate(
                    &model.valid(),
                    &loss,
                    &valid_loader,
                    &mut state,
                    tracker.as_mut(),
                    &metrics_log,
                )?;
                info!(
                    "Epoch {}/{}: train loss {:.4}, eval loss {:.4}, eval accuracy {:.2}%",
                    epoch + 1,
                    options.num_train_epochs,
                    epoch_loss.average(),
                    metrics.loss.unwrap_or(f64::NAN),
                    metrics.accuracy * 100.0
                );
                Some(metrics)
            } else {
                None
            };

            if options.save_strategy == IntervalStrategy::Epoch {
                save_checkpoint(&checkpoints, &model, &mut state, eval.as_ref(), &options)?;
            } else if let Some(metrics) = &eval {
                update_best(&mut state, metrics, None, &options);
            }
            if eval.is_some() {
                last_eval = eval;
            }
        }

        if options.load_best_model_at_end {
            match &state.best_model_checkpoint {
                Some(best) => {
                    info!(
                        "Loading best model from {:?} ({} = {:.4})",
                        best,
                        options.metric_for_best_model.name(),
                        state.best_metric.unwrap_or(f64::NAN)
                    );
                    model = model.load_weights(&best.join(WEIGHTS_FILE), &device)?;
                }
                None => warn!("load_best_model_at_end is set but no checkpoint was evaluated"),
            }
        }

        state.save(&output_dir.join(TRAINER_STATE_FILE))?;

        let mut summary = BTreeMap::from([
            ("train_runtime".to_string(), epoch_logger.total_elapsed()),
            ("global_step".to_string(), state.global_step as f64),
        ]);
        if let Some(best) = state.best_metric {
            summary.insert(format!("best_{}", options.metric_for_best_model.name()), best);
        }
        tracker.finish(&summary)?;

        info!(
            "Training finished: {} steps in {:.1}s",
            state.global_step,
            epoch_logger.total_elapsed()
        );

        Ok(TrainOutcome {
            model,
            state,
            last_eval,
        })
    }
}

/// Evaluate on the validation loader with the training loss.
///
/// Fails when `loss` was configured for a different number of classes than
/// the model's head.
pub fn evaluate_model<B: Backend>(
    model: &ImageClassifier<B>,
    loss: &WeightedCrossEntropyLoss,
    loader: &Arc<dyn DataLoader<B, ImageBatch<B>>>,
) -> Result<EvalMetrics> {
    let num_classes = model.num_classes();
    if loss.num_classes() != num_classes {
        return Err(Error::Training(format!(
            "loss has {} class weights but the model predicts {} classes",
            loss.num_classes(),
            num_classes
        )));
    }
    let mut predictions = Vec::new();
    let mut ground_truth = Vec::new();
    let mut loss_sum = 0.0;

    for batch in loader.iter() {
        let [batch_size] = batch.targets.dims();
        let logits = model.forward(batch.images);

        let batch_loss: f64 = loss
            .forward(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();
        loss_sum += batch_loss * batch_size as f64;

        predictions.extend(int_values(logits.argmax(1).reshape([batch_size]))?);
        ground_truth.extend(int_values(batch.targets)?);
    }

    let mut metrics = EvalMetrics::from_predictions(&predictions, &ground_truth, num_classes);
    if metrics.total_samples > 0 {
        metrics.loss = Some(loss_sum / metrics.total_samples as f64);
    }
    Ok(metrics)
}

fn int_values<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| Error::Training(format!("cannot read class indices: {:?}", e)))?
        .into_iter()
        .map(|v| {
            usize::try_from(v).map_err(|_| Error::Training(format!("negative class index {}", v)))
        })
        .collect()
}

fn evaluate<B: Backend>(
    model: &ImageClassifier<B>,
    loss: &WeightedCrossEntropyLoss,
    loader: &Arc<dyn DataLoader<B, ImageBatch<B>>>,
    state: &mut TrainerState,
    tracker: &mut dyn Tracker,
    metrics_log: &Path,
) -> Result<EvalMetrics> {
    let metrics = evaluate_model(model, loss, loader)?;

    let mut values = BTreeMap::from([
        ("eval_accuracy".to_string(), metrics.accuracy),
        ("eval_macro_f1".to_string(), metrics.macro_f1),
    ]);
    if let Some(eval_loss) = metrics.loss {
        values.insert("eval_loss".to_string(), eval_loss);
    }
    record(state, tracker, metrics_log, values)?;
    Ok(metrics)
}

/// Append to the log history, the tracker and the metrics log
fn record(
    state: &mut TrainerState,
    tracker: &mut dyn Tracker,
    metrics_log: &Path,
    values: BTreeMap<String, f64>,
) -> Result<()> {
    tracker.log_metrics(state.global_step, &values)?;
    state.log(values);

    if let Some(entry) = state.log_history.last() {
        let mut file = OpenOptions::new().create(true).append(true).open(metrics_log)?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        info!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

/// Mark the checkpoint at `checkpoint` as best if `metrics` improves on the record
fn update_best(
    state: &mut TrainerState,
    metrics: &EvalMetrics,
    checkpoint: Option<PathBuf>,
    options: &TrainingOptions,
) {
    let metric = &options.metric_for_best_model;
    let value = match metric {
        BestMetric::Accuracy => metrics.accuracy,
        BestMetric::Loss => metrics.loss.unwrap_or(f64::INFINITY),
    };

    let improved = state.best_metric.map_or(true, |best| metric.improves(value, best));
    if improved {
        info!("New best {}: {:.4}", metric.name(), value);
        state.best_metric = Some(value);
        if checkpoint.is_some() {
            state.best_model_checkpoint = checkpoint;
        }
    }
}

fn save_checkpoint<B: Backend>(
    checkpoints: &CheckpointManager,
    model: &ImageClassifier<B>,
    state: &mut TrainerState,
    eval: Option<&EvalMetrics>,
    options: &TrainingOptions,
) -> Result<()> {
    if let Some(metrics) = eval {
        update_best(state, metrics, Some(checkpoints.checkpoint_dir(state.global_step)), options);
    }
    checkpoints.save(model, state)?;
    Ok(())
}

fn progress_bar(len: u64, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    let template =
        "  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})";
    if let Ok(style) = ProgressStyle::default_bar().template(template) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}
