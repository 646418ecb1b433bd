//! cassava_train CLI
//!
//! Entry point for fine-tuning and evaluating image classifiers on an
//! image-folder dataset with the class-weighted trainer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use cassava_train::backend::{auto_device, backend_name, TrainingBackend};
use cassava_train::config::{load_toml_config, RunConfig};
use cassava_train::dataset::{load_split, load_splits, Split};
use cassava_train::model::{ModelRegistry, ModelWrapper};
use cassava_train::tracking::TrackingConfig;
use cassava_train::utils::logging::{init_logging, LogConfig, LogContext};

/// Class-weighted image classification training
#[derive(Parser, Debug)]
#[command(name = "cassava_train")]
#[command(version)]
#[command(
    about = "Fine-tune ViT, ConvNeXtV2 and MobileNetV3 classifiers with Burn",
    long_about = None
)]
struct Cli {
    /// Enable debug logging (class weights, per-step losses)
    #[arg(long, global = true, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a registered model on a dataset
    Train {
        /// Registry key of the model to train
        #[arg(long)]
        model: String,

        /// Dataset root directory
        #[arg(long, default_value = "data/cassava-leaf-disease-classification")]
        dataset: PathBuf,

        /// Subset directory inside the dataset ("default" for none)
        #[arg(long, default_value = "default")]
        subset: String,

        /// JSON object merged into the model arguments
        #[arg(long = "model-args", alias = "model_args", default_value = "{}")]
        model_args: String,

        /// JSON object merged into the training options
        #[arg(long = "training-args", alias = "training_args", default_value = "{}")]
        training_args: String,

        /// TOML file with [model] and [training] tables
        #[arg(long)]
        config: Option<PathBuf>,

        /// Parent directory of the run directory
        #[arg(long = "output-dir", alias = "output_dir", default_value = "output/models")]
        output_dir: PathBuf,

        /// Experiment tracking project
        #[arg(long = "wandb-project", alias = "wandb_project", default_value = "sc4000")]
        wandb_project: String,

        /// Experiment tracking run name
        #[arg(long = "wandb-run-name", alias = "wandb_run_name", default_value = "default")]
        wandb_run_name: String,

        /// Seed for shuffling and training
        #[arg(long, default_value = "28")]
        seed: u64,

        /// Disable experiment tracking
        #[arg(long = "disable-wandb", alias = "disable_wandb", default_value = "false")]
        disable_wandb: bool,
    },

    /// Evaluate a trained model directory on a dataset partition
    Eval {
        /// Directory written by a training run
        #[arg(long = "model-dir", alias = "model_dir")]
        model_dir: PathBuf,

        /// Dataset root directory
        #[arg(long)]
        dataset: PathBuf,

        /// Subset directory inside the dataset ("default" for none)
        #[arg(long, default_value = "default")]
        subset: String,

        /// Partition to evaluate
        #[arg(long, default_value = "validation")]
        split: Split,

        #[arg(long = "batch-size", alias = "batch_size", default_value = "16")]
        batch_size: usize,
    },

    /// List registered models
    Models,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = init_logging(&LogConfig::from_debug_flag(cli.debug))?;

    print_banner();

    match cli.command {
        Commands::Train {
            model,
            dataset,
            subset,
            model_args,
            training_args,
            config,
            output_dir,
            wandb_project,
            wandb_run_name,
            seed,
            disable_wandb,
        } => {
            let mut run = match &config {
                Some(path) => load_toml_config(path)?,
                None => RunConfig::default(),
            };
            run.training.seed = seed;
            let run = run.with_overrides(Some(&model_args), Some(&training_args))?;

            let tracking = TrackingConfig::new(&wandb_project, &wandb_run_name, disable_wandb);
            let ctx = ctx.with_run(&wandb_run_name);

            cmd_train(&model, &dataset, &subset, run, &output_dir, seed, tracking, &ctx)?;
        }

        Commands::Eval {
            model_dir,
            dataset,
            subset,
            split,
            batch_size,
        } => {
            cmd_eval(&model_dir, &dataset, &subset, split, batch_size, &ctx)?;
        }

        Commands::Models => cmd_models(),
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        format!("cassava_train {} | backend: {}", cassava_train::VERSION, backend_name())
            .as_str()
            .green()
            .bold()
    );
}

#[allow(clippy::too_many_arguments)]
fn cmd_train(
    model_name: &str,
    dataset: &Path,
    subset: &str,
    run: RunConfig,
    output_dir: &Path,
    seed: u64,
    tracking: TrackingConfig,
    ctx: &LogContext,
) -> Result<()> {
    run.training.validate()?;
    info!("Training model {} on dataset {:?}", model_name, dataset);

    let splits = load_splits(dataset, subset, seed)?;
    let registry = ModelRegistry::default();
    let mut model = registry
        .load_model::<TrainingBackend>(model_name, &run.model, &splits.labels, auto_device(), ctx)?
        .with_tracking(tracking);
    info!("Loaded model {}", model.name());

    let now = Local::now().format("%Y-%m-%d-%H-%M-%S");
    let output_folder = output_dir.join(format!("{}_{}", model.name(), now));
    fs::create_dir_all(&output_folder)
        .with_context(|| format!("creating output directory {}", output_folder.display()))?;
    fs::write(output_folder.join("run_config.json"), serde_json::to_string_pretty(&run)?)?;

    model.train(&splits.train, &splits.validation, &output_folder, &run.training)?;

    info!("Training complete, model saved to {:?}", output_folder);
    println!("{} {}", "Model saved to".green().bold(), output_folder.display());
    Ok(())
}

fn cmd_eval(
    model_dir: &Path,
    dataset: &Path,
    subset: &str,
    split: Split,
    batch_size: usize,
    ctx: &LogContext,
) -> Result<()> {
    let model =
        ModelWrapper::<TrainingBackend>::from_dir(model_dir, auto_device(), ctx.child("eval"))?;
    let folder = load_split(dataset, subset, split, model.labels())?;
    info!("Evaluating {} on {} {} samples", model.name(), folder.len(), split);

    let metrics = model.evaluate(&folder, batch_size)?;
    println!("{}", format!("{} on {}", model.name(), split).as_str().cyan().bold());
    println!("{}", metrics.report());

    let results_path = model_dir.join("eval_results.json");
    fs::write(&results_path, serde_json::to_string_pretty(&metrics)?)?;
    info!("Wrote {:?}", results_path);
    Ok(())
}

fn cmd_models() {
    let registry = ModelRegistry::default();
    println!("{}", "Registered models:".cyan());
    for spec in registry.specs() {
        println!("  {:<14} {}", spec.key, spec.kind.display_name());
    }
}
