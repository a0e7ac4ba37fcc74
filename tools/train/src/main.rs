//! Training CLI Tool
//!
//! Ingests the sorted train/test tree, builds the DenseNet transfer-learning
//! classifier, trains it with per-epoch validation metrics and saves the
//! result next to its configuration and training history.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    module::{AutodiffModule, Module},
    record::CompactRecorder,
};
use chrono::Local;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use xray_core::{
    backend_name, default_device, load_toml_config, setup_logging, DefaultBackend, TrainingBackend,
    TrainingConfig,
};
use xray_dataset::DataIngestion;
use xray_training::{
    EpochCallback, Evaluator, MetricCallback, ModelBuilder, SummaryWriter, Trainer,
    TransferClassifier,
};

/// Chest X-ray Pneumonia Classification Training Tool
#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train the chest X-ray pneumonia classifier",
    long_about = "Train a DenseNet transfer-learning classifier on a sorted chest X-ray \
                  tree. Everything not given on the command line comes from the TOML \
                  configuration."
)]
struct Args {
    /// Path to training configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Override output directory of the trained model
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Validate configuration without training
    #[arg(long)]
    dry_run: bool,
}

/// Advances a progress bar once per epoch
struct ProgressCallback {
    bar: ProgressBar,
}

impl ProgressCallback {
    fn new(num_epochs: usize) -> Result<Self> {
        let bar = ProgressBar::new(num_epochs as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} epochs ({eta})")?
                .progress_chars("=>-"),
        );
        Ok(Self { bar })
    }
}

impl EpochCallback<TrainingBackend> for ProgressCallback {
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        _model: &TransferClassifier<DefaultBackend>,
    ) -> xray_core::Result<()> {
        self.bar.set_position(epoch as u64 + 1);
        Ok(())
    }
}

fn load_config(args: &Args) -> Result<TrainingConfig> {
    let mut config: TrainingConfig = load_toml_config(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    apply_overrides(&mut config, args);
    Ok(config)
}

fn apply_overrides(config: &mut TrainingConfig, args: &Args) {
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(ref output) = args.output {
        config.training.output_dir = output.clone();
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
}

fn print_config_summary(config: &TrainingConfig) {
    info!("Configuration Summary:");
    info!("  Backend: {}", backend_name());
    info!("  Backbone: {}", config.model.backbone);
    info!("  Pretrained: {}", config.model.pretrained);
    info!("  Classes: {}", config.model.num_classes);
    info!("  Epochs: {}", config.training.num_epochs);
    info!("  Batch size: {}", config.data.batch_size);
    info!("  Learning rate: {}", config.model.learning_rate);
    info!("  Validation split: {}", config.data.validation_split);
    info!(
        "  Augmentation: {}",
        if config.model.augmentation.is_some() { "on" } else { "off" }
    );
    info!("  Train dir: {}", config.data.train_dir.display());
    info!("  Test dir: {}", config.data.test_dir.display());
    info!("  Log dir: {}", config.training.log_dir.display());
    info!("  Output dir: {}", config.training.output_dir.display());
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    setup_logging(&config.logging).context("Failed to initialize logging")?;

    info!("Chest X-ray Pneumonia Classification - Training Tool");
    config.validate().context("Invalid configuration")?;
    print_config_summary(&config);

    if args.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    run_training(&config)
}

fn run_training(config: &TrainingConfig) -> Result<()> {
    let device = default_device();
    let run_name = Local::now().format("%Y%m%d_%H%M%S").to_string();

    let data = DataIngestion::new(config.data.clone())
        .initiate_data_ingestion::<TrainingBackend>(&device)
        .context("Failed to load datasets")?;

    let mut builder = ModelBuilder::<TrainingBackend>::new(config.model.clone(), device.clone());
    builder
        .initialise_model()
        .context("Failed to initialise model")?;
    let compiled = builder.into_compiled()?;

    let log_dir = config.training.log_dir.join(&run_name);
    let writer = SummaryWriter::create(&log_dir)
        .with_context(|| format!("Failed to create log dir {}", log_dir.display()))?;
    info!("Writing validation metrics to {}", writer.path().display());

    let metric_callback = MetricCallback::new(
        data.validation.clone(),
        Box::new(writer),
        config.training.metric_set,
        config.model.num_classes,
    );
    let progress = ProgressCallback::new(config.training.num_epochs)?;
    let bar = progress.bar.clone();
    let mut callbacks: Vec<Box<dyn EpochCallback<TrainingBackend>>> =
        vec![Box::new(metric_callback), Box::new(progress)];

    let mut trainer = Trainer::new(config.training.num_epochs);
    let result = trainer.fit(compiled, &data.train, &data.validation, &mut callbacks);
    bar.finish_and_clear();
    let model = result.context("Training failed")?;
    let model = model.valid();

    let report = Evaluator::default()
        .evaluate(&model, &data.test)
        .context("Failed to evaluate on the test set")?;
    info!("Test set results:\n{}", report);

    let artifact = save_artifacts(config, &run_name, &model, &trainer)?;
    info!("Best validation accuracy: {:.2}%", trainer.state().best_val_accuracy * 100.0);
    info!("Model saved to: {}", artifact.display());

    Ok(())
}

/// Saves model weights, the effective configuration and the training history
fn save_artifacts(
    config: &TrainingConfig,
    run_name: &str,
    model: &TransferClassifier<DefaultBackend>,
    trainer: &Trainer,
) -> Result<PathBuf> {
    let output_dir: &Path = &config.training.output_dir;
    std::fs::create_dir_all(output_dir).context("Failed to create output directory")?;

    let model_path = output_dir.join(format!("xray_classifier_{run_name}"));
    model
        .clone()
        .save_file(&model_path, &CompactRecorder::new())
        .map_err(|e| anyhow::anyhow!("Failed to save model: {:?}", e))?;

    let config_path = output_dir.join(format!("xray_classifier_{run_name}.toml"));
    std::fs::write(&config_path, toml::to_string_pretty(config)?)
        .context("Failed to save configuration")?;

    let history_path = output_dir.join(format!("xray_classifier_{run_name}_history.json"));
    std::fs::write(&history_path, serde_json::to_string_pretty(trainer.state())?)
        .context("Failed to save training history")?;

    Ok(model_path)
}
