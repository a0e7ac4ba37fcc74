//! Configuration structures for the chest X-ray pipeline.
//!
//! Every struct has defaults matching the reference training run, so a TOML
//! file only needs to mention what it changes.

use crate::types::ImageDimensions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration of the on-disk sorting pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    /// Raw dataset dump to normalize
    pub image_dir: PathBuf,
    /// Destination of the train/test split
    pub output_dir: PathBuf,
    /// Fraction of each class moved into the training split
    pub train_ratio: f64,
    /// Seed of the split shuffle
    pub seed: u64,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("chest_xray"),
            output_dir: PathBuf::from("artifacts"),
            train_ratio: 0.8,
            seed: 42,
        }
    }
}

impl SorterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.train_ratio) {
            return Err(Error::Config(format!(
                "train_ratio must be within [0, 1], got {}",
                self.train_ratio
            )));
        }
        if self.image_dir == self.output_dir {
            return Err(Error::Config(
                "output_dir must differ from image_dir".to_string(),
            ));
        }
        Ok(())
    }
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding the `train` class folders
    pub train_dir: PathBuf,
    /// Directory holding the `test` class folders
    pub test_dir: PathBuf,
    /// Image dimensions after resizing
    pub image_size: ImageDimensions,
    /// Batch size
    pub batch_size: usize,
    /// Fraction of the training directory held out for validation
    pub validation_split: f64,
    /// Shuffle seed
    pub seed: u64,
    /// Prefetch workers per stream
    pub num_workers: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("images/train"),
            test_dir: PathBuf::from("images/test"),
            image_size: ImageDimensions::imagenet(),
            batch_size: 32,
            validation_split: 0.2,
            seed: 42,
            num_workers: 1,
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(Error::Config(format!(
                "validation_split must be within [0, 1), got {}",
                self.validation_split
            )));
        }
        if self.image_size.channels != 3 {
            return Err(Error::Config("images are loaded as RGB, channels must be 3".into()));
        }
        Ok(())
    }
}

/// Pretrained backbone variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    DenseNet121,
    DenseNet169,
    DenseNet201,
}

impl std::fmt::Display for Backbone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backbone::DenseNet121 => write!(f, "densenet121"),
            Backbone::DenseNet169 => write!(f, "densenet169"),
            Backbone::DenseNet201 => write!(f, "densenet201"),
        }
    }
}

/// Randomized input perturbations applied during training
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Contrast factor range around the per-image mean
    pub contrast_range: (f32, f32),
    /// Brightness offset range, as a fraction of the 0-255 pixel range
    pub brightness_range: (f32, f32),
    /// Probability of a quarter-turn rotation
    pub rotation_probability: f64,
    /// Seed of the perturbation generator
    pub seed: u64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            contrast_range: (0.9, 1.1),
            brightness_range: (-0.1, 0.1),
            rotation_probability: 0.25,
            seed: 42,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Backbone architecture
    pub backbone: Backbone,
    /// Number of output classes
    pub num_classes: usize,
    /// Whether to load pretrained backbone weights
    pub pretrained: bool,
    /// Burn record holding the pretrained backbone weights
    pub pretrained_path: Option<PathBuf>,
    /// Dropout rate before the classification layer
    pub dropout: f64,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Optional augmentation stage
    pub augmentation: Option<AugmentationConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: Backbone::DenseNet169,
            num_classes: crate::types::NUM_CLASSES,
            pretrained: true,
            pretrained_path: Some(PathBuf::from("weights/densenet169_imagenet")),
            dropout: 0.2,
            learning_rate: 1e-4,
            augmentation: None,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Config("num_classes must be greater than 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must be within [0, 1), got {}",
                self.dropout
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::Config("learning_rate must be positive".into()));
        }
        if self.pretrained && self.pretrained_path.is_none() {
            return Err(Error::Config(
                "pretrained backbone requested without pretrained_path".into(),
            ));
        }
        Ok(())
    }
}

/// Which scalars the metric callback writes each epoch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricSet {
    /// mcc, aucroc, fmeasure
    Core,
    /// mcc, aucroc, recall, fmeasure, precision
    #[default]
    Full,
}

/// One scalar written by the metric callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricName {
    Mcc,
    AucRoc,
    Recall,
    FMeasure,
    Precision,
}

impl MetricName {
    /// Scalar tag in the summary log
    pub fn as_str(self) -> &'static str {
        match self {
            MetricName::Mcc => "mcc",
            MetricName::AucRoc => "aucroc",
            MetricName::Recall => "recall",
            MetricName::FMeasure => "fmeasure",
            MetricName::Precision => "precision",
        }
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MetricSet {
    /// Scalars in write order
    pub fn metrics(self) -> &'static [MetricName] {
        use MetricName::*;
        match self {
            MetricSet::Core => &[Mcc, AucRoc, FMeasure],
            MetricSet::Full => &[Mcc, AucRoc, Recall, FMeasure, Precision],
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of training epochs
    pub num_epochs: usize,
    /// Directory of the scalar summary log
    pub log_dir: PathBuf,
    /// Directory of the saved model
    pub output_dir: PathBuf,
    /// Scalars written by the metric callback
    pub metric_set: MetricSet,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            log_dir: PathBuf::from("logs"),
            output_dir: PathBuf::from("models"),
            metric_set: MetricSet::Full,
        }
    }
}

/// Logging configuration, set explicitly instead of through the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level for the pipeline crates
    pub level: String,
    /// Level applied to the Burn framework crates
    pub framework_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            framework_level: "warn".to_string(),
        }
    }
}

impl LogConfig {
    pub fn verbose() -> Self {
        Self {
            level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    pub fn directive(&self) -> String {
        format!(
            "{},burn={fw},burn_train={fw},burn_core={fw},cubecl={fw},wgpu_core={fw}",
            self.level,
            fw = self.framework_level
        )
    }
}

/// Main configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrainingConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingParams,
    pub logging: LogConfig,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.model.validate()?;
        if self.training.num_epochs == 0 {
            return Err(Error::Config("num_epochs must be greater than 0".into()));
        }
        Ok(())
    }
}
