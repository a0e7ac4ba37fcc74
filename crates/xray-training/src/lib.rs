//! Transfer learning on a frozen DenseNet backbone.
//!
//! [`builder::ModelBuilder`] assembles and compiles the classifier,
//! [`trainer::Trainer`] fits it and [`callback::MetricCallback`] logs
//! validation metrics after every epoch.

pub mod augmentation;
pub mod builder;
pub mod callback;
pub mod densenet;
pub mod evaluator;
pub mod model;
pub mod summary;
pub mod trainer;

pub use augmentation::RandomAugmentation;
pub use builder::{BuilderStage, CompiledModel, ModelBuilder};
pub use callback::{EpochCallback, MetricCallback};
pub use densenet::{DenseNet, DenseNetConfig};
pub use evaluator::Evaluator;
pub use model::TransferClassifier;
pub use summary::{FanoutSink, MemorySink, ScalarSink, SummaryWriter};
pub use trainer::{EpochMetrics, Trainer, TrainingState};
