//! Staged construction of the transfer-learning classifier.
//!
//! Stages run strictly in order:
//!
//! ```text
//! Uninitialized -> create_base_model -> BaseLoaded
//!               -> build_model       -> Built
//!               -> compile_model     -> Compiled
//! ```
//!
//! Calling a step from any other stage is a [`Error::Model`] wrapped with the
//! step's name, and leaves the builder where it was.

use burn::{
    module::Module,
    nn::loss::CrossEntropyLossConfig,
    optim::AdamConfig,
    tensor::backend::AutodiffBackend,
};
use tracing::info;
use xray_core::{Error, ModelConfig, Result, ResultExt};

use crate::augmentation::RandomAugmentation;
use crate::densenet::{DenseNet, DenseNetConfig};
use crate::model::TransferClassifier;

/// Metrics tracked during compiled training
pub const COMPILED_METRICS: [&str; 1] = ["accuracy"];

/// Publicly visible builder stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderStage {
    Uninitialized,
    BaseLoaded,
    Built,
    Compiled,
}

impl std::fmt::Display for BuilderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuilderStage::Uninitialized => write!(f, "uninitialized"),
            BuilderStage::BaseLoaded => write!(f, "base loaded"),
            BuilderStage::Built => write!(f, "built"),
            BuilderStage::Compiled => write!(f, "compiled"),
        }
    }
}

/// A classifier with its training setup attached
#[derive(Debug, Clone)]
pub struct CompiledModel<B: AutodiffBackend> {
    pub model: TransferClassifier<B>,
    pub optimizer: AdamConfig,
    pub learning_rate: f64,
    pub loss: CrossEntropyLossConfig,
    pub metrics: Vec<String>,
    /// Seed of the augmentation generator, when the stage is present
    pub augmentation_seed: Option<u64>,
}

enum Stage<B: AutodiffBackend> {
    Uninitialized,
    BaseLoaded(DenseNet<B>),
    Built(TransferClassifier<B>),
    Compiled(CompiledModel<B>),
}

impl<B: AutodiffBackend> Stage<B> {
    fn kind(&self) -> BuilderStage {
        match self {
            Stage::Uninitialized => BuilderStage::Uninitialized,
            Stage::BaseLoaded(_) => BuilderStage::BaseLoaded,
            Stage::Built(_) => BuilderStage::Built,
            Stage::Compiled(_) => BuilderStage::Compiled,
        }
    }
}

/// Builds a [`CompiledModel`] from a [`ModelConfig`]
pub struct ModelBuilder<B: AutodiffBackend> {
    config: ModelConfig,
    backbone_config: DenseNetConfig,
    device: B::Device,
    stage: Stage<B>,
}

impl<B: AutodiffBackend> ModelBuilder<B> {
    pub fn new(config: ModelConfig, device: B::Device) -> Self {
        let backbone_config = DenseNetConfig::for_backbone(config.backbone);
        Self {
            config,
            backbone_config,
            device,
            stage: Stage::Uninitialized,
        }
    }

    /// Overrides the backbone layout derived from the model configuration
    pub fn with_backbone_config(mut self, backbone_config: DenseNetConfig) -> Self {
        self.backbone_config = backbone_config;
        self
    }

    pub fn stage(&self) -> BuilderStage {
        self.stage.kind()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn expect_stage(&self, expected: BuilderStage) -> Result<()> {
        let current = self.stage.kind();
        if current == expected {
            Ok(())
        } else {
            Err(Error::Model(format!(
                "builder is {current}, expected {expected}"
            )))
        }
    }

    /// Instantiates the backbone, loads pretrained weights if configured and
    /// freezes every parameter.
    pub fn create_base_model(&mut self) -> Result<()> {
        self.try_create_base_model().during("create_base_model")
    }

    fn try_create_base_model(&mut self) -> Result<()> {
        self.expect_stage(BuilderStage::Uninitialized)?;

        let mut backbone = self.backbone_config.init::<B>(&self.device);
        if self.config.pretrained {
            let path = self.config.pretrained_path.as_ref().ok_or_else(|| {
                Error::Config("pretrained backbone requested without pretrained_path".into())
            })?;
            backbone = backbone.load_pretrained(path, &self.device)?;
            info!("Loaded pretrained {} weights from {}", self.config.backbone, path.display());
        } else {
            info!("Instantiated {} with random weights", self.config.backbone);
        }

        let backbone = backbone.no_grad();
        info!(
            "Froze {} backbone parameters",
            backbone.num_params()
        );

        self.stage = Stage::BaseLoaded(backbone);
        Ok(())
    }

    /// Composes augmentation, normalization, backbone, pooling, dropout and
    /// the dense classification layer.
    pub fn build_model(&mut self) -> Result<()> {
        self.try_build_model().during("build_model")
    }

    fn try_build_model(&mut self) -> Result<()> {
        self.expect_stage(BuilderStage::BaseLoaded)?;
        let Stage::BaseLoaded(backbone) = std::mem::replace(&mut self.stage, Stage::Uninitialized)
        else {
            return Err(Error::Model("base model missing".into()));
        };

        let augmentation = self.config.augmentation.as_ref().map(RandomAugmentation::new);
        if augmentation.is_some() {
            info!("Instantiated augmentation stage");
        }

        let model = TransferClassifier::new(
            backbone,
            augmentation,
            self.config.dropout,
            self.config.num_classes,
            &self.device,
        );
        info!(
            "Built classifier: dropout {}, {} classes, {} trainable parameters",
            self.config.dropout,
            self.config.num_classes,
            model.trainable_params()
        );

        self.stage = Stage::Built(model);
        Ok(())
    }

    /// Attaches Adam, sparse categorical cross-entropy and accuracy tracking.
    pub fn compile_model(&mut self) -> Result<&CompiledModel<B>> {
        self.try_compile_model().during("compile_model")?;
        match &self.stage {
            Stage::Compiled(compiled) => Ok(compiled),
            _ => Err(Error::during(
                "compile_model",
                Error::Model("model was not compiled".into()),
            )),
        }
    }

    fn try_compile_model(&mut self) -> Result<()> {
        self.expect_stage(BuilderStage::Built)?;
        let Stage::Built(model) = std::mem::replace(&mut self.stage, Stage::Uninitialized) else {
            return Err(Error::Model("built model missing".into()));
        };

        let compiled = CompiledModel {
            model,
            optimizer: AdamConfig::new(),
            learning_rate: self.config.learning_rate,
            loss: CrossEntropyLossConfig::new(),
            metrics: COMPILED_METRICS.iter().map(|m| m.to_string()).collect(),
            augmentation_seed: self.config.augmentation.as_ref().map(|a| a.seed),
        };
        info!("Compiled model with Adam (lr {})", compiled.learning_rate);

        self.stage = Stage::Compiled(compiled);
        Ok(())
    }

    /// Runs every remaining stage in order
    pub fn initialise_model(&mut self) -> Result<()> {
        self.create_base_model()?;
        self.build_model()?;
        self.compile_model()?;
        info!("Finished model initialisation");
        Ok(())
    }

    /// The compiled model, if every stage has run
    pub fn compiled(&self) -> Option<&CompiledModel<B>> {
        match &self.stage {
            Stage::Compiled(compiled) => Some(compiled),
            _ => None,
        }
    }

    pub fn into_compiled(self) -> Result<CompiledModel<B>> {
        match self.stage {
            Stage::Compiled(compiled) => Ok(compiled),
            other => Err(Error::during(
                "into_compiled",
                Error::Model(format!("builder is {}, expected compiled", other.kind())),
            )),
        }
    }
}
