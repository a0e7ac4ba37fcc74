//! Epoch loop for a compiled classifier.
//!
//! Each epoch runs the shuffled training stream through `forward_train`
//! (augmentation active, frozen backbone), applies one Adam step per batch,
//! measures loss and accuracy on the validation stream with the inference
//! view of the model and finally hands that view to every [`EpochCallback`].

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xray_core::{argmax, Error, Result, ResultExt};
use xray_dataset::SampleStream;

use crate::builder::CompiledModel;
use crate::callback::EpochCallback;
use crate::model::TransferClassifier;

/// Augmentation seed used when the compiled model does not carry one
pub const DEFAULT_SEED: u64 = 42;

/// Losses and accuracies of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Zero-based epoch index
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    /// `None` when the validation stream is empty
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

/// Training history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    pub history: Vec<EpochMetrics>,
    pub best_val_accuracy: f64,
    pub samples_seen: usize,
}

impl TrainingState {
    /// Appends an epoch and returns whether it improved validation accuracy
    pub fn record(&mut self, metrics: EpochMetrics) -> bool {
        let improved = metrics
            .val_accuracy
            .is_some_and(|acc| acc > self.best_val_accuracy);
        if let Some(acc) = metrics.val_accuracy.filter(|_| improved) {
            self.best_val_accuracy = acc;
        }
        self.history.push(metrics);
        improved
    }

    pub fn epochs(&self) -> usize {
        self.history.len()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.history.last()
    }
}

/// Running loss and accuracy over a sequence of batches
#[derive(Debug, Default)]
struct Accumulator {
    loss_sum: f64,
    batches: usize,
    correct: usize,
    total: usize,
}

impl Accumulator {
    fn add(&mut self, loss: f64, correct: usize, total: usize) {
        self.loss_sum += loss;
        self.batches += 1;
        self.correct += correct;
        self.total += total;
    }

    fn loss(&self) -> Option<f64> {
        (self.batches > 0).then(|| self.loss_sum / self.batches as f64)
    }

    fn accuracy(&self) -> Option<f64> {
        (self.total > 0).then(|| self.correct as f64 / self.total as f64)
    }
}

/// Number of rows of `logits` whose arg-max equals the target
fn correct_predictions<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Result<usize> {
    let [_, num_classes] = logits.dims();
    let scores = logits
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Model(format!("failed to read logits: {e:?}")))?;
    let targets = targets
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| Error::Model(format!("failed to read targets: {e:?}")))?;

    Ok(scores
        .chunks(num_classes)
        .zip(targets)
        .filter(|(row, target)| argmax(row) as i64 == *target)
        .count())
}

/// Trains a [`CompiledModel`] for a fixed number of epochs
#[derive(Debug, Clone)]
pub struct Trainer {
    num_epochs: usize,
    state: TrainingState,
}

impl Trainer {
    pub fn new(num_epochs: usize) -> Self {
        Self {
            num_epochs,
            state: TrainingState::default(),
        }
    }

    pub fn num_epochs(&self) -> usize {
        self.num_epochs
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Trains and returns the updated model.
    ///
    /// Callback errors abort training and are returned as raised.
    pub fn fit<B: AutodiffBackend>(
        &mut self,
        compiled: CompiledModel<B>,
        train: &SampleStream<B>,
        validation: &SampleStream<B>,
        callbacks: &mut [Box<dyn EpochCallback<B>>],
    ) -> Result<TransferClassifier<B>> {
        if train.is_empty() {
            return Err(Error::during(
                "fit",
                Error::Dataset("training stream is empty".into()),
            ));
        }

        let CompiledModel {
            mut model,
            optimizer,
            learning_rate,
            loss,
            augmentation_seed,
            ..
        } = compiled;
        let mut optimizer = optimizer.init::<B, TransferClassifier<B>>();
        let mut rng = ChaCha8Rng::seed_from_u64(augmentation_seed.unwrap_or(DEFAULT_SEED));

        info!(
            "Training for {} epochs: {} train / {} validation samples, lr {}",
            self.num_epochs,
            train.len(),
            validation.len(),
            learning_rate
        );

        for epoch in 0..self.num_epochs {
            let mut train_acc = Accumulator::default();
            for batch in train.iter() {
                let batch = batch.during("fit")?;
                let batch_size = batch.targets.dims()[0];
                let logits = model.forward_train(batch.images, &mut rng);
                let batch_loss = loss
                    .init(&logits.device())
                    .forward(logits.clone(), batch.targets.clone());

                let loss_value: f64 = batch_loss.clone().into_scalar().elem();
                let correct =
                    correct_predictions(logits.inner(), batch.targets.inner()).during("fit")?;
                train_acc.add(loss_value, correct, batch_size);

                let grads = GradientsParams::from_grads(batch_loss.backward(), &model);
                model = optimizer.step(learning_rate, model, grads);
                debug!("epoch {} batch {}: loss {:.4}", epoch + 1, train_acc.batches, loss_value);
            }
            self.state.samples_seen += train_acc.total;

            let valid_model = model.valid();
            let mut val_acc = Accumulator::default();
            for batch in validation.iter() {
                let batch = batch.during("fit")?.inner();
                let batch_size = batch.targets.dims()[0];
                let logits = valid_model.forward(batch.images);
                let batch_loss = loss
                    .init(&logits.device())
                    .forward(logits.clone(), batch.targets.clone());

                let loss_value: f64 = batch_loss.into_scalar().elem();
                let correct = correct_predictions(logits, batch.targets).during("fit")?;
                val_acc.add(loss_value, correct, batch_size);
            }

            let metrics = EpochMetrics {
                epoch,
                train_loss: train_acc.loss().unwrap_or(0.0),
                train_accuracy: train_acc.accuracy().unwrap_or(0.0),
                val_loss: val_acc.loss(),
                val_accuracy: val_acc.accuracy(),
            };
            info!(
                "Epoch {}/{}: loss = {:.4}, acc = {:.2}%, val_loss = {}, val_acc = {}",
                epoch + 1,
                self.num_epochs,
                metrics.train_loss,
                metrics.train_accuracy * 100.0,
                metrics
                    .val_loss
                    .map_or_else(|| "n/a".to_string(), |l| format!("{l:.4}")),
                metrics
                    .val_accuracy
                    .map_or_else(|| "n/a".to_string(), |a| format!("{:.2}%", a * 100.0)),
            );
            if self.state.record(metrics) {
                debug!("New best validation accuracy: {:.4}", self.state.best_val_accuracy);
            }

            for callback in callbacks.iter_mut() {
                callback.on_epoch_end(epoch, &valid_model)?;
            }
        }

        Ok(model)
    }
}
