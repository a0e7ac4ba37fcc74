//! Evaluation of a trained classifier on a sample stream.

use burn::tensor::backend::{AutodiffBackend, Backend};
use tracing::info;
use xray_core::{argmax, ClassificationReport, Error, Result, ResultExt, XrayClass};
use xray_dataset::{SampleStream, XrayBatch};

use crate::model::TransferClassifier;

/// Runs `model` over `batches` and returns the true labels together with the
/// softmax probabilities of every sample, in batch order.
///
/// Stops at the first batch error.
pub fn collect_predictions<B: Backend>(
    model: &TransferClassifier<B>,
    batches: impl IntoIterator<Item = Result<XrayBatch<B>>>,
) -> Result<(Vec<usize>, Vec<Vec<f32>>)> {
    let num_classes = model.num_classes();
    let mut labels = Vec::new();
    let mut probabilities = Vec::new();

    for batch in batches {
        let batch = batch?;
        let probs = model
            .predict(batch.images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Model(format!("failed to read probabilities: {e:?}")))?;
        let targets = batch
            .targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| Error::Model(format!("failed to read targets: {e:?}")))?;

        labels.extend(targets.iter().map(|&t| t as usize));
        probabilities.extend(probs.chunks(num_classes).map(<[f32]>::to_vec));
    }

    Ok((labels, probabilities))
}

/// Produces classification reports for a fixed set of class names
#[derive(Debug, Clone)]
pub struct Evaluator {
    class_names: Vec<String>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(XrayClass::names())
    }
}

impl Evaluator {
    pub fn new(class_names: Vec<String>) -> Self {
        Self { class_names }
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Report of `model` on one pass over `stream`
    pub fn evaluate<B: AutodiffBackend>(
        &self,
        model: &TransferClassifier<B::InnerBackend>,
        stream: &SampleStream<B>,
    ) -> Result<ClassificationReport> {
        self.evaluate_batches(model, stream.iter().map(|batch| batch.map(XrayBatch::inner)))
            .during("evaluate")
    }

    /// Report of `model` on already materialized batches
    pub fn evaluate_batches<B: Backend>(
        &self,
        model: &TransferClassifier<B>,
        batches: impl IntoIterator<Item = Result<XrayBatch<B>>>,
    ) -> Result<ClassificationReport> {
        let (labels, probabilities) = collect_predictions(model, batches)?;
        if labels.is_empty() {
            return Err(Error::Dataset("nothing to evaluate".into()));
        }

        let predictions: Vec<usize> = probabilities.iter().map(|p| argmax(p)).collect();
        let report = ClassificationReport::from_predictions(
            &labels,
            &predictions,
            self.class_names.clone(),
        )?;

        info!(
            "Evaluation: accuracy = {:.2}%, mcc = {:.4}, samples = {}",
            report.accuracy * 100.0,
            report.mcc,
            report.num_samples()
        );
        Ok(report)
    }
}
