//! Epoch-end hooks of the training loop.
//!
//! [`MetricCallback`] recomputes macro classification metrics on the whole
//! validation stream after every epoch and writes them to a [`ScalarSink`].
//! Nothing is carried between epochs: each aggregator is reset before use.

use burn::tensor::backend::AutodiffBackend;
use tracing::debug;
use xray_core::{
    argmax, matthews_corrcoef, per_class_roc_auc, ConfusionMatrix, MeanMetric, MetricName,
    MetricSet, Result, ScalarRecord,
};
use xray_dataset::{SampleStream, XrayBatch};

use crate::evaluator::collect_predictions;
use crate::model::TransferClassifier;
use crate::summary::ScalarSink;

/// Hook run by [`Trainer::fit`](crate::trainer::Trainer::fit) after each epoch
pub trait EpochCallback<B: AutodiffBackend> {
    /// `epoch` is zero-based. `model` is the inference view of the model
    /// being trained.
    fn on_epoch_end(&mut self, epoch: usize, model: &TransferClassifier<B::InnerBackend>)
        -> Result<()>;
}

/// Writes MCC, AUC, F1, recall and precision of the validation stream
pub struct MetricCallback<B: AutodiffBackend> {
    validation: SampleStream<B>,
    sink: Box<dyn ScalarSink>,
    metric_set: MetricSet,
    num_classes: usize,
    epoch: usize,
    mcc: MeanMetric,
    aucroc: MeanMetric,
    recall: MeanMetric,
    fmeasure: MeanMetric,
    precision: MeanMetric,
}

impl<B: AutodiffBackend> MetricCallback<B> {
    pub fn new(
        validation: SampleStream<B>,
        sink: Box<dyn ScalarSink>,
        metric_set: MetricSet,
        num_classes: usize,
    ) -> Self {
        Self {
            validation,
            sink,
            metric_set,
            num_classes,
            epoch: 0,
            mcc: MeanMetric::new(),
            aucroc: MeanMetric::new(),
            recall: MeanMetric::new(),
            fmeasure: MeanMetric::new(),
            precision: MeanMetric::new(),
        }
    }

    /// Epochs seen so far
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Computes and writes the scalars of one epoch from true labels and
    /// per-sample class probabilities.
    pub fn record(&mut self, labels: &[usize], probabilities: &[Vec<f32>]) -> Result<Vec<ScalarRecord>> {
        self.epoch += 1;
        let predictions: Vec<usize> = probabilities.iter().map(|p| argmax(p)).collect();

        self.mcc.reset();
        self.aucroc.reset();
        self.recall.reset();
        self.fmeasure.reset();
        self.precision.reset();

        let cm = ConfusionMatrix::from_predictions(labels, &predictions, self.num_classes)?;
        self.mcc
            .update(matthews_corrcoef(labels, &predictions, self.num_classes)?);
        self.aucroc
            .update_all(&per_class_roc_auc(labels, &predictions, self.num_classes)?);
        self.recall.update_all(&cm.per_class_recall());
        self.fmeasure.update_all(&cm.per_class_f1());
        self.precision.update_all(&cm.per_class_precision());

        let records: Vec<ScalarRecord> = self
            .metric_set
            .metrics()
            .iter()
            .map(|&metric| ScalarRecord::new(metric.as_str(), self.value(metric), self.epoch))
            .collect();

        for record in &records {
            self.sink
                .write_scalar(&record.name, record.value, record.step)?;
        }
        self.sink.flush()?;

        debug!(
            epoch = self.epoch,
            mcc = self.mcc.result(),
            aucroc = self.aucroc.result(),
            "validation metrics written"
        );
        Ok(records)
    }

    fn value(&self, metric: MetricName) -> f64 {
        match metric {
            MetricName::Mcc => self.mcc.result(),
            MetricName::AucRoc => self.aucroc.result(),
            MetricName::Recall => self.recall.result(),
            MetricName::FMeasure => self.fmeasure.result(),
            MetricName::Precision => self.precision.result(),
        }
    }
}

impl<B: AutodiffBackend> EpochCallback<B> for MetricCallback<B> {
    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        model: &TransferClassifier<B::InnerBackend>,
    ) -> Result<()> {
        let (labels, probabilities) =
            collect_predictions(model, self.validation.iter().map(|batch| batch.map(XrayBatch::inner)))?;
        self.record(&labels, &probabilities)?;
        Ok(())
    }
}
