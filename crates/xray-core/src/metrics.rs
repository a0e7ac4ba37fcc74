//! Classification metrics computed from hard labels.
//!
//! Everything here works on integer class indices. Probability outputs are
//! reduced with [`argmax`] first, so the AUC reported per class is the AUC of
//! a one-vs-rest indicator score.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Index of the largest value. Ties resolve to the first index.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

fn check_inputs(labels: &[usize], predictions: &[usize], num_classes: usize) -> Result<()> {
    if labels.len() != predictions.len() {
        return Err(Error::Metric(format!(
            "got {} labels but {} predictions",
            labels.len(),
            predictions.len()
        )));
    }
    if let Some(bad) = labels
        .iter()
        .chain(predictions.iter())
        .find(|&&c| c >= num_classes)
    {
        return Err(Error::Metric(format!(
            "class index {bad} out of range for {num_classes} classes"
        )));
    }
    Ok(())
}

/// Confusion matrix indexed `[actual][predicted]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    matrix: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            matrix: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn from_predictions(
        labels: &[usize],
        predictions: &[usize],
        num_classes: usize,
    ) -> Result<Self> {
        check_inputs(labels, predictions, num_classes)?;
        let mut cm = Self::new(num_classes);
        for (&actual, &predicted) in labels.iter().zip(predictions) {
            cm.matrix[actual][predicted] += 1;
        }
        Ok(cm)
    }

    pub fn num_classes(&self) -> usize {
        self.matrix.len()
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.matrix
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|i| self.matrix[i][i]).sum()
    }

    /// Number of samples whose true class is `class`
    pub fn support(&self, class: usize) -> usize {
        self.matrix[class].iter().sum()
    }

    /// Number of samples predicted as `class`
    pub fn predicted(&self, class: usize) -> usize {
        self.matrix.iter().map(|row| row[class]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Precision of one class; 0 when the class was never predicted.
    pub fn precision(&self, class: usize) -> f64 {
        ratio(self.matrix[class][class], self.predicted(class))
    }

    /// Recall of one class; 0 when the class never occurs.
    pub fn recall(&self, class: usize) -> f64 {
        ratio(self.matrix[class][class], self.support(class))
    }

    pub fn f1(&self, class: usize) -> f64 {
        let p = self.precision(class);
        let r = self.recall(class);
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }

    pub fn per_class_precision(&self) -> Vec<f64> {
        (0..self.num_classes()).map(|c| self.precision(c)).collect()
    }

    pub fn per_class_recall(&self) -> Vec<f64> {
        (0..self.num_classes()).map(|c| self.recall(c)).collect()
    }

    pub fn per_class_f1(&self) -> Vec<f64> {
        (0..self.num_classes()).map(|c| self.f1(c)).collect()
    }

    /// Multiclass Matthews correlation coefficient (Gorodkin's R_K).
    ///
    /// Returns 0 when either marginal distribution is degenerate.
    pub fn mcc(&self) -> f64 {
        let n = self.num_classes();
        let s = self.total() as f64;
        let c = self.correct() as f64;

        let mut pt = 0.0;
        let mut pp = 0.0;
        let mut tt = 0.0;
        for k in 0..n {
            let p = self.predicted(k) as f64;
            let t = self.support(k) as f64;
            pt += p * t;
            pp += p * p;
            tt += t * t;
        }

        let denominator = ((s * s - pp) * (s * s - tt)).sqrt();
        if denominator == 0.0 {
            0.0
        } else {
            (c * s - pt) / denominator
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Matthews correlation coefficient over hard labels.
pub fn matthews_corrcoef(labels: &[usize], predictions: &[usize], num_classes: usize) -> Result<f64> {
    Ok(ConfusionMatrix::from_predictions(labels, predictions, num_classes)?.mcc())
}

/// Area under the ROC curve of a binary problem.
///
/// Computed from average ranks, so tied scores count half. Fails when the
/// truth vector has no positives or no negatives.
pub fn binary_roc_auc(truth: &[bool], scores: &[f64]) -> Result<f64> {
    if truth.len() != scores.len() {
        return Err(Error::Metric(format!(
            "got {} targets but {} scores",
            truth.len(),
            scores.len()
        )));
    }
    let positives = truth.iter().filter(|&&t| t).count();
    let negatives = truth.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(Error::Metric(format!(
            "ROC AUC is undefined with {positives} positive and {negatives} negative samples"
        )));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // Average 1-based rank per tie group
    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = truth
        .iter()
        .zip(&ranks)
        .filter(|(t, _)| **t)
        .map(|(_, r)| *r)
        .sum();
    let p = positives as f64;
    let u = positive_rank_sum - p * (p + 1.0) / 2.0;
    Ok(u / (p * negatives as f64))
}

/// One-vs-rest AUC per class, scoring each sample by whether it was predicted
/// as that class.
pub fn per_class_roc_auc(
    labels: &[usize],
    predictions: &[usize],
    num_classes: usize,
) -> Result<Vec<f64>> {
    check_inputs(labels, predictions, num_classes)?;
    (0..num_classes)
        .map(|class| {
            let truth: Vec<bool> = labels.iter().map(|&l| l == class).collect();
            let scores: Vec<f64> = predictions
                .iter()
                .map(|&p| if p == class { 1.0 } else { 0.0 })
                .collect();
            binary_roc_auc(&truth, &scores)
                .map_err(|e| Error::Metric(format!("class {class}: {e}")))
        })
        .collect()
}

/// Streaming arithmetic mean
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeanMetric {
    total: f64,
    count: usize,
}

impl MeanMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.total = 0.0;
        self.count = 0;
    }

    pub fn update(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    pub fn update_all(&mut self, values: &[f64]) {
        for v in values {
            self.update(*v);
        }
    }

    /// Current mean, 0 before any update.
    pub fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Summary of a model's predictions on a labelled stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub class_names: Vec<String>,
    pub accuracy: f64,
    pub mcc: f64,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub f1: Vec<f64>,
    pub support: Vec<usize>,
    pub confusion_matrix: ConfusionMatrix,
}

impl ClassificationReport {
    pub fn from_predictions(
        labels: &[usize],
        predictions: &[usize],
        class_names: Vec<String>,
    ) -> Result<Self> {
        let cm = ConfusionMatrix::from_predictions(labels, predictions, class_names.len())?;
        Ok(Self {
            accuracy: cm.accuracy(),
            mcc: cm.mcc(),
            precision: cm.per_class_precision(),
            recall: cm.per_class_recall(),
            f1: cm.per_class_f1(),
            support: (0..cm.num_classes()).map(|c| cm.support(c)).collect(),
            confusion_matrix: cm,
            class_names,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.support.iter().sum()
    }

    pub fn macro_precision(&self) -> f64 {
        mean(&self.precision)
    }

    pub fn macro_recall(&self) -> f64 {
        mean(&self.recall)
    }

    pub fn macro_f1(&self) -> f64 {
        mean(&self.f1)
    }
}

fn mean(values: &[f64]) -> f64 {
    let mut m = MeanMetric::new();
    m.update_all(values);
    m.result()
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<12} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for (i, name) in self.class_names.iter().enumerate() {
            writeln!(
                f,
                "{:<12} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name, self.precision[i], self.recall[i], self.f1[i], self.support[i]
            )?;
        }
        writeln!(
            f,
            "{:<12} {:>9.4} {:>9.4} {:>9.4} {:>9}",
            "macro avg",
            self.macro_precision(),
            self.macro_recall(),
            self.macro_f1(),
            self.num_samples()
        )?;
        writeln!(f, "accuracy: {:.4}", self.accuracy)?;
        write!(f, "mcc:      {:.4}", self.mcc)
    }
}
