//! Embedding → identity classification.
//!
//! [`Classifier`] is the capability boundary used by inference and
//! evaluation. [`SoftmaxClassifier`] is the shipped implementation: a linear
//! multinomial logistic regression fitted by full-batch gradient descent.

use crate::types::{DimensionMismatch, Embedding, LabeledEmbeddingSet, Prediction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps an embedding to a single best label, with per-label probabilities.
pub trait Classifier: Send + Sync {
    /// Known labels, sorted. Index `i` of [`probabilities`](Self::probabilities)
    /// is the probability of `labels()[i]`.
    fn labels(&self) -> &[String];

    /// Dimensionality of accepted embeddings.
    fn dimension(&self) -> usize;

    /// Probability per label, aligned with [`labels`](Self::labels).
    fn probabilities(&self, embedding: &Embedding) -> Result<Vec<f32>, DimensionMismatch>;

    /// Best label and its probability.
    fn predict(&self, embedding: &Embedding) -> Result<Prediction, DimensionMismatch> {
        let probs = self.probabilities(embedding)?;
        let mut best = 0;
        for (i, p) in probs.iter().enumerate() {
            if *p > probs[best] {
                best = i;
            }
        }
        Ok(Prediction {
            identity: self.labels()[best].clone(),
            confidence: Some(probs[best]),
        })
    }
}

/// Gradient descent hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxParams {
    pub learning_rate: f32,
    pub epochs: usize,
    /// L2 penalty on weights (not biases).
    pub l2: f32,
}

impl Default for SoftmaxParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            epochs: 300,
            l2: 1e-4,
        }
    }
}

impl SoftmaxParams {
    /// Reject settings gradient descent cannot make progress with.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(format!(
                "learning_rate must be finite and positive, got {}",
                self.learning_rate
            ));
        }
        if self.epochs == 0 {
            return Err("epochs must be at least 1".into());
        }
        if !(self.l2.is_finite() && self.l2 >= 0.0) {
            return Err(format!("l2 must be finite and non-negative, got {}", self.l2));
        }
        Ok(())
    }
}

/// Linear softmax model: `p = softmax(W x + b)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxClassifier {
    labels: Vec<String>,
    dimension: usize,
    /// Row-major `labels.len() × dimension`.
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl SoftmaxClassifier {
    /// Fit on `set`. Returns the model and the final mean cross-entropy.
    ///
    /// Deterministic: weights start at zero and every epoch sees the whole set
    /// in order. Callers check that the set is non-empty with ≥2 labels.
    pub fn fit(set: &LabeledEmbeddingSet, params: &SoftmaxParams) -> (Self, f32) {
        let labels = set.labels();
        let k = labels.len();
        let d = set.dimension().unwrap_or(0);
        let n = set.len().max(1) as f32;

        let index: BTreeMap<&str, usize> = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();
        let targets: Vec<usize> = set.iter().map(|s| index[s.label.as_str()]).collect();

        let mut model = Self {
            dimension: d,
            weights: vec![0.0; k * d],
            biases: vec![0.0; k],
            labels,
        };

        let mut grad_w = vec![0.0f32; k * d];
        let mut grad_b = vec![0.0f32; k];
        let mut loss = 0.0f32;

        for _ in 0..params.epochs {
            grad_w.iter_mut().for_each(|g| *g = 0.0);
            grad_b.iter_mut().for_each(|g| *g = 0.0);
            loss = 0.0;

            for (sample, &target) in set.iter().zip(&targets) {
                let x = &sample.embedding.values;
                let probs = model.softmax(x);
                loss -= probs[target].max(f32::MIN_POSITIVE).ln();

                for (c, p) in probs.iter().enumerate() {
                    let err = p - if c == target { 1.0 } else { 0.0 };
                    grad_b[c] += err;
                    let row = &mut grad_w[c * d..(c + 1) * d];
                    for (g, xi) in row.iter_mut().zip(x) {
                        *g += err * xi;
                    }
                }
            }

            for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                *w -= params.learning_rate * (g / n + params.l2 * *w);
            }
            for (b, g) in model.biases.iter_mut().zip(&grad_b) {
                *b -= params.learning_rate * g / n;
            }
        }

        (model, loss / n)
    }

    /// Check the shape and values of a model, e.g. one read back from disk.
    ///
    /// Requires at least two distinct sorted labels, a non-zero dimension,
    /// `weights`/`biases` sized to match, and finite values throughout.
    pub fn validate(&self) -> Result<(), String> {
        let k = self.labels.len();
        if k < 2 {
            return Err(format!("expected at least two labels, found {k}"));
        }
        if self.labels.windows(2).any(|w| w[0] >= w[1]) {
            return Err("labels must be unique and sorted".into());
        }
        if self.dimension == 0 {
            return Err("dimension must be non-zero".into());
        }
        if self.weights.len() != k * self.dimension {
            return Err(format!(
                "weights hold {} values, expected {} ({k} labels x {} dimensions)",
                self.weights.len(),
                k * self.dimension,
                self.dimension
            ));
        }
        if self.biases.len() != k {
            return Err(format!("biases hold {} values, expected {k}", self.biases.len()));
        }
        if !self.weights.iter().chain(&self.biases).all(|v| v.is_finite()) {
            return Err("non-finite weight or bias".into());
        }
        Ok(())
    }

    fn softmax(&self, x: &[f32]) -> Vec<f32> {
        let d = self.dimension;
        let mut logits: Vec<f32> = self
            .biases
            .iter()
            .enumerate()
            .map(|(c, b)| {
                let row = &self.weights[c * d..(c + 1) * d];
                b + row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f32>()
            })
            .collect();

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for l in &mut logits {
            *l = (*l - max).exp();
            sum += *l;
        }
        for l in &mut logits {
            *l /= sum;
        }
        logits
    }
}

impl Classifier for SoftmaxClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn probabilities(&self, embedding: &Embedding) -> Result<Vec<f32>, DimensionMismatch> {
        if embedding.dimension() != self.dimension {
            return Err(DimensionMismatch {
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }
        Ok(self.softmax(&embedding.values))
    }
}

/// Accuracy of a classifier over a labeled set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    pub total: usize,
    pub correct: usize,
    pub accuracy: f32,
    /// label → (correct, total)
    pub per_label: BTreeMap<String, (usize, usize)>,
}

/// Score `classifier` against every sample of `set`.
///
/// Samples whose dimension does not match the classifier count as wrong.
pub fn evaluate(classifier: &dyn Classifier, set: &LabeledEmbeddingSet) -> EvaluationReport {
    let mut report = EvaluationReport::default();
    for sample in set.iter() {
        let hit = classifier
            .predict(&sample.embedding)
            .map(|p| p.identity == sample.label)
            .unwrap_or(false);
        let entry = report.per_label.entry(sample.label.clone()).or_insert((0, 0));
        entry.1 += 1;
        report.total += 1;
        if hit {
            entry.0 += 1;
            report.correct += 1;
        }
    }
    if report.total > 0 {
        report.accuracy = report.correct as f32 / report.total as f32;
    }
    report
}
