//! Classifier training over a labeled embedding set.

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::classifier::{Classifier, SoftmaxClassifier, SoftmaxParams};
use crate::dataset::{DatasetBuilder, DatasetError, SkippedImage};
use crate::extractor::EmbeddingExtractor;
use crate::types::{DimensionMismatch, Embedding, LabeledEmbeddingSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const ALGORITHM: &str = "softmax-regression";

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("insufficient training data: {0}")]
    InsufficientData(String),
    #[error("invalid training parameters: {0}")]
    InvalidParams(String),
    #[error("training diverged: {0}")]
    Diverged(String),
    #[error("dataset: {0}")]
    Dataset(#[from] DatasetError),
    #[error("artifact: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Training hyper-parameters.
pub type TrainingParams = SoftmaxParams;

/// Facts recorded about one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    pub run_id: uuid::Uuid,
    /// RFC 3339 timestamp.
    pub trained_at: String,
    pub algorithm: String,
    pub params: TrainingParams,
    pub sample_count: usize,
    pub label_count: usize,
    pub dimension: usize,
    pub final_loss: f32,
    /// Model version of the embeddings the classifier was fitted on.
    pub embedding_model: Option<String>,
}

/// A fitted classifier together with its training metadata. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedClassifier {
    pub model: SoftmaxClassifier,
    pub metadata: TrainingMetadata,
}

impl Classifier for TrainedClassifier {
    fn labels(&self) -> &[String] {
        self.model.labels()
    }

    fn dimension(&self) -> usize {
        self.model.dimension()
    }

    fn probabilities(&self, embedding: &Embedding) -> Result<Vec<f32>, DimensionMismatch> {
        self.model.probabilities(embedding)
    }
}

/// Fit a classifier on `set`.
///
/// Rejects empty sets, sets with fewer than two distinct labels and unusable
/// hyper-parameters. A fit that ends with a non-finite loss, weight or bias
/// is an error; no degenerate classifier is ever produced.
pub fn train(
    set: &LabeledEmbeddingSet,
    params: &TrainingParams,
) -> Result<TrainedClassifier, TrainError> {
    params.validate().map_err(TrainError::InvalidParams)?;
    if set.is_empty() {
        return Err(TrainError::InsufficientData("training set is empty".into()));
    }
    let label_count = set.label_counts().len();
    if label_count < 2 {
        return Err(TrainError::InsufficientData(
            "cannot discriminate with fewer than two classes".into(),
        ));
    }

    let (model, final_loss) = SoftmaxClassifier::fit(set, params);
    if !final_loss.is_finite() {
        return Err(TrainError::Diverged(format!("final loss is {final_loss}")));
    }
    model.validate().map_err(TrainError::Diverged)?;

    let metadata = TrainingMetadata {
        run_id: uuid::Uuid::new_v4(),
        trained_at: chrono::Utc::now().to_rfc3339(),
        algorithm: ALGORITHM.to_string(),
        params: params.clone(),
        sample_count: set.len(),
        label_count,
        dimension: model.dimension(),
        final_loss,
        embedding_model: set
            .samples()
            .first()
            .and_then(|s| s.embedding.model_version.clone()),
    };

    tracing::info!(
        run_id = %metadata.run_id,
        algorithm = ALGORITHM,
        samples = metadata.sample_count,
        labels = metadata.label_count,
        dimension = metadata.dimension,
        learning_rate = params.learning_rate,
        epochs = params.epochs,
        l2 = params.l2,
        final_loss,
        "classifier trained"
    );

    Ok(TrainedClassifier { model, metadata })
}

/// Outcome of [`train_from_directory`].
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub artifact: PathBuf,
    pub run_id: uuid::Uuid,
    pub sample_count: usize,
    pub label_count: usize,
    pub skipped: Vec<SkippedImage>,
}

/// Build a dataset from `root`, train on it and persist the result.
///
/// Nothing is written unless training succeeds.
pub fn train_from_directory(
    root: &Path,
    extractor: &dyn EmbeddingExtractor,
    params: &TrainingParams,
    store: &ArtifactStore,
) -> Result<TrainingSummary, TrainError> {
    let build = DatasetBuilder::new(extractor).build(root)?;
    let trained = train(&build.set, params)?;
    let artifact = store.persist(&trained)?;

    Ok(TrainingSummary {
        artifact,
        run_id: trained.metadata.run_id,
        sample_count: trained.metadata.sample_count,
        label_count: trained.metadata.label_count,
        skipped: build.skipped,
    })
}
