//! Inference service: one image in, one identity out.
//!
//! Each request walks `Received → Validated → Normalized → Embedded →
//! Classified → Responded` and stops at the first failing stage with an
//! [`InferenceError`] whose kind tells bad input apart from server faults.
//!
//! The trained classifier is held as `RwLock<Option<Arc<_>>>`. Requests clone
//! the `Arc` once and release the lock, so a concurrent [`publish`] swaps in a
//! new classifier without any request seeing a mix of old and new state.
//!
//! [`publish`]: InferenceService::publish

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::classifier::Classifier;
use crate::extractor::{checked_embed, EmbeddingExtractor};
use crate::normalizer::{detect_format, FaceNormalizer};
use crate::trainer::TrainedClassifier;
use crate::types::Prediction;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Content types admitted when the caller declares one.
pub const ACCEPTED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/jpg", "image/png"];

/// Pipeline stage of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Validated,
    Normalized,
    Embedded,
    Classified,
    Responded,
}

#[derive(Error, Debug)]
pub enum InferenceError {
    /// The caller sent something that is not a usable JPEG/PNG image.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Embedding or classification failed on well-formed input.
    #[error("inference failed: {0}")]
    Inference(String),
    /// No trained classifier is resident.
    #[error("no trained classifier is loaded")]
    ModelUnavailable,
}

impl InferenceError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Inference(_) => "inference",
            Self::ModelUnavailable => "model_unavailable",
        }
    }

    /// True when the request itself was at fault (4xx-equivalent).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Structured error returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Shared, concurrently callable prediction service.
pub struct InferenceService {
    normalizer: FaceNormalizer,
    extractor: Arc<dyn EmbeddingExtractor>,
    classifier: RwLock<Option<Arc<TrainedClassifier>>>,
}

impl InferenceService {
    /// Service with no classifier resident; `predict` fails with
    /// [`InferenceError::ModelUnavailable`] until one is published.
    pub fn new(extractor: Arc<dyn EmbeddingExtractor>) -> Self {
        Self {
            normalizer: FaceNormalizer::for_extractor(extractor.as_ref()),
            extractor,
            classifier: RwLock::new(None),
        }
    }

    /// Load the artifact from `store` and make it resident.
    ///
    /// On failure the currently resident classifier (if any) is kept.
    pub fn load_artifact(&self, store: &ArtifactStore) -> Result<(), ArtifactError> {
        let classifier = store.load()?;
        self.publish(Arc::new(classifier));
        Ok(())
    }

    /// Replace the resident classifier wholesale.
    ///
    /// A classifier fitted on embeddings from a different model than the
    /// resident extractor is still published, with a warning.
    pub fn publish(&self, classifier: Arc<TrainedClassifier>) {
        if let Some((trained_on, serving)) = self.embedding_model_mismatch(&classifier) {
            tracing::warn!(
                run_id = %classifier.metadata.run_id,
                trained_on = %trained_on,
                serving = %serving,
                "classifier was trained on embeddings from a different model"
            );
        }
        tracing::info!(
            run_id = %classifier.metadata.run_id,
            labels = classifier.metadata.label_count,
            "classifier published"
        );
        let mut guard = match self.classifier.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(classifier);
    }

    /// `(trained_on, serving)` model versions when both are known and differ.
    pub fn embedding_model_mismatch(
        &self,
        classifier: &TrainedClassifier,
    ) -> Option<(String, String)> {
        let trained_on = classifier.metadata.embedding_model.as_deref()?;
        let serving = self.extractor.model_version()?;
        (trained_on != serving).then(|| (trained_on.to_string(), serving.to_string()))
    }

    /// Snapshot of the resident classifier.
    pub fn classifier(&self) -> Option<Arc<TrainedClassifier>> {
        let guard = match self.classifier.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.classifier().is_some()
    }

    /// Identify the face in `bytes`.
    ///
    /// `content_type`, when given, must be one of [`ACCEPTED_CONTENT_TYPES`];
    /// the detected container must be JPEG or PNG regardless.
    pub fn predict(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<Prediction, InferenceError> {
        let result = self.run(bytes, content_type);
        if let Err(e) = &result {
            tracing::debug!(kind = e.kind(), error = %e, "request rejected");
        }
        result
    }

    fn run(&self, bytes: &[u8], content_type: Option<&str>) -> Result<Prediction, InferenceError> {
        trace_stage(Stage::Received);

        if let Some(ct) = content_type {
            let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            if !ACCEPTED_CONTENT_TYPES.contains(&essence.as_str()) {
                return Err(InferenceError::InvalidInput(format!(
                    "unsupported content type: {ct}"
                )));
            }
        }
        if bytes.is_empty() {
            return Err(InferenceError::InvalidInput("empty image payload".into()));
        }
        detect_format(bytes).map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
        trace_stage(Stage::Validated);

        let face = self
            .normalizer
            .normalize(bytes)
            .map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
        trace_stage(Stage::Normalized);

        let embedding = checked_embed(self.extractor.as_ref(), &face)
            .map_err(|e| InferenceError::Inference(e.to_string()))?;
        trace_stage(Stage::Embedded);

        let classifier = self.classifier().ok_or(InferenceError::ModelUnavailable)?;
        let prediction = classifier
            .predict(&embedding)
            .map_err(|e| InferenceError::Inference(e.to_string()))?;
        trace_stage(Stage::Classified);

        tracing::debug!(
            identity = %prediction.identity,
            confidence = ?prediction.confidence,
            run_id = %classifier.metadata.run_id,
            "prediction"
        );
        trace_stage(Stage::Responded);
        Ok(prediction)
    }
}

fn trace_stage(stage: Stage) {
    tracing::trace!(?stage, "request stage");
}
