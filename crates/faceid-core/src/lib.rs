//! faceid-core: face identification from a single photograph.
//!
//! Faces are resized to a canonical resolution, embedded with a FaceNet-style
//! model via ONNX Runtime, and classified by a linear softmax model trained
//! on a directory of labeled images.

pub mod artifact;
pub mod classifier;
pub mod dataset;
pub mod extractor;
pub mod inference;
pub mod normalizer;
pub mod trainer;
pub mod types;

#[cfg(test)]
mod testing;

pub use artifact::{ArtifactError, ArtifactStore};
pub use classifier::{evaluate, Classifier, EvaluationReport, SoftmaxClassifier, SoftmaxParams};
pub use dataset::{count_images, DatasetBuild, DatasetBuilder, DatasetError, SkippedImage};
pub use extractor::{
    checked_embed, EmbeddingExtractor, ExtractionError, OnnxEmbedder, OnnxModelSpec, TensorLayout,
};
pub use inference::{ErrorBody, InferenceError, InferenceService};
pub use normalizer::{FaceNormalizer, NormalizeError};
pub use trainer::{
    train, train_from_directory, TrainError, TrainedClassifier, TrainingMetadata, TrainingParams,
    TrainingSummary,
};
pub use types::{ChannelOrder, Embedding, LabeledEmbeddingSet, NormalizedFace, Prediction};

use std::path::PathBuf;

/// Per-user data directory: `$XDG_DATA_HOME/faceid`, falling back to
/// `~/.local/share/faceid`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceid")
}

/// Directory searched for ONNX models by default.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
