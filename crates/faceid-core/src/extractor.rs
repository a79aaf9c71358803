//! Embedding extraction boundary and the FaceNet ONNX implementation.
//!
//! Implementations receive an already-normalized face. They do not re-check
//! its resolution; producing the right shape is the caller's job (use
//! [`FaceNormalizer::for_extractor`](crate::FaceNormalizer::for_extractor)).

use crate::types::{ChannelOrder, Embedding, NormalizedFace};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- FaceNet (keras-facenet export) defaults ---
pub const FACENET_INPUT_SIZE: u32 = 160;
pub const FACENET_EMBEDDING_DIM: usize = 512;
const FACENET_MODEL_VERSION: &str = "facenet512";
// Guards prewhitening against flat images: 1 / sqrt(160 * 160 * 3).
const MIN_STD_FLOOR: f32 = 1.0 / 277.128_13;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced non-finite embedding values")]
    InvalidOutput,
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a normalized face to a fixed-length embedding.
///
/// Implementations must be deterministic and must return exactly
/// [`dimension`](Self::dimension) finite values.
pub trait EmbeddingExtractor: Send + Sync {
    /// Side length of the square input face.
    fn input_size(&self) -> u32;

    /// Channel order the model was trained on.
    fn channel_order(&self) -> ChannelOrder;

    /// Length of every returned embedding.
    fn dimension(&self) -> usize;

    /// Identifier stamped on produced embeddings, if the model has one.
    fn model_version(&self) -> Option<&str> {
        None
    }

    fn embed(&self, face: &NormalizedFace) -> Result<Embedding, ExtractionError>;
}

/// Run `extractor` and enforce its output contract.
///
/// Invalid output is surfaced as an error, never repaired.
pub fn checked_embed(
    extractor: &dyn EmbeddingExtractor,
    face: &NormalizedFace,
) -> Result<Embedding, ExtractionError> {
    let embedding = extractor.embed(face)?;
    if embedding.dimension() != extractor.dimension() {
        return Err(ExtractionError::DimensionMismatch {
            expected: extractor.dimension(),
            actual: embedding.dimension(),
        });
    }
    if !embedding.is_finite() {
        return Err(ExtractionError::InvalidOutput);
    }
    Ok(embedding)
}

/// Memory layout of the model's input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, 3, H, W]`
    Nchw,
    /// `[1, H, W, 3]` (Keras exports)
    Nhwc,
}

impl std::str::FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nchw" => Ok(Self::Nchw),
            "nhwc" => Ok(Self::Nhwc),
            other => Err(format!("unknown tensor layout: {other}")),
        }
    }
}

/// Input/output contract of an ONNX embedding model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxModelSpec {
    pub input_size: u32,
    pub embedding_dim: usize,
    pub channel_order: ChannelOrder,
    pub layout: TensorLayout,
    pub model_version: String,
}

impl Default for OnnxModelSpec {
    fn default() -> Self {
        Self {
            input_size: FACENET_INPUT_SIZE,
            embedding_dim: FACENET_EMBEDDING_DIM,
            channel_order: ChannelOrder::Rgb,
            layout: TensorLayout::Nhwc,
            model_version: FACENET_MODEL_VERSION.to_string(),
        }
    }
}

/// FaceNet-style embedder running on ONNX Runtime.
pub struct OnnxEmbedder {
    // `Session::run` needs `&mut`; the lock serializes calls from shared handles.
    session: Mutex<Session>,
    spec: OnnxModelSpec,
}

impl OnnxEmbedder {
    /// Load an ONNX embedding model from the given path.
    pub fn load(model_path: &Path, spec: OnnxModelSpec) -> Result<Self, ExtractionError> {
        if !model_path.exists() {
            return Err(ExtractionError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            input_size = spec.input_size,
            embedding_dim = spec.embedding_dim,
            layout = ?spec.layout,
            "loaded embedding model"
        );

        Ok(Self {
            session: Mutex::new(session),
            spec,
        })
    }

    pub fn spec(&self) -> &OnnxModelSpec {
        &self.spec
    }
}

impl EmbeddingExtractor for OnnxEmbedder {
    fn input_size(&self) -> u32 {
        self.spec.input_size
    }

    fn channel_order(&self) -> ChannelOrder {
        self.spec.channel_order
    }

    fn dimension(&self) -> usize {
        self.spec.embedding_dim
    }

    fn model_version(&self) -> Option<&str> {
        Some(&self.spec.model_version)
    }

    fn embed(&self, face: &NormalizedFace) -> Result<Embedding, ExtractionError> {
        let input = preprocess(face, self.spec.layout);

        let mut session = self
            .session
            .lock()
            .map_err(|_| ExtractionError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::InferenceFailed(format!("embedding extraction: {e}")))?;
        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != self.spec.embedding_dim {
            return Err(ExtractionError::DimensionMismatch {
                expected: self.spec.embedding_dim,
                actual: raw.len(),
            });
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(ExtractionError::InvalidOutput);
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(self.spec.model_version.clone()),
        })
    }
}

/// Prewhiten a face into a float tensor: `(x - mean) / max(std, floor)` over
/// all pixels and channels of the image, as FaceNet was trained.
fn preprocess(face: &NormalizedFace, layout: TensorLayout) -> Array4<f32> {
    let size = face.size as usize;
    let n = face.pixels.len().max(1) as f32;

    let mean = face.pixels.iter().map(|&p| p as f32).sum::<f32>() / n;
    let variance = face
        .pixels
        .iter()
        .map(|&p| (p as f32 - mean).powi(2))
        .sum::<f32>()
        / n;
    let std = variance.sqrt().max(MIN_STD_FLOOR);

    let mut tensor = match layout {
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
    };

    for y in 0..size {
        for x in 0..size {
            for c in 0..3 {
                let pixel = face
                    .pixels
                    .get((y * size + x) * 3 + c)
                    .copied()
                    .unwrap_or(0) as f32;
                let value = (pixel - mean) / std;
                match layout {
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                }
            }
        }
    }

    tensor
}

/// Scale to unit length; a zero vector is returned unchanged.
pub fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut values {
            *v /= norm;
        }
    }
    values
}
