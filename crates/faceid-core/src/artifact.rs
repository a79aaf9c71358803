//! On-disk classifier artifact.
//!
//! The artifact is a JSON envelope holding the serialized classifier and its
//! SHA-256. Writes go to a temporary file in the destination directory which
//! is then renamed over the target, so readers see either the previous
//! artifact or the new one in full.

use crate::classifier::Classifier;
use crate::trainer::TrainedClassifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed artifact: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported artifact format version {0}")]
    UnsupportedVersion(u32),
    #[error("artifact checksum mismatch (expected {expected}, computed {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("invalid classifier in artifact: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    sha256: String,
    payload: String,
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data).iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Reads and atomically replaces the classifier artifact at a fixed path.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    path: PathBuf,
}

impl ArtifactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `classifier`, replacing any previous artifact atomically.
    pub fn persist(&self, classifier: &TrainedClassifier) -> Result<PathBuf, ArtifactError> {
        let payload = serde_json::to_string(classifier)?;
        let envelope = Envelope {
            format_version: FORMAT_VERSION,
            sha256: sha256_hex(payload.as_bytes()),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_err = |source| ArtifactError::Io {
            path: self.path.clone(),
            source,
        };

        fs::create_dir_all(&dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        tracing::info!(
            path = %self.path.display(),
            run_id = %classifier.metadata.run_id,
            bytes = bytes.len(),
            "classifier artifact written"
        );
        Ok(self.path.clone())
    }

    /// Read and verify the artifact.
    pub fn load(&self) -> Result<TrainedClassifier, ArtifactError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(self.path.clone()))
            }
            Err(source) => {
                return Err(ArtifactError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        if envelope.format_version != FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion(envelope.format_version));
        }
        let actual = sha256_hex(envelope.payload.as_bytes());
        if actual != envelope.sha256 {
            return Err(ArtifactError::ChecksumMismatch {
                expected: envelope.sha256,
                actual,
            });
        }

        let classifier: TrainedClassifier = serde_json::from_str(&envelope.payload)?;
        check(&classifier)?;
        tracing::info!(
            path = %self.path.display(),
            run_id = %classifier.metadata.run_id,
            labels = classifier.metadata.label_count,
            dimension = classifier.metadata.dimension,
            "classifier artifact loaded"
        );
        Ok(classifier)
    }
}

/// A checksum only proves the payload was not altered after writing; the
/// model itself must still be usable.
fn check(classifier: &TrainedClassifier) -> Result<(), ArtifactError> {
    classifier.model.validate().map_err(ArtifactError::Invalid)?;
    let meta = &classifier.metadata;
    if meta.dimension != classifier.model.dimension() {
        return Err(ArtifactError::Invalid(format!(
            "metadata dimension {} does not match model dimension {}",
            meta.dimension,
            classifier.model.dimension()
        )));
    }
    if meta.label_count != classifier.model.labels().len() {
        return Err(ArtifactError::Invalid(format!(
            "metadata label count {} does not match model label count {}",
            meta.label_count,
            classifier.model.labels().len()
        )));
    }
    Ok(())
}
