use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Channel ordering of an interleaved 3-channel pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl std::str::FromStr for ChannelOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Ok(Self::Rgb),
            "bgr" => Ok(Self::Bgr),
            other => Err(format!("unknown channel order: {other}")),
        }
    }
}

/// A face resized to the canonical resolution expected by the embedding model.
///
/// `pixels` holds exactly `size * size * 3` bytes, row-major, interleaved in
/// `order`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFace {
    pub pixels: Vec<u8>,
    pub size: u32,
    pub order: ChannelOrder,
}

impl NormalizedFace {
    /// Shape as (height, width, channels).
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.size as usize, self.size as usize, 3)
    }

    /// Channel values of the pixel at (x, y), in buffer order.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * self.size + x) * 3) as usize;
        [self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]]
    }
}

/// Face embedding vector (512-dimensional for FaceNet-512).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet512").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// True when every component is finite (no NaN, no ±Inf).
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("embedding dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// One (embedding, identity label) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledSample {
    pub embedding: Embedding,
    pub label: String,
}

/// Ordered collection of labeled embeddings sharing one dimensionality.
///
/// Deserialization goes through [`push`](Self::push), so a stored set with
/// mixed dimensions is rejected on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "StoredSet")]
pub struct LabeledEmbeddingSet {
    samples: Vec<LabeledSample>,
}

#[derive(Deserialize)]
struct StoredSet {
    samples: Vec<LabeledSample>,
}

impl TryFrom<StoredSet> for LabeledEmbeddingSet {
    type Error = DimensionMismatch;

    fn try_from(stored: StoredSet) -> Result<Self, Self::Error> {
        let mut set = Self::new();
        for sample in stored.samples {
            set.push(sample.embedding, sample.label)?;
        }
        Ok(set)
    }
}

impl LabeledEmbeddingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. The first sample fixes the set's dimensionality.
    pub fn push(
        &mut self,
        embedding: Embedding,
        label: impl Into<String>,
    ) -> Result<(), DimensionMismatch> {
        if let Some(expected) = self.dimension() {
            if embedding.dimension() != expected {
                return Err(DimensionMismatch {
                    expected,
                    actual: embedding.dimension(),
                });
            }
        }
        self.samples.push(LabeledSample {
            embedding,
            label: label.into(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Dimensionality shared by all vectors, or `None` for an empty set.
    pub fn dimension(&self) -> Option<usize> {
        self.samples.first().map(|s| s.embedding.dimension())
    }

    pub fn samples(&self) -> &[LabeledSample] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabeledSample> {
        self.samples.iter()
    }

    /// Distinct labels, sorted.
    pub fn labels(&self) -> Vec<String> {
        self.label_counts().into_keys().collect()
    }

    /// Number of samples per label.
    pub fn label_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.label.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Deterministic stratified split: within each label, every `every`-th
    /// sample (the 1st, (every+1)th, ...) goes to the hold-out set.
    ///
    /// Labels with a single sample stay entirely in the training half so that
    /// the training half keeps every label. `every < 2` holds nothing out.
    pub fn split_holdout(&self, every: usize) -> (LabeledEmbeddingSet, LabeledEmbeddingSet) {
        let mut train = LabeledEmbeddingSet::new();
        let mut holdout = LabeledEmbeddingSet::new();
        if every < 2 {
            return (self.clone(), holdout);
        }

        let counts = self.label_counts();
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for sample in &self.samples {
            let nth = seen.entry(sample.label.as_str()).or_insert(0);
            let to_holdout = counts[&sample.label] > 1 && *nth % every == 0;
            *nth += 1;
            if to_holdout {
                holdout.samples.push(sample.clone());
            } else {
                train.samples.push(sample.clone());
            }
        }
        (train, holdout)
    }
}

/// Result of classifying one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_deserialize_rejects_mixed_dimensions() {
        let json = r#"{"samples":[
            {"embedding":{"values":[1.0,0.0],"model_version":null},"label":"alice"},
            {"embedding":{"values":[0.0,1.0,0.0],"model_version":null},"label":"bob"}
        ]}"#;
        let err = serde_json::from_str::<LabeledEmbeddingSet>(json).unwrap_err();
        assert!(err.to_string().contains("expected 2, got 3"), "{err}");
    }

    #[test]
    fn test_deserialize_written_set() {
        let mut set = LabeledEmbeddingSet::new();
        set.push(emb(&[1.0, 0.0]), "alice").unwrap();
        set.push(emb(&[0.0, 1.0]), "bob").unwrap();
        let json = serde_json::to_string(&set).unwrap();
        let read: LabeledEmbeddingSet = serde_json::from_str(&json).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read.dimension(), Some(2));
        assert_eq!(read.labels(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_push_rejects_dimension_mismatch() {
        let mut set = LabeledEmbeddingSet::new();
        set.push(emb(&[1.0, 0.0]), "alice").unwrap();
        let err = set.push(emb(&[1.0, 0.0, 0.0]), "bob").unwrap_err();
        assert_eq!(err, DimensionMismatch { expected: 2, actual: 3 });
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_labels_sorted_and_counted() {
        let mut set = LabeledEmbeddingSet::new();
        set.push(emb(&[1.0]), "carol").unwrap();
        set.push(emb(&[2.0]), "alice").unwrap();
        set.push(emb(&[3.0]), "carol").unwrap();
        assert_eq!(set.labels(), vec!["alice".to_string(), "carol".to_string()]);
        assert_eq!(set.label_counts()["carol"], 2);
        assert_eq!(set.dimension(), Some(1));
    }

    #[test]
    fn test_empty_set_has_no_dimension() {
        let set = LabeledEmbeddingSet::new();
        assert!(set.is_empty());
        assert_eq!(set.dimension(), None);
        assert!(set.labels().is_empty());
    }

    #[test]
    fn test_embedding_finiteness() {
        assert!(emb(&[0.0, -1.5, 3.0]).is_finite());
        assert!(!emb(&[0.0, f32::NAN]).is_finite());
        assert!(!emb(&[f32::INFINITY]).is_finite());
    }

    #[test]
    fn test_split_holdout_is_stratified() {
        let mut set = LabeledEmbeddingSet::new();
        for i in 0..6 {
            set.push(emb(&[i as f32]), "alice").unwrap();
        }
        set.push(emb(&[9.0]), "solo").unwrap();

        let (train, holdout) = set.split_holdout(3);
        // alice: indices 0 and 3 held out; solo stays in training
        assert_eq!(holdout.len(), 2);
        assert!(holdout.iter().all(|s| s.label == "alice"));
        assert_eq!(train.len(), 5);
        assert_eq!(train.label_counts()["solo"], 1);
    }

    #[test]
    fn test_split_holdout_disabled() {
        let mut set = LabeledEmbeddingSet::new();
        set.push(emb(&[1.0]), "a").unwrap();
        set.push(emb(&[2.0]), "a").unwrap();
        let (train, holdout) = set.split_holdout(0);
        assert_eq!(train.len(), 2);
        assert!(holdout.is_empty());
    }

    #[test]
    fn test_channel_order_parse() {
        assert_eq!("RGB".parse::<ChannelOrder>().unwrap(), ChannelOrder::Rgb);
        assert_eq!("bgr".parse::<ChannelOrder>().unwrap(), ChannelOrder::Bgr);
        assert!("rgba".parse::<ChannelOrder>().is_err());
    }
}
