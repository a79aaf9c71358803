use anyhow::{Context, Result};
use faceid_core::{ChannelOrder, OnnxModelSpec, TensorLayout, TrainingParams};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const MODEL_FILE: &str = "facenet512.onnx";
const ARTIFACT_FILE: &str = "classifier.json";

/// CLI configuration: defaults, then an optional TOML file, then
/// `FACEID_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// ONNX embedding model.
    pub model_path: PathBuf,
    /// Trained classifier artifact.
    pub artifact_path: PathBuf,
    pub model: OnnxModelSpec,
    pub training: TrainingParams,
    /// Hold out every n-th image per label for evaluation (0 = none).
    pub holdout_every: usize,
}

/// Keys accepted in the TOML file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    model_path: Option<PathBuf>,
    artifact_path: Option<PathBuf>,
    face_size: Option<u32>,
    embedding_dim: Option<usize>,
    tensor_layout: Option<TensorLayout>,
    channel_order: Option<ChannelOrder>,
    learning_rate: Option<f32>,
    epochs: Option<usize>,
    l2: Option<f32>,
    holdout_every: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: faceid_core::default_model_dir().join(MODEL_FILE),
            artifact_path: faceid_core::default_data_dir().join(ARTIFACT_FILE),
            model: OnnxModelSpec::default(),
            training: TrainingParams::default(),
            holdout_every: 0,
        }
    }
}

impl Config {
    /// Resolve configuration. `file` falls back to `$FACEID_CONFIG`.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FACEID_CONFIG").ok().map(PathBuf::from));

        let mut config = Self::default();
        if let Some(path) = file {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            config
                .apply_toml(&text)
                .with_context(|| format!("parsing config {}", path.display()))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_toml(&mut self, text: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(text)?;

        if let Some(dir) = file.model_dir {
            self.model_path = dir.join(MODEL_FILE);
        }
        set(&mut self.model_path, file.model_path);
        set(&mut self.artifact_path, file.artifact_path);
        set(&mut self.model.input_size, file.face_size);
        set(&mut self.model.embedding_dim, file.embedding_dim);
        set(&mut self.model.layout, file.tensor_layout);
        set(&mut self.model.channel_order, file.channel_order);
        set(&mut self.training.learning_rate, file.learning_rate);
        set(&mut self.training.epochs, file.epochs);
        set(&mut self.training.l2, file.l2);
        set(&mut self.holdout_every, file.holdout_every);
        Ok(())
    }

    /// Apply `FACEID_*` overrides. Unparseable values are ignored with a warning.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACEID_MODEL_DIR") {
            self.model_path = PathBuf::from(dir).join(MODEL_FILE);
        }
        set(&mut self.model_path, lookup("FACEID_MODEL_PATH").map(PathBuf::from));
        set(&mut self.artifact_path, lookup("FACEID_ARTIFACT_PATH").map(PathBuf::from));
        set(&mut self.model.input_size, parsed(&lookup, "FACEID_FACE_SIZE"));
        set(&mut self.model.embedding_dim, parsed(&lookup, "FACEID_EMBEDDING_DIM"));
        set(&mut self.model.layout, parsed(&lookup, "FACEID_TENSOR_LAYOUT"));
        set(&mut self.model.channel_order, parsed(&lookup, "FACEID_CHANNEL_ORDER"));
        set(&mut self.training.learning_rate, parsed(&lookup, "FACEID_LEARNING_RATE"));
        set(&mut self.training.epochs, parsed(&lookup, "FACEID_EPOCHS"));
        set(&mut self.training.l2, parsed(&lookup, "FACEID_L2"));
        set(&mut self.holdout_every, parsed(&lookup, "FACEID_HOLDOUT_EVERY"));
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
