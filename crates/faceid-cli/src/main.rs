use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::{
    count_images, evaluate, train, train_from_directory, ArtifactStore, DatasetBuilder,
    EmbeddingExtractor, InferenceService, LabeledEmbeddingSet, OnnxEmbedder,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "faceid", about = "Identify people from photographs of their face")]
struct Cli {
    /// TOML configuration file (default: $FACEID_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// ONNX embedding model (overrides configuration)
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Classifier artifact path (overrides configuration)
    #[arg(long, global = true)]
    artifact: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count training images per identity
    Stats {
        /// Dataset root: one subdirectory per identity
        root: PathBuf,
    },
    /// Embed a dataset and save the labeled embeddings as JSON
    Embed {
        root: PathBuf,
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Train the identity classifier and persist it
    Train {
        /// Dataset root (omit when using --embeddings)
        root: Option<PathBuf>,
        /// Train from embeddings written by `faceid embed`
        #[arg(long, conflicts_with = "root")]
        embeddings: Option<PathBuf>,
        /// Hold out every n-th image per identity and report accuracy on it
        #[arg(long)]
        holdout_every: Option<usize>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f32>,
    },
    /// Measure classifier accuracy on a labeled dataset
    Evaluate {
        root: Option<PathBuf>,
        #[arg(long, conflicts_with = "root")]
        embeddings: Option<PathBuf>,
    },
    /// Predict the identity in one or more images
    Predict {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Declared content type applied to every image (default: from extension)
        #[arg(long)]
        content_type: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.model_path = model;
    }
    if let Some(artifact) = cli.artifact {
        config.artifact_path = artifact;
    }
    tracing::debug!(?config, "configuration resolved");

    match cli.command {
        Commands::Stats { root } => {
            let counts = count_images(&root)?;
            let total: usize = counts.values().sum();
            print_json(&json!({ "labels": counts, "label_count": counts.len(), "image_count": total }))?;
        }
        Commands::Embed { root, out } => {
            let extractor = load_extractor(&config)?;
            let build = DatasetBuilder::new(&extractor).build(&root)?;
            let file = std::fs::File::create(&out)
                .with_context(|| format!("creating {}", out.display()))?;
            serde_json::to_writer(std::io::BufWriter::new(file), &build.set)?;
            print_json(&json!({
                "embeddings": out,
                "sample_count": build.set.len(),
                "label_count": build.set.label_counts().len(),
                "skipped": build.skipped,
            }))?;
        }
        Commands::Train {
            root,
            embeddings,
            holdout_every,
            epochs,
            learning_rate,
        } => {
            if let Some(e) = epochs {
                config.training.epochs = e;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            if let Some(h) = holdout_every {
                config.holdout_every = h;
            }
            run_train(&config, root.as_deref(), embeddings.as_deref())?;
        }
        Commands::Evaluate { root, embeddings } => {
            let set = labeled_set(&config, root.as_deref(), embeddings.as_deref())?.0;
            let classifier = ArtifactStore::new(&config.artifact_path)
                .load()
                .context("loading classifier artifact")?;
            let report = evaluate(&classifier, &set);
            print_json(&serde_json::to_value(&report)?)?;
        }
        Commands::Predict {
            images,
            content_type,
        } => {
            run_predict(&config, images, content_type).await?;
        }
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn load_extractor(config: &Config) -> Result<OnnxEmbedder> {
    OnnxEmbedder::load(&config.model_path, config.model.clone())
        .with_context(|| format!("loading embedding model {}", config.model_path.display()))
}

/// Labeled set from a dataset directory or a saved embeddings file, plus
/// the number of images skipped while building it.
fn labeled_set(
    config: &Config,
    root: Option<&Path>,
    embeddings: Option<&Path>,
) -> Result<(LabeledEmbeddingSet, usize)> {
    match (root, embeddings) {
        (_, Some(path)) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            let set = serde_json::from_reader(std::io::BufReader::new(file))
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok((set, 0))
        }
        (Some(root), None) => {
            let extractor = load_extractor(config)?;
            let build = DatasetBuilder::new(&extractor).build(root)?;
            Ok((build.set, build.skipped.len()))
        }
        (None, None) => bail!("either a dataset root or --embeddings is required"),
    }
}

fn run_train(config: &Config, root: Option<&Path>, embeddings: Option<&Path>) -> Result<()> {
    let store = ArtifactStore::new(&config.artifact_path);

    // Plain directory training goes through the library entry point.
    if let (Some(root), None, 0) = (root, embeddings, config.holdout_every) {
        let extractor = load_extractor(config)?;
        let summary = train_from_directory(root, &extractor, &config.training, &store)?;
        print_json(&json!({
            "artifact": summary.artifact,
            "run_id": summary.run_id,
            "sample_count": summary.sample_count,
            "label_count": summary.label_count,
            "skipped": summary.skipped.len(),
        }))?;
        return Ok(());
    }

    let (set, skipped) = labeled_set(config, root, embeddings)?;
    let (train_set, holdout) = set.split_holdout(config.holdout_every);
    let trained = train(&train_set, &config.training)?;
    let artifact = store.persist(&trained)?;

    let accuracy = (!holdout.is_empty()).then(|| evaluate(&trained, &holdout).accuracy);
    print_json(&json!({
        "artifact": artifact,
        "run_id": trained.metadata.run_id,
        "sample_count": trained.metadata.sample_count,
        "label_count": trained.metadata.label_count,
        "skipped": skipped,
        "holdout_count": holdout.len(),
        "holdout_accuracy": accuracy,
    }))
}

/// Content type implied by a file extension, if any.
fn content_type_for(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

async fn run_predict(config: &Config, images: Vec<PathBuf>, content_type: Option<String>) -> Result<()> {
    let extractor: Arc<dyn EmbeddingExtractor> = Arc::new(load_extractor(config)?);
    let service = Arc::new(InferenceService::new(extractor));

    // Load once; without a classifier every request reports model_unavailable.
    if let Err(e) = service.load_artifact(&ArtifactStore::new(&config.artifact_path)) {
        tracing::warn!(error = %e, "no classifier loaded");
    }

    let mut tasks = Vec::with_capacity(images.len());
    for path in images {
        let service = Arc::clone(&service);
        let declared = content_type
            .clone()
            .or_else(|| content_type_for(&path).map(str::to_owned));
        // Each request runs normalize → embed → classify as one blocking unit.
        tasks.push(tokio::task::spawn_blocking(move || {
            let result = std::fs::read(&path)
                .map_err(|e| faceid_core::InferenceError::InvalidInput(format!("read: {e}")))
                .and_then(|bytes| service.predict(&bytes, declared.as_deref()));
            (path, result)
        }));
    }

    let mut failures = 0usize;
    for task in tasks {
        let (path, result) = task.await?;
        let line = match result {
            Ok(prediction) => json!({
                "image": path,
                "identity": prediction.identity,
                "confidence": prediction.confidence,
            }),
            Err(e) => {
                failures += 1;
                let body = e.to_body();
                json!({ "image": path, "kind": body.kind, "message": body.message })
            }
        };
        print_json(&line)?;
    }

    if failures > 0 {
        tracing::warn!(failures, "some predictions failed");
    }
    Ok(())
}
