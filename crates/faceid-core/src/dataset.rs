//! Labeled embedding set construction from a `root/<label>/<image>` tree.
//!
//! Per-image failures are skipped, logged and reported in
//! [`DatasetBuild::skipped`]; they never abort a build. Only failing to read
//! the root directory is fatal.

use crate::extractor::{checked_embed, EmbeddingExtractor};
use crate::normalizer::FaceNormalizer;
use crate::types::{Embedding, LabeledEmbeddingSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions admitted into a dataset (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("cannot read dataset directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An image (or a whole label directory) left out of the set, and why.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

/// Output of a dataset build.
#[derive(Debug, Default)]
pub struct DatasetBuild {
    pub set: LabeledEmbeddingSet,
    pub skipped: Vec<SkippedImage>,
}

/// True when `path` carries one of [`IMAGE_EXTENSIONS`].
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Entries of `dir` sorted by file name, so builds do not depend on the
/// filesystem's listing order.
fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Result of listing a dataset root.
#[derive(Debug, Default)]
struct LabelScan {
    /// Label directories with their admitted image paths.
    labels: Vec<(String, Vec<PathBuf>)>,
    /// Label directories that could not be used at all.
    skipped: Vec<SkippedImage>,
}

/// List label directories under `root`.
///
/// A directory whose name is not UTF-8 or whose contents cannot be listed is
/// recorded in [`LabelScan::skipped`] instead of failing the scan.
fn label_dirs(root: &Path) -> Result<LabelScan, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: root.to_path_buf(),
        source,
    };

    let mut scan = LabelScan::default();
    for dir in sorted_entries(root).map_err(io_err)? {
        if !dir.is_dir() {
            continue;
        }
        let Some(label) = dir.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            skip_dir(&mut scan, dir, "label directory name is not valid UTF-8".into());
            continue;
        };
        match sorted_entries(&dir) {
            Ok(entries) => {
                let images = entries
                    .into_iter()
                    .filter(|p| p.is_file() && is_image_file(p))
                    .collect();
                scan.labels.push((label, images));
            }
            Err(e) => skip_dir(&mut scan, dir, format!("cannot list label directory: {e}")),
        }
    }
    Ok(scan)
}

fn skip_dir(scan: &mut LabelScan, path: PathBuf, reason: String) {
    tracing::warn!(path = %path.display(), reason = %reason, "skipping label directory");
    scan.skipped.push(SkippedImage { path, reason });
}

/// Number of admitted images per label, without decoding anything.
///
/// Unusable label directories are logged and left out.
pub fn count_images(root: &Path) -> Result<BTreeMap<String, usize>, DatasetError> {
    Ok(label_dirs(root)?
        .labels
        .into_iter()
        .map(|(label, images)| (label, images.len()))
        .collect())
}

/// Walks a labeled directory tree and embeds every admitted image.
pub struct DatasetBuilder<'a> {
    normalizer: FaceNormalizer,
    extractor: &'a dyn EmbeddingExtractor,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(extractor: &'a dyn EmbeddingExtractor) -> Self {
        Self {
            normalizer: FaceNormalizer::for_extractor(extractor),
            extractor,
        }
    }

    pub fn build(&self, root: &Path) -> Result<DatasetBuild, DatasetError> {
        let scan = label_dirs(root)?;
        let mut build = DatasetBuild {
            skipped: scan.skipped,
            ..DatasetBuild::default()
        };

        for (label, images) in scan.labels {
            let before = build.set.len();
            for path in images {
                match self.embed_file(&path) {
                    Ok(embedding) => {
                        if let Err(e) = build.set.push(embedding, label.clone()) {
                            skip(&mut build, path, e.to_string());
                        }
                    }
                    Err(reason) => skip(&mut build, path, reason),
                }
            }
            tracing::debug!(label = %label, images = build.set.len() - before, "label embedded");
        }

        tracing::info!(
            root = %root.display(),
            samples = build.set.len(),
            labels = build.set.label_counts().len(),
            skipped = build.skipped.len(),
            "dataset built"
        );
        Ok(build)
    }

    fn embed_file(&self, path: &Path) -> Result<Embedding, String> {
        let bytes = fs::read(path).map_err(|e| format!("read: {e}"))?;
        let face = self
            .normalizer
            .normalize(&bytes)
            .map_err(|e| format!("normalize: {e}"))?;
        checked_embed(self.extractor, &face).map_err(|e| format!("embed: {e}"))
    }
}

fn skip(build: &mut DatasetBuild, path: PathBuf, reason: String) {
    tracing::warn!(path = %path.display(), reason = %reason, "skipping image");
    build.skipped.push(SkippedImage { path, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_png, GridExtractor, NanExtractor};

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("bob")).unwrap();
        fs::create_dir(root.join("alice")).unwrap();
        write_png(&root.join("alice/2.png"), [250, 10, 10]);
        write_png(&root.join("alice/1.PNG"), [240, 20, 20]);
        write_png(&root.join("bob/a.png"), [10, 10, 250]);
        fs::write(root.join("bob/notes.txt"), "not an image").unwrap();
        fs::write(root.join("README.md"), "top-level file").unwrap();
        dir
    }

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file(Path::new("a/b.jpg")));
        assert!(is_image_file(Path::new("a/b.JPEG")));
        assert!(is_image_file(Path::new("b.png")));
        assert!(!is_image_file(Path::new("b.gif")));
        assert!(!is_image_file(Path::new("noext")));
    }

    #[test]
    fn test_build_labels_from_directories() {
        let dir = fixture();
        let extractor = GridExtractor::new(16);
        let build = DatasetBuilder::new(&extractor).build(dir.path()).unwrap();

        assert_eq!(build.set.len(), 3);
        assert!(build.skipped.is_empty());
        assert_eq!(build.set.labels(), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(build.set.dimension(), Some(12));
    }

    #[test]
    fn test_build_order_is_sorted() {
        let dir = fixture();
        let extractor = GridExtractor::new(16);
        let build = DatasetBuilder::new(&extractor).build(dir.path()).unwrap();
        let labels: Vec<&str> = build.set.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["alice", "alice", "bob"]);
        // "1.PNG" sorts before "2.png": the redder image comes second
        let first = &build.set.samples()[0].embedding.values;
        let second = &build.set.samples()[1].embedding.values;
        assert!(second[0] > first[0]);
    }

    #[test]
    fn test_corrupt_image_is_skipped_and_reported() {
        let dir = fixture();
        let bad = dir.path().join("bob/broken.jpg");
        fs::write(&bad, b"\xFF\xD8\xFF garbage").unwrap();

        let extractor = GridExtractor::new(16);
        let build = DatasetBuilder::new(&extractor).build(dir.path()).unwrap();

        assert_eq!(build.set.len(), 3);
        assert_eq!(build.skipped.len(), 1);
        assert_eq!(build.skipped[0].path, bad);
        assert!(build.skipped[0].reason.starts_with("normalize"));
    }

    #[test]
    fn test_extraction_failures_are_skipped() {
        let dir = fixture();
        let extractor = NanExtractor::new(16);
        let build = DatasetBuilder::new(&extractor).build(dir.path()).unwrap();
        assert!(build.set.is_empty());
        assert_eq!(build.skipped.len(), 3);
        assert!(build.skipped.iter().all(|s| s.reason.starts_with("embed")));
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let extractor = GridExtractor::new(16);
        let err = DatasetBuilder::new(&extractor)
            .build(Path::new("/nonexistent/faceid-dataset"))
            .unwrap_err();
        assert!(matches!(err, DatasetError::Io { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_label_directory_is_reported() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = fixture();
        let odd = dir.path().join(OsStr::from_bytes(b"ev\xffe"));
        fs::create_dir(&odd).unwrap();
        write_png(&odd.join("1.png"), [10, 250, 10]);

        let extractor = GridExtractor::new(16);
        let build = DatasetBuilder::new(&extractor).build(dir.path()).unwrap();
        assert_eq!(build.set.len(), 3);
        assert_eq!(build.skipped.len(), 1);
        assert_eq!(build.skipped[0].path, odd);
        assert!(build.skipped[0].reason.contains("UTF-8"));

        let counts = count_images(dir.path()).unwrap();
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_empty_label_directory() {
        let dir = fixture();
        fs::create_dir(dir.path().join("carol")).unwrap();
        let counts = count_images(dir.path()).unwrap();
        assert_eq!(counts["alice"], 2);
        assert_eq!(counts["bob"], 1);
        assert_eq!(counts["carol"], 0);
        assert!(!counts.contains_key("README.md"));
    }
}
