//! Model artifact storage in the Hugging Face cache layout
//! (`<cache>/models--org--name/{refs,snapshots,blobs}`).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder, ApiError};
use hf_hub::{Repo, RepoType};
use tracing::{debug, info, warn};

use crate::error::RepositoryError;

/// Files worth transferring for a model snapshot
const ARTIFACT_EXTENSIONS: [&str; 6] = [".json", ".safetensors", ".gguf", ".bytes", ".model", ".txt"];

/// Smallest total size a cached snapshot must have to be trusted
const MIN_VALID_CACHE_BYTES: u64 = 1024;

pub trait ArtifactRepository: Send + Sync {
    /// Local snapshot directory of an already cached artifact. Never touches the network.
    fn resolve(&self, id: &str) -> Result<PathBuf, RepositoryError>;

    /// Transfers the artifact into `cache_dir` and returns its snapshot directory.
    fn fetch(&self, id: &str, cache_dir: &Path) -> Result<PathBuf, RepositoryError>;

    fn cache_status(&self, _id: &str) -> CacheStatus {
        CacheStatus::default()
    }

    /// Drops whatever is cached for `id` and fetches it again
    fn force_fetch(&self, id: &str, cache_dir: &Path) -> Result<PathBuf, RepositoryError> {
        self.fetch(id, cache_dir)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatus {
    /// The `models--org--name` directory, when one exists
    pub path: Option<PathBuf>,
    pub files: usize,
    pub valid_files: usize,
    pub total_bytes: u64,
}

impl CacheStatus {
    pub fn is_cached(&self) -> bool {
        self.path.is_some()
    }

    /// At least one non-empty file and more than a kilobyte of data
    pub fn is_valid(&self) -> bool {
        self.valid_files > 0 && self.total_bytes > MIN_VALID_CACHE_BYTES
    }
}

pub fn repo_folder_name(id: &str) -> String {
    format!("models--{}", id.replace('/', "--"))
}

pub struct HubRepository {
    cache_dir: PathBuf,
}

impl HubRepository {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn api(cache_dir: &Path) -> Result<Api, ApiError> {
        ApiBuilder::new()
            .with_cache_dir(cache_dir.to_path_buf())
            .with_progress(false)
            .build()
    }
}

impl ArtifactRepository for HubRepository {
    fn resolve(&self, id: &str) -> Result<PathBuf, RepositoryError> {
        let repo_dir = self.cache_dir.join(repo_folder_name(id));
        let commit = fs::read_to_string(repo_dir.join("refs").join("main"))
            .map_err(|_| RepositoryError::NotCached(id.to_string()))?;
        let snapshot = repo_dir.join("snapshots").join(commit.trim());

        if !is_non_empty_dir(&snapshot) {
            return Err(RepositoryError::NotCached(id.to_string()));
        }
        debug!("Resolved {id} from cache at {}", snapshot.display());
        Ok(snapshot)
    }

    #[tracing::instrument(level = "info", skip(self))]
    fn fetch(&self, id: &str, cache_dir: &Path) -> Result<PathBuf, RepositoryError> {
        let fetch_error = |reason: String| RepositoryError::Fetch {
            id: id.to_string(),
            reason,
        };

        let api = Self::api(cache_dir).map_err(|e| fetch_error(e.to_string()))?;
        let repo = api.repo(Repo::with_revision(
            id.to_string(),
            RepoType::Model,
            "main".to_string(),
        ));
        let listing = repo.info().map_err(|e| fetch_error(e.to_string()))?;
        let files = select_artifact_files(listing.siblings.iter().map(|s| s.rfilename.as_str()));
        if files.is_empty() {
            return Err(fetch_error("repository has no loadable files".to_string()));
        }

        info!("Downloading {} files of {id}", files.len());
        let mut snapshot = None;
        for file in &files {
            let path = repo.get(file).map_err(|e| fetch_error(format!("{file}: {e}")))?;
            debug!("Fetched {}", path.display());
            if snapshot.is_none() {
                snapshot = path.parent().map(Path::to_path_buf);
            }
        }
        snapshot.ok_or_else(|| fetch_error("no snapshot directory was created".to_string()))
    }

    fn cache_status(&self, id: &str) -> CacheStatus {
        let repo_dir = self.cache_dir.join(repo_folder_name(id));
        if !repo_dir.is_dir() {
            return CacheStatus::default();
        }

        let mut status = CacheStatus {
            path: Some(repo_dir.clone()),
            ..Default::default()
        };

        let mut entries = Vec::new();
        if let Ok(snapshots) = fs::read_dir(repo_dir.join("snapshots")) {
            for snapshot in snapshots.flatten().map(|e| e.path()).filter(|p| p.is_dir()) {
                entries.extend(file_sizes(&snapshot));
            }
        }
        entries.extend(file_sizes(&repo_dir.join("blobs")));

        // a snapshot entry and the blob it links to are one file
        let mut seen = HashSet::new();
        for (path, size) in entries {
            let target = fs::canonicalize(&path).unwrap_or(path);
            if !seen.insert(target) {
                continue;
            }
            status.files += 1;
            status.total_bytes += size;
            if size > 0 {
                status.valid_files += 1;
            }
        }

        if status.is_valid() {
            info!(
                "Model '{id}' found in cache ({} valid files, {:.1} MB)",
                status.valid_files,
                status.total_bytes as f64 / (1024.0 * 1024.0)
            );
        } else {
            warn!(
                "Model '{id}' cache is corrupted or incomplete ({} files, {} valid)",
                status.files, status.valid_files
            );
        }
        status
    }

    fn force_fetch(&self, id: &str, cache_dir: &Path) -> Result<PathBuf, RepositoryError> {
        let repo_dir = cache_dir.join(repo_folder_name(id));
        if repo_dir.exists() {
            info!("Clearing cached files of {id}");
            if let Err(err) = fs::remove_dir_all(&repo_dir) {
                warn!("Could not clear {}: {err}", repo_dir.display());
            }
        }
        self.fetch(id, cache_dir)
    }
}

/// Top level weights, configs and tokenizer files. When GGUF files are
/// published a single one is kept (preferring Q4_K_M) and safetensors are skipped.
fn select_artifact_files<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut files: Vec<String> = names
        .filter(|name| !name.contains('/'))
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            ARTIFACT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
        })
        .map(str::to_string)
        .collect();
    files.sort();

    let ggufs: Vec<&String> = files
        .iter()
        .filter(|f| f.to_ascii_lowercase().ends_with(".gguf"))
        .collect();
    if ggufs.is_empty() {
        return files;
    }

    let chosen = ggufs
        .iter()
        .find(|f| f.to_ascii_lowercase().contains("q4_k_m"))
        .unwrap_or(&ggufs[0])
        .to_string();
    files
        .into_iter()
        .filter(|f| {
            let lower = f.to_ascii_lowercase();
            !(lower.ends_with(".gguf") || lower.ends_with(".safetensors")) || *f == chosen
        })
        .collect()
}

fn file_sizes(dir: &Path) -> Vec<(PathBuf, u64)> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                // snapshot entries are symlinks into blobs
                let meta = fs::metadata(&path).ok()?;
                meta.is_file().then(|| (path, meta.len()))
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write_snapshot(root: &Path, id: &str, files: &[(&str, usize)]) -> PathBuf {
        let repo_dir = root.join(repo_folder_name(id));
        let snapshot = repo_dir.join("snapshots").join("abc123");
        fs::create_dir_all(&snapshot).unwrap();
        fs::create_dir_all(repo_dir.join("refs")).unwrap();
        fs::write(repo_dir.join("refs").join("main"), "abc123\n").unwrap();
        for (name, size) in files {
            fs::write(snapshot.join(name), vec![b'x'; *size]).unwrap();
        }
        snapshot
    }

    #[test]
    fn resolves_cached_snapshot() {
        let dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(dir.path(), "org/model", &[("config.json", 10)]);

        let repository = HubRepository::new(dir.path());
        assert_eq!(repository.resolve("org/model").unwrap(), snapshot);
        assert!(matches!(
            repository.resolve("org/other"),
            Err(RepositoryError::NotCached(_))
        ));
    }

    #[test]
    fn tiny_cache_is_not_valid() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), "org/small", &[("config.json", 10), ("empty.bin", 0)]);
        write_snapshot(dir.path(), "org/large", &[("model.safetensors", 4096)]);

        let repository = HubRepository::new(dir.path());
        let small = repository.cache_status("org/small");
        assert!(small.is_cached());
        assert_eq!(small.files, 2);
        assert!(!small.is_valid());

        assert!(repository.cache_status("org/large").is_valid());
        assert!(!repository.cache_status("org/missing").is_cached());
    }

    #[cfg(unix)]
    #[test]
    fn linked_blobs_count_once() {
        let dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(dir.path(), "org/linked", &[]);
        let blobs = dir.path().join(repo_folder_name("org/linked")).join("blobs");
        fs::create_dir_all(&blobs).unwrap();
        fs::write(blobs.join("9f2c"), vec![b'x'; 2048]).unwrap();
        std::os::unix::fs::symlink(blobs.join("9f2c"), snapshot.join("model.safetensors")).unwrap();

        let status = HubRepository::new(dir.path()).cache_status("org/linked");
        assert_eq!(status.files, 1);
        assert_eq!(status.valid_files, 1);
        assert_eq!(status.total_bytes, 2048);
    }

    #[test]
    fn selects_one_gguf() {
        let files = select_artifact_files(
            [
                "config.json",
                "model-q8_0.gguf",
                "model-q4_k_m.gguf",
                "model.safetensors",
                "onnx/model.json",
                "README.md",
                "tokenizer.json",
            ]
            .into_iter(),
        );
        assert_eq!(files, vec!["config.json", "model-q4_k_m.gguf", "tokenizer.json"]);
    }

    #[test]
    fn folder_name_matches_hub_layout() {
        assert_eq!(repo_folder_name("openai/whisper-base"), "models--openai--whisper-base");
    }
}
