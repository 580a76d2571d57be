#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use image::{Rgb, RgbImage};
use tempfile::TempDir;

use multimodal_runner::error::{DependencyError, GenerationError, RepositoryError};
use multimodal_runner::inference::runtime::{
    ArtifactRef, LoadOptions, LoadedModel, ModelRuntime, RuntimeInput, RuntimeModel, RuntimeOutput,
};
use multimodal_runner::media::MediaCodec;
use multimodal_runner::repository::ArtifactRepository;
use multimodal_runner::{CacheSettings, Dispatcher, ModelCache};

pub type Behaviour = Arc<dyn Fn(&RuntimeInput) -> Result<RuntimeOutput, GenerationError> + Send + Sync>;

pub struct StubModel {
    behaviour: Behaviour,
    pub inputs: Arc<Mutex<Vec<&'static str>>>,
}

impl RuntimeModel for StubModel {
    fn architecture(&self) -> &str {
        "StubModel"
    }

    fn run(&mut self, input: RuntimeInput) -> Result<RuntimeOutput, GenerationError> {
        self.inputs.lock().unwrap().push(input.kind());
        (self.behaviour)(&input)
    }
}

pub struct StubRuntime {
    behaviour: Behaviour,
    pub loads: AtomicUsize,
    pub inputs: Arc<Mutex<Vec<&'static str>>>,
}

impl StubRuntime {
    pub fn new<F>(behaviour: F) -> Self
    where
        F: Fn(&RuntimeInput) -> Result<RuntimeOutput, GenerationError> + Send + Sync + 'static,
    {
        Self {
            behaviour: Arc::new(behaviour),
            loads: AtomicUsize::new(0),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn text(reply: &'static str) -> Self {
        Self::new(move |_| Ok(RuntimeOutput::Text(reply.to_string())))
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<&'static str> {
        self.inputs.lock().unwrap().clone()
    }
}

impl ModelRuntime for StubRuntime {
    fn load(&self, artifact: &ArtifactRef, _options: &LoadOptions) -> Result<LoadedModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !artifact.dir.is_dir() {
            bail!("{} does not exist", artifact.dir.display());
        }
        Ok(LoadedModel {
            model: Box::new(StubModel {
                behaviour: self.behaviour.clone(),
                inputs: self.inputs.clone(),
            }),
            processor: None,
        })
    }
}

/// Known ids resolve to populated directories, everything else is missing
pub struct StubRepository {
    models: HashMap<String, PathBuf>,
    pub fetches: AtomicUsize,
}

impl StubRepository {
    pub fn new(root: &Path, ids: &[&str]) -> Self {
        let models = ids
            .iter()
            .map(|id| {
                let dir = root.join(id.replace('/', "--"));
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join("config.json"), "{}").unwrap();
                (id.to_string(), dir)
            })
            .collect();
        Self {
            models,
            fetches: AtomicUsize::new(0),
        }
    }
}

impl ArtifactRepository for StubRepository {
    fn resolve(&self, id: &str) -> Result<PathBuf, RepositoryError> {
        self.models
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotCached(id.to_string()))
    }

    fn fetch(&self, id: &str, _cache_dir: &Path) -> Result<PathBuf, RepositoryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.resolve(id).map_err(|_| RepositoryError::Fetch {
            id: id.to_string(),
            reason: "404 Not Found".into(),
        })
    }
}

#[derive(Default)]
pub struct StubCodec {
    pub audio_unavailable: bool,
    pub written: Mutex<Vec<(PathBuf, usize, u32)>>,
}

impl MediaCodec for StubCodec {
    fn check_audio(&self) -> Result<(), DependencyError> {
        if self.audio_unavailable {
            return Err(DependencyError::MissingCodec("no decoder registered".into()));
        }
        Ok(())
    }

    fn decode_audio(&self, path: &Path, sample_rate: u32, _max_seconds: f32) -> Result<Vec<f32>> {
        if !path.is_file() {
            bail!("{} not found", path.display());
        }
        Ok(vec![0.0; sample_rate as usize])
    }

    fn decode_image(&self, path: &Path) -> Result<RgbImage> {
        if !path.is_file() {
            bail!("{} not found", path.display());
        }
        Ok(RgbImage::from_pixel(64, 48, Rgb([200, 200, 200])))
    }

    fn write_wav(&self, path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
        self.written
            .lock()
            .unwrap()
            .push((path.to_path_buf(), samples.len(), sample_rate));
        Ok(())
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub runtime: Arc<StubRuntime>,
    pub repository: Arc<StubRepository>,
    pub codec: Arc<StubCodec>,
}

impl Fixture {
    pub fn new(runtime: StubRuntime, ids: &[&str]) -> Self {
        Self::with_codec(runtime, ids, StubCodec::default())
    }

    pub fn with_codec(runtime: StubRuntime, ids: &[&str], codec: StubCodec) -> Self {
        let dir = TempDir::new().unwrap();
        let repository = Arc::new(StubRepository::new(&dir.path().join("repo"), ids));
        Self {
            dir,
            runtime: Arc::new(runtime),
            repository,
            codec: Arc::new(codec),
        }
    }

    pub fn dispatcher(&self, offline: bool) -> Dispatcher {
        let settings = CacheSettings {
            cache_dir: self.dir.path().join("cache"),
            offline,
            ..Default::default()
        };
        let cache = ModelCache::new(self.repository.clone(), self.runtime.clone(), settings);
        Dispatcher::new(cache, self.codec.clone(), self.dir.path().join("audio"))
    }

    /// Creates an empty file with the given name
    pub fn file(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }
}
