//! Loaded models, memoized per cache key.
//!
//! Resolution walks a fixed order: a caller-supplied local directory, the
//! artifact repository (cached snapshot first, then a transfer unless offline),
//! then a small default text model. Loads that look like accelerator failures
//! are retried on the CPU. At most one load per key is in flight at a time, and
//! the least recently used entry is evicted once the configured capacity is reached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::dispatch::ModalityTag;
use crate::error::{
    AttemptFailure, GenerationError, ModelLoadError, ModelResult, RepositoryError, ResolutionAttempt,
};
use crate::inference::runtime::{
    ArtifactRef, LoadOptions, LoadedModel, ModelRuntime, RuntimeInput, RuntimeModel, RuntimeOutput,
};
use crate::repository::{is_non_empty_dir, ArtifactRepository};

/// Identifiers no runtime can load, with the alternative to suggest
const UNSUPPORTED_ARCHITECTURES: [(&str, &str); 1] =
    [("vibevoice", "microsoft/speecht5_tts or facebook/mms-tts-eng")];

/// Checkpoints that routinely exhaust accelerator memory
const GPU_SENSITIVE_PATTERNS: [&str; 6] = ["7b", "13b", "deepseek", "awq", "gptq", "gui-owl"];

pub const DEFAULT_FALLBACK_MODEL: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub cache_dir: PathBuf,
    /// Maximum number of loaded models, 0 for no limit
    pub capacity: usize,
    pub fallback_model: String,
    pub offline: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("models"),
            capacity: 4,
            fallback_model: DEFAULT_FALLBACK_MODEL.to_string(),
            offline: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Canonical model id
    pub model_id: String,
    pub local_path: Option<PathBuf>,
    pub options: LoadOptions,
}

impl ModelRequest {
    pub fn new(model_id: impl Into<String>, options: LoadOptions) -> Self {
        Self {
            model_id: model_id.into(),
            local_path: None,
            options,
        }
    }

    pub fn with_local_path(mut self, local_path: Option<PathBuf>) -> Self {
        self.local_path = local_path;
        self
    }

    /// The supplied local path when there is one, otherwise the model id
    pub fn cache_key(&self) -> String {
        match &self.local_path {
            Some(path) if !path.as_os_str().is_empty() => path.to_string_lossy().into_owned(),
            _ => self.model_id.clone(),
        }
    }
}

/// A loaded model with its companion tokenizer
pub struct ModelHandle {
    key: String,
    model_id: String,
    source: ResolutionAttempt,
    artifact_dir: PathBuf,
    architecture: String,
    model: Mutex<Box<dyn RuntimeModel>>,
    processor: Option<Tokenizer>,
}

impl ModelHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The id of the artifact that was actually loaded
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn source(&self) -> ResolutionAttempt {
        self.source
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn processor(&self) -> Option<&Tokenizer> {
        self.processor.as_ref()
    }

    pub fn run(&self, input: RuntimeInput) -> Result<RuntimeOutput, GenerationError> {
        let mut model = self.model.lock().map_err(|_| {
            GenerationError::Runtime(format!("model {} is poisoned by an earlier panic", self.key))
        })?;
        model.run(input)
    }
}

struct CacheEntry {
    handle: Arc<ModelHandle>,
    last_used: u64,
}

pub struct ModelCache {
    repository: Arc<dyn ArtifactRepository>,
    runtime: Arc<dyn ModelRuntime>,
    settings: CacheSettings,
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// One slot per key being loaded. A failed load leaves its error in the
    /// slot so callers already queued on it get the same answer.
    in_flight: Mutex<HashMap<String, FlightSlot>>,
    clock: AtomicU64,
}

type FlightSlot = Arc<Mutex<Option<ModelLoadError>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModelCache {
    pub fn new(
        repository: Arc<dyn ArtifactRepository>,
        runtime: Arc<dyn ModelRuntime>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            repository,
            runtime,
            settings,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn repository(&self) -> &dyn ArtifactRepository {
        self.repository.as_ref()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup(&self, key: &str) -> Option<Arc<ModelHandle>> {
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(key)?;
        entry.last_used = self.tick();
        Some(entry.handle.clone())
    }

    fn insert(&self, handle: Arc<ModelHandle>) {
        let mut entries = lock(&self.entries);
        if self.settings.capacity > 0 && !entries.contains_key(handle.key()) {
            while entries.len() >= self.settings.capacity {
                let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                info!("Evicting least recently used model {oldest}");
                entries.remove(&oldest);
            }
        }
        entries.insert(
            handle.key().to_string(),
            CacheEntry {
                handle,
                last_used: self.tick(),
            },
        );
    }

    fn flight_guard(&self, key: &str) -> FlightSlot {
        lock(&self.in_flight)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Returns the cached handle for the request or loads it.
    #[tracing::instrument(level = "info", skip(self, request), fields(model = %request.model_id))]
    pub fn resolve(&self, request: &ModelRequest) -> ModelResult<Arc<ModelHandle>> {
        let lower = request.model_id.to_lowercase();
        if let Some((_, suggestion)) = UNSUPPORTED_ARCHITECTURES
            .iter()
            .find(|(pattern, _)| lower.contains(pattern))
        {
            return Err(ModelLoadError::UnsupportedArchitecture {
                id: request.model_id.clone(),
                suggestion: (*suggestion).to_string(),
            });
        }

        let key = request.cache_key();
        if let Some(handle) = self.lookup(&key) {
            debug!("Using cached model {key}");
            return Ok(handle);
        }

        let guard = self.flight_guard(&key);
        let mut loading = lock(&guard);
        // another caller may have finished the same load while we waited
        if let Some(handle) = self.lookup(&key) {
            return Ok(handle);
        }
        if let Some(err) = loading.as_ref() {
            debug!("Reusing failed load of {key}");
            return Err(err.clone());
        }

        let result = self.load_uncached(&key, request).map(Arc::new);
        match &result {
            Ok(handle) => self.insert(handle.clone()),
            Err(err) => *loading = Some(err.clone()),
        }
        drop(loading);
        lock(&self.in_flight).remove(&key);
        result
    }

    /// Loads every request in order and stops at the first failure.
    pub fn preload(&self, requests: &[ModelRequest]) -> ModelResult<usize> {
        info!("Pre-loading {} models into cache", requests.len());
        for request in requests {
            match self.resolve(request) {
                Ok(handle) => info!("{} loaded and cached", handle.key()),
                Err(err) => {
                    warn!("Failed to preload {}: {err}", request.model_id);
                    return Err(err);
                }
            }
        }
        Ok(requests.len())
    }

    fn load_uncached(&self, key: &str, request: &ModelRequest) -> ModelResult<ModelHandle> {
        let id = request.model_id.as_str();
        let mut attempts = Vec::new();

        match request.local_path.as_deref() {
            Some(dir) if is_non_empty_dir(dir) => {
                match self.load_from(id, dir, &request.options.local_only()) {
                    Ok(loaded) => {
                        return Ok(self.into_handle(key, id, ResolutionAttempt::LocalDirectory, dir, loaded))
                    }
                    Err(reason) => {
                        let err = ModelLoadError::LocalInvalid {
                            path: dir.to_path_buf(),
                            reason,
                        };
                        warn!("{err}");
                        attempts.push(AttemptFailure {
                            attempt: ResolutionAttempt::LocalDirectory,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            Some(dir) => debug!("Local path {} is missing or empty, skipping it", dir.display()),
            None => {}
        }

        match self.load_remote(id, &request.options) {
            Ok((dir, loaded)) => {
                return Ok(self.into_handle(key, id, ResolutionAttempt::RemoteRepository, &dir, loaded))
            }
            Err(err) => {
                warn!("{err}");
                attempts.push(AttemptFailure {
                    attempt: ResolutionAttempt::RemoteRepository,
                    reason: err.to_string(),
                });
            }
        }

        let fallback = self.settings.fallback_model.as_str();
        let eligible = request.options.modality == ModalityTag::TextGeneration
            || id.to_lowercase().contains("qwen")
            || id.to_lowercase().contains("action");
        if eligible && !fallback.is_empty() && fallback != id {
            info!("Falling back to {fallback} for {id}");
            let options = LoadOptions {
                modality: ModalityTag::TextGeneration,
                ..request.options.on_cpu()
            };
            match self.load_remote(fallback, &options) {
                Ok((dir, loaded)) => {
                    return Ok(self.into_handle(
                        key,
                        fallback,
                        ResolutionAttempt::FallbackDefaultModel,
                        &dir,
                        loaded,
                    ))
                }
                Err(err) => attempts.push(AttemptFailure {
                    attempt: ResolutionAttempt::FallbackDefaultModel,
                    reason: err.to_string(),
                }),
            }
        }

        Err(ModelLoadError::AllAttemptsFailed {
            id: id.to_string(),
            attempts,
        })
    }

    fn load_remote(&self, id: &str, options: &LoadOptions) -> ModelResult<(PathBuf, LoadedModel)> {
        let unavailable = |reason: String| ModelLoadError::RemoteUnavailable {
            id: id.to_string(),
            reason,
        };

        let dir = match self.repository.resolve(id) {
            Ok(dir) => dir,
            Err(err) if self.settings.offline => {
                return Err(unavailable(format!("{err}; {}", RepositoryError::Offline(id.to_string()))))
            }
            Err(err) => {
                debug!("{err}, fetching");
                self.repository
                    .fetch(id, &self.settings.cache_dir)
                    .map_err(|e| unavailable(e.to_string()))?
            }
        };

        let loaded = self.load_from(id, &dir, options).map_err(unavailable)?;
        Ok((dir, loaded))
    }

    fn load_from(&self, id: &str, dir: &Path, options: &LoadOptions) -> Result<LoadedModel, String> {
        let artifact = ArtifactRef {
            id: id.to_string(),
            dir: dir.to_path_buf(),
        };
        let err = match self.runtime.load(&artifact, options) {
            Ok(loaded) => return Ok(loaded),
            Err(err) => format!("{err:#}"),
        };

        if options.forces_cpu() || !needs_cpu_retry(id, &err) {
            return Err(err);
        }
        warn!("Loading {id} failed ({err}), retrying on CPU");
        self.runtime
            .load(&artifact, &options.on_cpu())
            .map_err(|cpu_err| format!("{err}; CPU retry failed: {cpu_err:#}"))
    }

    fn into_handle(
        &self,
        key: &str,
        model_id: &str,
        source: ResolutionAttempt,
        dir: &Path,
        loaded: LoadedModel,
    ) -> ModelHandle {
        let LoadedModel { mut model, processor } = loaded;
        model.eval_mode();
        info!("Loaded {model_id} from {source} as {}", model.architecture());
        ModelHandle {
            key: key.to_string(),
            model_id: model_id.to_string(),
            source,
            artifact_dir: dir.to_path_buf(),
            architecture: model.architecture().to_string(),
            model: Mutex::new(model),
            processor,
        }
    }
}

fn needs_cpu_retry(id: &str, error: &str) -> bool {
    let id = id.to_lowercase();
    let error = error.to_lowercase();
    GPU_SENSITIVE_PATTERNS.iter().any(|p| id.contains(p))
        || error.contains("cuda")
        || error.contains("out of memory")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use anyhow::bail;
    use tempfile::TempDir;

    use super::*;
    use crate::inference::runtime::DevicePreference;

    struct EchoModel;

    impl RuntimeModel for EchoModel {
        fn architecture(&self) -> &str {
            "Echo"
        }

        fn run(&mut self, _input: RuntimeInput) -> Result<RuntimeOutput, GenerationError> {
            Ok(RuntimeOutput::Text("echo".into()))
        }
    }

    #[derive(Default)]
    struct CountingRuntime {
        loads: AtomicUsize,
        fail_accelerated: bool,
        fail_ids: Vec<&'static str>,
        seen: Mutex<Vec<(String, DevicePreference)>>,
    }

    impl ModelRuntime for CountingRuntime {
        fn load(&self, artifact: &ArtifactRef, options: &LoadOptions) -> anyhow::Result<LoadedModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            lock(&self.seen).push((artifact.id.clone(), options.device));
            thread::sleep(Duration::from_millis(20));
            if self.fail_ids.contains(&artifact.id.as_str()) {
                bail!("cannot load {}", artifact.id);
            }
            if self.fail_accelerated && options.device == DevicePreference::Accelerated {
                bail!("CUDA error: out of memory");
            }
            Ok(LoadedModel {
                model: Box::new(EchoModel),
                processor: None,
            })
        }
    }

    /// Every id resolves to a directory under the temp root
    struct DirRepository {
        root: PathBuf,
        missing: Vec<&'static str>,
        fetches: AtomicUsize,
    }

    impl ArtifactRepository for DirRepository {
        fn resolve(&self, id: &str) -> Result<PathBuf, RepositoryError> {
            Err(RepositoryError::NotCached(id.to_string()))
        }

        fn fetch(&self, id: &str, _cache_dir: &Path) -> Result<PathBuf, RepositoryError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.missing.contains(&id) {
                return Err(RepositoryError::Fetch {
                    id: id.to_string(),
                    reason: "404".into(),
                });
            }
            Ok(self.root.join(id.replace('/', "--")))
        }
    }

    fn cache_with(runtime: Arc<CountingRuntime>, missing: Vec<&'static str>, dir: &TempDir, capacity: usize) -> (ModelCache, Arc<DirRepository>) {
        let repository = Arc::new(DirRepository {
            root: dir.path().to_path_buf(),
            missing,
            fetches: AtomicUsize::new(0),
        });
        let settings = CacheSettings {
            cache_dir: dir.path().to_path_buf(),
            capacity,
            ..Default::default()
        };
        (ModelCache::new(repository.clone(), runtime, settings), repository)
    }

    fn request(id: &str, modality: ModalityTag) -> ModelRequest {
        ModelRequest::new(id, LoadOptions::new(modality, true, true))
    }

    #[test]
    fn concurrent_resolves_load_once() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(CountingRuntime::default());
        let (cache, _) = cache_with(runtime.clone(), vec![], &dir, 0);
        let cache = Arc::new(cache);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    cache
                        .resolve(&request("org/model", ModalityTag::TextGeneration))
                        .unwrap()
                })
            })
            .collect();
        let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(runtime.loads.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn queued_callers_share_a_failed_load() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(CountingRuntime {
            fail_ids: vec!["org/broken"],
            ..Default::default()
        });
        let (cache, _) = cache_with(runtime.clone(), vec![], &dir, 0);
        let cache = Arc::new(cache);
        let start = Arc::new(std::sync::Barrier::new(4));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    cache.resolve(&request("org/broken", ModalityTag::TextToSpeech))
                })
            })
            .collect();
        for worker in workers {
            assert!(worker.join().unwrap().is_err());
        }
        let first_round = runtime.loads.load(Ordering::SeqCst);
        assert!(first_round < 4, "{first_round} loads for 4 queued callers");

        // the failure is not remembered once the load is over
        assert!(cache.resolve(&request("org/broken", ModalityTag::TextToSpeech)).is_err());
        assert!(runtime.loads.load(Ordering::SeqCst) > first_round);
    }

    #[test]
    fn empty_local_directory_goes_remote() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("empty-model");
        std::fs::create_dir(&local).unwrap();
        let (cache, _) = cache_with(Arc::new(CountingRuntime::default()), vec![], &dir, 0);

        let req = request("org/model", ModalityTag::TextGeneration).with_local_path(Some(local.clone()));
        let handle = cache.resolve(&req).unwrap();
        assert_eq!(handle.source(), ResolutionAttempt::RemoteRepository);
        assert_eq!(handle.key(), local.to_string_lossy());
    }

    #[test]
    fn populated_local_directory_wins() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("model");
        std::fs::create_dir(&local).unwrap();
        std::fs::write(local.join("config.json"), "{}").unwrap();
        let (cache, repository) = cache_with(Arc::new(CountingRuntime::default()), vec![], &dir, 0);

        let req = request("org/model", ModalityTag::TextGeneration).with_local_path(Some(local));
        let handle = cache.resolve(&req).unwrap();
        assert_eq!(handle.source(), ResolutionAttempt::LocalDirectory);
        assert_eq!(repository.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsupported_architecture_never_loads() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(CountingRuntime::default());
        let (cache, _) = cache_with(runtime.clone(), vec![], &dir, 0);

        let err = cache
            .resolve(&request("microsoft/VibeVoice-1.5B", ModalityTag::TextToSpeech))
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::UnsupportedArchitecture { .. }));
        assert!(err.to_string().contains("microsoft/speecht5_tts"));
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn text_generation_falls_back_to_default_model() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(CountingRuntime {
            fail_ids: vec!["Qwen/Qwen3-0.6B"],
            ..Default::default()
        });
        let (cache, _) = cache_with(runtime, vec![], &dir, 0);

        let handle = cache
            .resolve(&request("Qwen/Qwen3-0.6B", ModalityTag::TextGeneration))
            .unwrap();
        assert_eq!(handle.source(), ResolutionAttempt::FallbackDefaultModel);
        assert_eq!(handle.model_id(), DEFAULT_FALLBACK_MODEL);
        assert_eq!(handle.key(), "Qwen/Qwen3-0.6B");
    }

    #[test]
    fn speech_models_do_not_fall_back() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with(
            Arc::new(CountingRuntime::default()),
            vec!["openai/whisper-base"],
            &dir,
            0,
        );

        let err = cache
            .resolve(&request("openai/whisper-base", ModalityTag::AutomaticSpeechRecognition))
            .err()
            .unwrap();
        match err {
            ModelLoadError::AllAttemptsFailed { attempts, .. } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].attempt, ResolutionAttempt::RemoteRepository);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn accelerator_failure_retries_on_cpu() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(CountingRuntime {
            fail_accelerated: true,
            ..Default::default()
        });
        let (cache, _) = cache_with(runtime.clone(), vec![], &dir, 0);

        let req = ModelRequest::new(
            "openai/whisper-base",
            LoadOptions::new(ModalityTag::AutomaticSpeechRecognition, false, true),
        );
        cache.resolve(&req).unwrap();
        let seen = lock(&runtime.seen).clone();
        assert_eq!(
            seen.iter().map(|(_, device)| *device).collect::<Vec<_>>(),
            vec![DevicePreference::Accelerated, DevicePreference::Cpu]
        );
    }

    #[test]
    fn offline_never_fetches() {
        let dir = TempDir::new().unwrap();
        let repository = Arc::new(DirRepository {
            root: dir.path().to_path_buf(),
            missing: vec![],
            fetches: AtomicUsize::new(0),
        });
        let settings = CacheSettings {
            offline: true,
            fallback_model: String::new(),
            ..Default::default()
        };
        let cache = ModelCache::new(repository.clone(), Arc::new(CountingRuntime::default()), settings);

        assert!(cache
            .resolve(&request("org/model", ModalityTag::TextGeneration))
            .is_err());
        assert_eq!(repository.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(CountingRuntime::default());
        let (cache, _) = cache_with(runtime.clone(), vec![], &dir, 2);

        cache.resolve(&request("org/a", ModalityTag::TextGeneration)).unwrap();
        cache.resolve(&request("org/b", ModalityTag::TextGeneration)).unwrap();
        // touch a so that b becomes the oldest
        cache.resolve(&request("org/a", ModalityTag::TextGeneration)).unwrap();
        cache.resolve(&request("org/c", ModalityTag::TextGeneration)).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("org/a"));
        assert!(!cache.contains("org/b"));
        assert!(cache.contains("org/c"));
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn preload_stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with(
            Arc::new(CountingRuntime::default()),
            vec!["openai/whisper-tiny"],
            &dir,
            0,
        );

        let requests = vec![
            request("openai/whisper-base", ModalityTag::AutomaticSpeechRecognition),
            request("openai/whisper-tiny", ModalityTag::AutomaticSpeechRecognition),
            request("openai/whisper-small", ModalityTag::AutomaticSpeechRecognition),
        ];
        assert!(cache.preload(&requests).is_err());
        assert!(cache.contains("openai/whisper-base"));
        assert!(!cache.contains("openai/whisper-small"));
    }

    #[test]
    fn cpu_retry_patterns() {
        assert!(needs_cpu_retry("mPLUG/GUI-Owl-7B", "weights mismatch"));
        assert!(needs_cpu_retry("org/small", "CUDA driver version is insufficient"));
        assert!(!needs_cpu_retry("org/small", "missing config.json"));
    }
}
