//! Runs one request end to end: id mapping, classification, artifact
//! warm-up, parsing, handler execution and output normalization.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cache::{ModelCache, ModelRequest};
use crate::dispatch::{canonical_id, classify, normalize, parse, ModalityTag};
use crate::inference::model_config::GenerationOptions;
use crate::inference::runtime::LoadOptions;
use crate::inference::task::{handler_for, TaskContext, TaskRequest};
use crate::media::MediaCodec;
use crate::repository::is_non_empty_dir;

#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub model_id: String,
    pub input: String,
    pub local_model_path: Option<PathBuf>,
    pub options: GenerationOptions,
    /// Models to load before the request is handled
    pub preload_models: Vec<String>,
}

impl DispatchRequest {
    pub fn new(model_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            input: input.into(),
            ..Default::default()
        }
    }

    fn has_local_model(&self) -> bool {
        self.local_model_path
            .as_deref()
            .is_some_and(is_non_empty_dir)
    }
}

pub struct Dispatcher {
    cache: ModelCache,
    codec: Arc<dyn MediaCodec>,
    audio_output_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(cache: ModelCache, codec: Arc<dyn MediaCodec>, audio_output_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            codec,
            audio_output_dir: audio_output_dir.into(),
        }
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Preloads, dispatches and normalizes. Only a failed preload is an error,
    /// every other failure is part of the returned line.
    pub fn run(&self, request: &DispatchRequest) -> Result<String> {
        if !request.preload_models.is_empty() {
            self.preload(&request.preload_models, &request.options)?;
        }
        Ok(normalize(&self.dispatch(request)))
    }

    /// Loads each model under the modality its id classifies as.
    pub fn preload(&self, model_ids: &[String], options: &GenerationOptions) -> Result<usize> {
        let requests: Vec<ModelRequest> = model_ids
            .iter()
            .map(|id| {
                let id = canonical_id(id);
                let load_options =
                    LoadOptions::new(classify(&id), options.cpu_optimize, options.trust_remote_code);
                ModelRequest::new(id, load_options)
            })
            .collect();
        Ok(self.cache.preload(&requests)?)
    }

    /// The raw handler result, before normalization.
    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model_id))]
    pub fn dispatch(&self, request: &DispatchRequest) -> String {
        // a local directory belongs to the id as given, so it is never remapped
        let has_local_model = request.has_local_model();
        let model_id = if has_local_model {
            request.model_id.clone()
        } else {
            canonical_id(&request.model_id)
        };
        if model_id != request.model_id {
            info!("Setting up model: {} -> {model_id}", request.model_id);
        }

        if !has_local_model && !request.options.fast_mode && !request.options.offline_mode {
            self.warm_up(&model_id);
        }

        let modality = classify(&model_id);
        info!("Processing {modality}: {} chars", request.input.len());
        if request.options.batch_size > 1 {
            debug!(
                "batch_size {} accepted, inputs are processed one at a time",
                request.options.batch_size
            );
        }

        let Some(handler) = handler_for(modality) else {
            warn!("No handler for {modality}, returning a basic response");
            return basic_response(modality, &request.input, &model_id);
        };

        let task = TaskRequest {
            raw_input: request.input.clone(),
            parsed: parse(&request.input, modality),
            model_id,
            local_path: request.local_model_path.clone(),
            options: request.options.clone(),
        };
        let context = TaskContext {
            cache: &self.cache,
            codec: self.codec.as_ref(),
            audio_output_dir: &self.audio_output_dir,
        };
        let result = handler.run_task(&context, &task);
        info!("Execution completed, result length: {}", result.len());
        result
    }

    /// Re-downloads an artifact whose cached copy looks incomplete. Failures
    /// are left for model resolution to report.
    fn warm_up(&self, model_id: &str) {
        let repository = self.cache.repository();
        let status = repository.cache_status(model_id);
        if status.is_valid() {
            debug!(
                "{model_id} is cached: {} valid files, {} bytes",
                status.valid_files, status.total_bytes
            );
            return;
        }

        info!("Downloading model {model_id}");
        match repository.force_fetch(model_id, &self.cache.settings().cache_dir) {
            Ok(path) => info!("{model_id} downloaded to {}", path.display()),
            Err(err) => warn!("Download of {model_id} failed: {err}"),
        }
    }
}

fn basic_response(modality: ModalityTag, input: &str, model_id: &str) -> String {
    format!("Model type '{modality}' not fully implemented yet. Basic response: Processed '{input}' with {model_id}")
}
