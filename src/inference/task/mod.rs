//! Modality handlers.
//!
//! A handler turns one request into one result string. Failures never escape
//! as errors: they are rendered with an `ERROR:` prefix so the caller always
//! receives a single printable line.

use std::path::{Path, PathBuf};

use crate::cache::{ModelCache, ModelRequest};
use crate::dispatch::{ModalityTag, ParsedInput};
use crate::error::{GenerationError, ParseError};
use crate::inference::model_config::GenerationOptions;
use crate::inference::runtime::{LoadOptions, RuntimeOutput};
use crate::media::MediaCodec;

pub mod caption;
pub mod generate;
pub mod speech;
pub mod transcribe;
pub mod vision;

pub use caption::CaptionHandler;
pub use generate::TextGenerationHandler;
pub use speech::SpeechSynthesisHandler;
pub use transcribe::TranscribeHandler;
pub use vision::VisionLanguageHandler;

#[derive(Debug)]
pub struct TaskRequest {
    pub raw_input: String,
    /// Payload segments, or why no usable media was found
    pub parsed: Result<ParsedInput, ParseError>,
    /// Canonical model id
    pub model_id: String,
    pub local_path: Option<PathBuf>,
    pub options: GenerationOptions,
}

impl TaskRequest {
    pub fn model_request(&self, modality: ModalityTag) -> ModelRequest {
        let options = LoadOptions::new(
            modality,
            self.options.cpu_optimize,
            self.options.trust_remote_code,
        );
        ModelRequest::new(self.model_id.clone(), options).with_local_path(self.local_path.clone())
    }
}

/// Services shared by every handler
pub struct TaskContext<'a> {
    pub cache: &'a ModelCache,
    pub codec: &'a dyn MediaCodec,
    /// Where synthesized speech is written
    pub audio_output_dir: &'a Path,
}

pub trait TaskHandler: Send + Sync {
    fn modality(&self) -> ModalityTag;

    fn run_task(&self, context: &TaskContext<'_>, request: &TaskRequest) -> String;
}

/// The handler serving `modality`, if there is one
pub fn handler_for(modality: ModalityTag) -> Option<&'static dyn TaskHandler> {
    match modality {
        ModalityTag::TextGeneration => Some(&TextGenerationHandler),
        ModalityTag::AutomaticSpeechRecognition => Some(&TranscribeHandler),
        ModalityTag::ImageToText => Some(&CaptionHandler),
        ModalityTag::TextToSpeech => Some(&SpeechSynthesisHandler),
        ModalityTag::VisionLanguage => Some(&VisionLanguageHandler),
        _ => None,
    }
}

pub(crate) fn expect_text(output: RuntimeOutput) -> Result<String, GenerationError> {
    match output {
        RuntimeOutput::Text(text) => Ok(text),
        other => Err(GenerationError::Runtime(format!(
            "expected text output, got {other}"
        ))),
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Drops a leading `<stem>: ` or `<file name>: ` that some models echo back.
pub(crate) fn strip_file_echo<'a>(text: &'a str, path: &Path) -> &'a str {
    let name = file_name(path);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    for prefix in [format!("{stem}: "), format!("{name}: ")] {
        if let Some(rest) = text.strip_prefix(prefix.as_str()) {
            return rest;
        }
    }
    text
}

/// One result is returned as is, several are separated by a blank line.
pub(crate) fn join_per_file(results: Vec<String>) -> String {
    results.join("\n\n")
}

pub(crate) fn preview(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}
