use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::dispatch::classify::ModalityTag;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("No valid {} paths found for {modality} (examined {examined} input parts)", media_kind(.modality))]
    NoValidMediaFound {
        modality: ModalityTag,
        examined: usize,
    },
}

fn media_kind(modality: &ModalityTag) -> &'static str {
    match modality {
        ModalityTag::AutomaticSpeechRecognition => "audio file",
        _ => "image file",
    }
}

/// Where a resolution attempt was directed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionAttempt {
    LocalDirectory,
    RemoteRepository,
    FallbackDefaultModel,
}

impl fmt::Display for ResolutionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionAttempt::LocalDirectory => write!(f, "local directory"),
            ResolutionAttempt::RemoteRepository => write!(f, "remote repository"),
            ResolutionAttempt::FallbackDefaultModel => write!(f, "fallback default model"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub attempt: ResolutionAttempt,
    pub reason: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.attempt, self.reason)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ModelLoadError {
    #[error("Local model directory {path:?} could not be loaded: {reason}")]
    LocalInvalid { path: PathBuf, reason: String },

    #[error("Model {id} is not available from the artifact repository: {reason}")]
    RemoteUnavailable { id: String, reason: String },

    #[error("The {id} model architecture is not supported. Please try using an alternative model like {suggestion}.")]
    UnsupportedArchitecture { id: String, suggestion: String },

    #[error("Failed to load model {id}. {}", join_attempts(.attempts))]
    AllAttemptsFailed {
        id: String,
        attempts: Vec<AttemptFailure>,
    },
}

fn join_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("token/feature count mismatch: {0}")]
    TokenFeatureMismatch(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("missing capability: {0}")]
    MissingCapability(String),

    #[error("model produced no output")]
    EmptyOutput,

    #[error("{0}")]
    Runtime(String),
}

impl GenerationError {
    /// Sorts a runtime failure message by its signature.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("tokens") && lower.contains("features") {
            GenerationError::TokenFeatureMismatch(message)
        } else if lower.contains("out of memory")
            || lower
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|word| word == "oom")
        {
            GenerationError::OutOfMemory(message)
        } else if (lower.contains("generate") && lower.contains("attribute"))
            || lower.contains("not supported by")
        {
            GenerationError::MissingCapability(message)
        } else {
            GenerationError::Runtime(message)
        }
    }
}

impl From<anyhow::Error> for GenerationError {
    fn from(err: anyhow::Error) -> Self {
        GenerationError::classify(format!("{err:#}"))
    }
}

impl From<candle_core::Error> for GenerationError {
    fn from(err: candle_core::Error) -> Self {
        GenerationError::classify(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("audio codec unavailable: {0}")]
    MissingCodec(String),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0} is not present in the local artifact cache")]
    NotCached(String),

    #[error("offline mode prevents fetching {0}")]
    Offline(String),

    #[error("failed to fetch {id}: {reason}")]
    Fetch { id: String, reason: String },
}

pub type ModelResult<T, E = ModelLoadError> = Result<T, E>;

/// Builds a handler result string carrying the `ERROR:` prefix.
#[macro_export]
macro_rules! error_result {
    ($msg:expr) => {
        format!("ERROR: {}", $msg)
    };
    ($fmt:expr $(, $arg:expr)*) => {
        format!(concat!("ERROR: ", $fmt) $(, $arg)*)
    };
}
