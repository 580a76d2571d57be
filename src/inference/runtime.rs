//! The seam between request handling and whatever executes the models.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::dispatch::ModalityTag;
use crate::error::GenerationError;

/// A model artifact that is present on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub id: String,
    pub dir: PathBuf,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cpu,
    Accelerated,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub modality: ModalityTag,
    pub device: DevicePreference,
    pub precision: Precision,
    pub local_files_only: bool,
    pub trust_remote_code: bool,
}

impl LoadOptions {
    /// `cpu_optimize` selects cpu + f32, otherwise an accelerator with f16 weights is preferred
    pub fn new(modality: ModalityTag, cpu_optimize: bool, trust_remote_code: bool) -> Self {
        let (device, precision) = if cpu_optimize {
            (DevicePreference::Cpu, Precision::F32)
        } else {
            (DevicePreference::Accelerated, Precision::F16)
        };
        Self {
            modality,
            device,
            precision,
            local_files_only: false,
            trust_remote_code,
        }
    }

    pub fn forces_cpu(&self) -> bool {
        self.device == DevicePreference::Cpu
    }

    pub fn on_cpu(&self) -> Self {
        Self {
            device: DevicePreference::Cpu,
            precision: Precision::F32,
            ..self.clone()
        }
    }

    pub fn local_only(&self) -> Self {
        Self {
            local_files_only: true,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: Option<usize>,
    pub repeat_penalty: f32,
    pub num_beams: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 250,
            temperature: 0.7,
            top_p: 0.9,
            top_k: Some(50),
            repeat_penalty: 1.1,
            num_beams: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RuntimeInput {
    Prompt {
        text: String,
        sampling: SamplingParams,
    },
    Tokens {
        ids: Vec<u32>,
        sampling: SamplingParams,
    },
    /// Mono samples at `sample_rate`
    Audio {
        samples: Vec<f32>,
        sample_rate: u32,
    },
    Image {
        image: RgbImage,
        prompt: Option<String>,
        sampling: SamplingParams,
    },
    /// A single user turn carrying an image and its text, rendered with the
    /// model's own chat template
    Chat {
        image: RgbImage,
        text: String,
        sampling: SamplingParams,
    },
    Speech {
        text: String,
        voice: Option<String>,
        vocoder: Option<String>,
    },
}

impl RuntimeInput {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeInput::Prompt { .. } => "prompt",
            RuntimeInput::Tokens { .. } => "tokens",
            RuntimeInput::Audio { .. } => "audio",
            RuntimeInput::Image { .. } => "image",
            RuntimeInput::Chat { .. } => "chat",
            RuntimeInput::Speech { .. } => "speech",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeOutput {
    Text(String),
    Tokens(Vec<u32>),
    Waveform { samples: Vec<f32>, sample_rate: u32 },
}

impl fmt::Display for RuntimeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeOutput::Text(text) => f.write_str(text),
            RuntimeOutput::Tokens(ids) => write!(f, "{} tokens", ids.len()),
            RuntimeOutput::Waveform {
                samples,
                sample_rate,
            } => write!(f, "{} samples at {sample_rate} Hz", samples.len()),
        }
    }
}

/// A loaded model. Execution mutates internal state such as KV caches,
/// hence `&mut self`.
pub trait RuntimeModel: Send {
    fn architecture(&self) -> &str;

    fn run(&mut self, input: RuntimeInput) -> Result<RuntimeOutput, GenerationError>;

    /// Switches off training-only behaviour. Most backends only ever run inference.
    fn eval_mode(&mut self) {}
}

pub struct LoadedModel {
    pub model: Box<dyn RuntimeModel>,
    pub processor: Option<Tokenizer>,
}

pub trait ModelRuntime: Send + Sync {
    fn load(&self, artifact: &ArtifactRef, options: &LoadOptions) -> Result<LoadedModel>;
}
