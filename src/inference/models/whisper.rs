use anyhow::Result;
use candle_core::{DType, Device};
use candle_transformers::models::whisper::SAMPLE_RATE;
use tokenizers::Tokenizer;

use crate::error::GenerationError;
use crate::inference::audio_pipeline::AudioGeneratorPipeline;
use crate::inference::runtime::{ArtifactRef, RuntimeInput, RuntimeModel, RuntimeOutput};

// Adapted from https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
pub struct WhisperModel {
    architecture: String,
    generator_pipeline: AudioGeneratorPipeline,
}

impl WhisperModel {
    #[tracing::instrument(level = "info", skip(device))]
    pub fn new(artifact: &ArtifactRef, architecture: String, device: &Device, dtype: DType) -> Result<Self> {
        let generator_pipeline = AudioGeneratorPipeline::load(&artifact.dir, device, dtype)?;

        Ok(Self {
            architecture,
            generator_pipeline,
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        self.generator_pipeline.tokenizer()
    }
}

impl RuntimeModel for WhisperModel {
    fn architecture(&self) -> &str {
        &self.architecture
    }

    #[tracing::instrument(level = "info", skip(self, input), fields(input = input.kind()))]
    fn run(&mut self, input: RuntimeInput) -> Result<RuntimeOutput, GenerationError> {
        let kind = input.kind();
        let RuntimeInput::Audio {
            samples,
            sample_rate,
        } = input
        else {
            return Err(GenerationError::MissingCapability(format!(
                "{kind} input is not supported by {}",
                self.architecture
            )));
        };
        if sample_rate as usize != SAMPLE_RATE {
            return Err(GenerationError::Runtime(format!(
                "Input audio must have a {SAMPLE_RATE} Hz sampling rate, got {sample_rate} Hz"
            )));
        }

        let segments = self.generator_pipeline.transcribe(&samples)?;
        let text = segments
            .iter()
            .map(|segment| segment.dr.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(RuntimeOutput::Text(text))
    }
}
