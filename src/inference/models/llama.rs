use anyhow::Result;
use candle_core::{DType, Device};
use tokenizers::Tokenizer;

use crate::error::GenerationError;
use crate::inference::runtime::{ArtifactRef, RuntimeInput, RuntimeModel, RuntimeOutput};
use crate::inference::text_pipeline::{find_gguf, TextGeneratorPipeline};

/// Llama-family causal language model, quantized GGUF or safetensors
pub struct LlamaModel {
    architecture: String,
    tokenizer: Tokenizer,
    generator_pipeline: TextGeneratorPipeline,
}

impl LlamaModel {
    #[tracing::instrument(level = "info", skip(tokenizer, device))]
    pub fn new(
        artifact: &ArtifactRef,
        architecture: String,
        tokenizer: Tokenizer,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let generator_pipeline = match find_gguf(&artifact.dir) {
            Some(gguf) => TextGeneratorPipeline::with_quantized_gguf(&gguf, &tokenizer, device)?,
            None => TextGeneratorPipeline::with_safetensors(&artifact.dir, &tokenizer, device, dtype)?,
        };

        Ok(Self {
            architecture,
            tokenizer,
            generator_pipeline,
        })
    }
}

impl RuntimeModel for LlamaModel {
    fn architecture(&self) -> &str {
        &self.architecture
    }

    #[tracing::instrument(level = "info", skip(self, input), fields(input = input.kind()))]
    fn run(&mut self, input: RuntimeInput) -> Result<RuntimeOutput, GenerationError> {
        match input {
            RuntimeInput::Tokens { ids, sampling } => {
                let generated = self.generator_pipeline.generate(&ids, &sampling)?;
                Ok(RuntimeOutput::Tokens(generated))
            }
            RuntimeInput::Prompt { text, sampling } => {
                let encoding = self
                    .tokenizer
                    .encode(text, true)
                    .map_err(|e| GenerationError::Runtime(e.to_string()))?;
                let generated = self.generator_pipeline.generate(encoding.get_ids(), &sampling)?;
                let text = self
                    .tokenizer
                    .decode(&generated, true)
                    .map_err(|e| GenerationError::Runtime(e.to_string()))?;
                Ok(RuntimeOutput::Text(text))
            }
            other => Err(GenerationError::MissingCapability(format!(
                "{} input is not supported by {}",
                other.kind(),
                self.architecture
            ))),
        }
    }
}
