use tracing::{debug, info};

use crate::cache::ModelHandle;
use crate::dispatch::ModalityTag;
use crate::error::GenerationError;
use crate::error_result;
use crate::inference::runtime::{RuntimeInput, RuntimeOutput, SamplingParams};
use crate::inference::task::{preview, TaskContext, TaskHandler, TaskRequest};
use crate::recovery::RecoveryChain;

const MAX_INPUT_TOKENS: usize = 256;
const FAST_MAX_INPUT_TOKENS: usize = 128;
const MAX_NEW_TOKENS: usize = 500;
const FAST_MAX_NEW_TOKENS: usize = 20;
const GENERATE_STEP: &str = "generate";

pub struct TextGenerationHandler;

impl TextGenerationHandler {
    fn sampling(request: &TaskRequest) -> SamplingParams {
        let max_new_tokens = if request.options.fast_mode {
            FAST_MAX_NEW_TOKENS
        } else {
            request.options.max_length.min(MAX_NEW_TOKENS)
        };
        SamplingParams {
            max_new_tokens,
            top_k: Some(50),
            repeat_penalty: 1.1,
            ..request.options.sampling()
        }
    }

    /// The second attempt samples more freely for a short continuation
    fn retry_sampling(sampling: &SamplingParams) -> SamplingParams {
        SamplingParams {
            max_new_tokens: 50,
            temperature: 1.0,
            top_p: 0.95,
            ..sampling.clone()
        }
    }
}

/// Prompt token ids truncated to `max_tokens`, or `None` without a tokenizer
fn encode_prompt(
    handle: &ModelHandle,
    text: &str,
    max_tokens: usize,
) -> Result<Option<Vec<u32>>, GenerationError> {
    let Some(tokenizer) = handle.processor() else {
        return Ok(None);
    };
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| GenerationError::Runtime(e.to_string()))?;
    let mut ids = encoding.get_ids().to_vec();
    if ids.len() > max_tokens {
        debug!("Truncating prompt from {} to {max_tokens} tokens", ids.len());
        ids.truncate(max_tokens);
    }
    Ok(Some(ids))
}

fn generate(
    handle: &ModelHandle,
    prompt: &str,
    prompt_ids: Option<&[u32]>,
    sampling: SamplingParams,
) -> Result<String, GenerationError> {
    let input = match prompt_ids {
        Some(ids) => RuntimeInput::Tokens {
            ids: ids.to_vec(),
            sampling,
        },
        None => RuntimeInput::Prompt {
            text: prompt.to_string(),
            sampling,
        },
    };

    let text = match handle.run(input)? {
        RuntimeOutput::Tokens(ids) => match handle.processor() {
            Some(tokenizer) => tokenizer
                .decode(&ids, true)
                .map_err(|e| GenerationError::Runtime(e.to_string()))?,
            None => {
                return Err(GenerationError::Runtime(
                    "token output without a tokenizer to decode it".to_string(),
                ))
            }
        },
        RuntimeOutput::Text(text) => text,
        other => {
            return Err(GenerationError::Runtime(format!(
                "expected generated text, got {other}"
            )))
        }
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(GenerationError::EmptyOutput);
    }
    Ok(text.to_string())
}

impl TaskHandler for TextGenerationHandler {
    fn modality(&self) -> ModalityTag {
        ModalityTag::TextGeneration
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model_id))]
    fn run_task(&self, context: &TaskContext<'_>, request: &TaskRequest) -> String {
        let clean_input = request.raw_input.trim();
        if clean_input.is_empty() {
            return error_result!("Empty input provided");
        }

        let handle = match context
            .cache
            .resolve(&request.model_request(ModalityTag::TextGeneration))
        {
            Ok(handle) => handle,
            Err(err) => return error_result!("Text generation failed - {}", err),
        };

        let max_input = if request.options.fast_mode {
            FAST_MAX_INPUT_TOKENS
        } else {
            MAX_INPUT_TOKENS
        };
        let prompt_ids = match encode_prompt(&handle, clean_input, max_input) {
            Ok(ids) => ids,
            Err(err) => return error_result!("Text generation failed - {}", err),
        };

        let sampling = Self::sampling(request);
        let retry = Self::retry_sampling(&sampling);
        info!(
            "Generating up to {} tokens with {}",
            sampling.max_new_tokens,
            handle.model_id()
        );

        // only an empty first result earns a resample
        RecoveryChain::new("text-generation")
            .halt_on(|err| !matches!(err, GenerationError::EmptyOutput))
            .step(GENERATE_STEP, || {
                generate(&handle, clean_input, prompt_ids.as_deref(), sampling)
            })
            .step("resample", || {
                generate(&handle, clean_input, prompt_ids.as_deref(), retry)
            })
            .run(|failures| match failures.last() {
                Some(failure) if matches!(failure.error, GenerationError::EmptyOutput) => format!(
                    "Model processed input but generated no additional text. Input was: {}...",
                    preview(clean_input, 50)
                ),
                Some(failure) if failure.step == GENERATE_STEP => error_result!(
                    "Text generation failed for {}: {}",
                    request.model_id,
                    failure.error
                ),
                Some(failure) => format!(
                    "Text generation completed with technical issues: {}",
                    failure.error
                ),
                None => error_result!("Text generation failed for {}", request.model_id),
            })
            .into_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::model_config::GenerationOptions;

    fn request(options: GenerationOptions) -> TaskRequest {
        TaskRequest {
            raw_input: "hello".into(),
            parsed: crate::dispatch::parse("hello", ModalityTag::TextGeneration),
            model_id: "org/model".into(),
            local_path: None,
            options,
        }
    }

    #[test]
    fn caps_new_tokens() {
        let options = GenerationOptions {
            max_length: 2000,
            ..Default::default()
        };
        let sampling = TextGenerationHandler::sampling(&request(options));
        assert_eq!(sampling.max_new_tokens, 500);
        assert_eq!(sampling.top_k, Some(50));
    }

    #[test]
    fn fast_mode_generates_little() {
        let options = GenerationOptions {
            fast_mode: true,
            ..Default::default()
        };
        let sampling = TextGenerationHandler::sampling(&request(options));
        assert_eq!(sampling.max_new_tokens, 20);

        let retry = TextGenerationHandler::retry_sampling(&sampling);
        assert_eq!(retry.max_new_tokens, 50);
        assert_eq!(retry.temperature, 1.0);
        assert_eq!(retry.top_p, 0.95);
    }
}
