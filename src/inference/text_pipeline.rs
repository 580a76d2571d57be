use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Llama, LlamaConfig};
use candle_transformers::models::quantized_llama::ModelWeights;
use rand::random;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::inference::runtime::SamplingParams;

/// End of sequence markers used by the llama-family chat checkpoints
const EOS_TOKENS: [&str; 5] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>", "<|end_of_text|>"];

// Adapted from
// https://github.com/huggingface/candle/blob/main/candle-examples/examples/llama/main.rs
// https://github.com/huggingface/candle/blob/main/candle-examples/examples/quantized/main.rs
pub struct TextGeneratorPipeline {
    model: Model,
    device: Device,
    eos_tokens: Vec<u32>,
    repeat_context_size: usize,
}

pub enum Model {
    Quantized(ModelWeights),
    Llama {
        model: Llama,
        config: candle_transformers::models::llama::Config,
        dtype: DType,
    },
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

impl TextGeneratorPipeline {
    pub fn with_quantized_gguf(
        gguf_path: &Path,
        tokenizer: &Tokenizer,
        device: &Device,
    ) -> Result<TextGeneratorPipeline> {
        let mut file = std::fs::File::open(gguf_path)?;
        let model_reader =
            gguf_file::Content::read(&mut file).map_err(|e| e.with_path(gguf_path))?;
        let weights = ModelWeights::from_gguf(model_reader, &mut file, device)?;
        info!("Loaded quantized weights from {}", gguf_path.display());

        Ok(TextGeneratorPipeline {
            model: Model::Quantized(weights),
            device: device.clone(),
            eos_tokens: eos_tokens(tokenizer),
            repeat_context_size: 64,
        })
    }

    pub fn with_safetensors(
        dir: &Path,
        tokenizer: &Tokenizer,
        device: &Device,
        dtype: DType,
    ) -> Result<TextGeneratorPipeline> {
        let config_file = dir.join("config.json");
        let config: LlamaConfig = serde_json::from_slice(&std::fs::read(&config_file)?)
            .with_context(|| format!("Invalid llama config {}", config_file.display()))?;
        let config = config.into_config(false);

        let files = safetensors_files(dir)?;
        debug!("Mapping {} safetensors files", files.len());
        // the files stay mapped for the lifetime of the model
        let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(&files, dtype, device)? };
        let model = Llama::load(vb, &config)?;

        Ok(TextGeneratorPipeline {
            model: Model::Llama {
                model,
                config,
                dtype,
            },
            device: device.clone(),
            eos_tokens: eos_tokens(tokenizer),
            repeat_context_size: 64,
        })
    }

    /// Samples up to `sampling.max_new_tokens` tokens after `prompt` and
    /// returns only the generated ones.
    pub fn generate(&mut self, prompt: &[u32], sampling: &SamplingParams) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            bail!("Prompt is empty");
        }
        if sampling.num_beams > 1 {
            debug!("Beam search is not available, sampling a single sequence");
        }

        let mut logits_processor =
            LogitsProcessor::from_sampling(random(), to_sampling(sampling));
        let mut cache = match &self.model {
            Model::Llama { config, dtype, .. } => {
                Some(Cache::new(true, *dtype, config, &self.device)?)
            }
            Model::Quantized(_) => None,
        };

        let mut tokens = prompt.to_vec();
        let mut generated = Vec::new();
        let start_gen = std::time::Instant::now();
        for index in 0..sampling.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = match (&mut self.model, cache.as_mut()) {
                (Model::Quantized(model), _) => model.forward(&input, start_pos)?,
                (Model::Llama { model, .. }, Some(cache)) => model.forward(&input, start_pos, cache)?,
                (Model::Llama { .. }, None) => bail!("Model not initialized"),
            };
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = if (sampling.repeat_penalty - 1.).abs() < f32::EPSILON {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(self.repeat_context_size);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    sampling.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next_token = logits_processor.sample(&logits)?;
            if self.eos_tokens.contains(&next_token) {
                break;
            }
            tokens.push(next_token);
            generated.push(next_token);
        }
        debug!(
            "Generated {} tokens in {:.2}s",
            generated.len(),
            start_gen.elapsed().as_secs_f64()
        );

        Ok(generated)
    }
}

fn to_sampling(params: &SamplingParams) -> Sampling {
    if params.temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    match params.top_k {
        Some(k) => Sampling::TopKThenTopP {
            k,
            p: params.top_p,
            temperature: params.temperature,
        },
        None => Sampling::TopP {
            p: params.top_p,
            temperature: params.temperature,
        },
    }
}

fn eos_tokens(tokenizer: &Tokenizer) -> Vec<u32> {
    let vocab = tokenizer.get_vocab(true);
    EOS_TOKENS
        .iter()
        .filter_map(|token| vocab.get(*token).copied())
        .collect()
}

/// The shards listed in `model.safetensors.index.json`, or every
/// `.safetensors` file in `dir`.
pub fn safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let index = dir.join("model.safetensors.index.json");
    if index.is_file() {
        let index: SafetensorsIndex = serde_json::from_slice(&std::fs::read(&index)?)?;
        let shards: BTreeSet<&String> = index.weight_map.values().collect();
        return Ok(shards.into_iter().map(|shard| dir.join(shard)).collect());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "safetensors"))
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("No safetensors weights found in {}", dir.display());
    }
    Ok(files)
}

pub fn find_gguf(dir: &Path) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "gguf"))
        .collect();
    files.sort();
    files.into_iter().next()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn zero_temperature_is_greedy() {
        let params = SamplingParams {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(matches!(to_sampling(&params), Sampling::ArgMax));
        assert!(matches!(
            to_sampling(&SamplingParams::default()),
            Sampling::TopKThenTopP { k: 50, .. }
        ));
    }

    #[test]
    fn sharded_weights_follow_the_index() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();

        let files = safetensors_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors")
            ]
        );
    }

    #[test]
    fn missing_weights() {
        let dir = TempDir::new().unwrap();
        assert!(safetensors_files(dir.path()).is_err());
        assert!(find_gguf(dir.path()).is_none());
    }
}
