#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_transformers::models::whisper::{
    self, audio, Config, COMPRESSION_RATIO_THRESHOLD, EOT_TOKEN, HOP_LENGTH, LOGPROB_THRESHOLD,
    NO_SPEECH_THRESHOLD, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SAMPLE_RATE, SOT_TOKEN,
    TEMPERATURES, TRANSCRIBE_TOKEN,
};
use candle_transformers::quantized_var_builder;
use rand::distributions::Distribution;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, error};

use crate::inference::mel::load_mel_filters;
use crate::inference::text_pipeline::find_gguf;

/// Multilingual checkpoints have a vocabulary of at least this size
const MULTILINGUAL_VOCAB_SIZE: usize = 51865;

pub enum Model {
    Normal(whisper::model::Whisper),
    Quantized(whisper::quantized_model::Whisper),
}

impl Model {
    fn config(&self) -> &Config {
        match self {
            Model::Normal(m) => &m.config,
            Model::Quantized(m) => &m.config,
        }
    }

    fn encoder_forward(&mut self, x: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.encoder.forward(x, flush),
            Model::Quantized(m) => m.encoder.forward(x, flush),
        }
    }

    fn decoder_forward(&mut self, x: &Tensor, xa: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.decoder.forward(x, xa, flush),
            Model::Quantized(m) => m.decoder.forward(x, xa, flush),
        }
    }

    fn decoder_final_linear(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.decoder.final_linear(x),
            Model::Quantized(m) => m.decoder.final_linear(x),
        }
    }
}

// Adapted from https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
pub struct AudioGeneratorPipeline {
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    mel_filters: Vec<f32>,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    language_token: Option<u32>,
    rng: rand::rngs::StdRng,
}

impl AudioGeneratorPipeline {
    /// Loads `config.json`, `tokenizer.json` and either a GGUF file or
    /// safetensors weights from `dir`.
    pub fn load(dir: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let config: Config = serde_json::from_str(&std::fs::read_to_string(dir.join("config.json"))?)?;
        let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json")).map_err(anyhow::Error::msg)?;

        let (model, dtype) = match find_gguf(dir) {
            Some(gguf) => {
                let vb = quantized_var_builder::VarBuilder::from_gguf(gguf, device)?;
                (Model::Quantized(whisper::quantized_model::Whisper::load(&vb, config.clone())?), DType::F32)
            }
            None => {
                let weights = dir.join("model.safetensors");
                if !weights.is_file() {
                    bail!("No whisper weights found in {}", dir.display());
                }
                // the weights stay mapped for the lifetime of the model
                let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
                (Model::Normal(whisper::model::Whisper::load(&vb, config.clone())?), dtype)
            }
        };

        let mel_filters = load_mel_filters(dir, config.num_mel_bins)?;

        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        let suppress_tokens: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), device)?;
        let sot_token = token_id(&tokenizer, SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, TRANSCRIBE_TOKEN)?;
        let eot_token = token_id(&tokenizer, EOT_TOKEN)?;
        let Some(no_speech_token) = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok())
        else {
            bail!("Unable to find any non-speech token")
        };
        let language_token = if config.vocab_size >= MULTILINGUAL_VOCAB_SIZE {
            token_id(&tokenizer, "<|en|>").ok()
        } else {
            None
        };

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            dtype,
            mel_filters,
            suppress_tokens,
            sot_token,
            transcribe_token,
            eot_token,
            no_speech_token,
            no_timestamps_token,
            language_token,
            rng: rand::rngs::StdRng::seed_from_u64(299_792_458),
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Transcribes mono 16 kHz samples, skipping windows without speech.
    pub fn transcribe(&mut self, pcm_data: &[f32]) -> Result<Vec<Segment>> {
        let mel = self.load_mel(pcm_data)?;
        let (_, _, content_frames) = mel.dims3()?;
        let mut seek = 0;
        let mut segments = vec![];

        while seek < content_frames {
            let time_offset = (seek * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let segment_size = usize::min(content_frames - seek, whisper::N_FRAMES);
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let segment_duration = (segment_size * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let dr = self.decode_with_fallback(&mel_segment)?;
            seek += segment_size;
            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!("no speech detected, skipping {seek} {dr:?}");
                continue;
            }
            segments.push(Segment {
                start: time_offset,
                duration: segment_duration,
                dr,
            });
        }
        Ok(segments)
    }

    fn decode_with_fallback(&mut self, segment: &Tensor) -> Result<DecodingResult> {
        let mut last_error = None;
        for (i, &t) in TEMPERATURES.iter().enumerate() {
            let dr = self.decode(segment, t);
            if i == TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    let needs_fallback = dr.compression_ratio > COMPRESSION_RATIO_THRESHOLD
                        || dr.avg_logprob < LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => {
                    error!("Error running at {t}: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("No decoding temperatures configured")))
    }

    fn decode(&mut self, mel: &Tensor, t: f64) -> Result<DecodingResult> {
        let audio_features = self.model.encoder_forward(mel, true)?;
        debug!("audio features: {:?}", audio_features.dims());

        let max_target_positions = self.model.config().max_target_positions;
        let sample_len = max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![self.sot_token];
        if let Some(language_token) = self.language_token {
            tokens.push(language_token);
        }
        tokens.push(self.transcribe_token);
        tokens.push(self.no_timestamps_token);

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?;

            // The model expects a batch dim but this inference loop does not handle
            // it so we add it at this point.
            let tokens_t = tokens_t.unsqueeze(0)?;
            let ys = self.model.decoder_forward(&tokens_t, &audio_features, i == 0)?;

            // Extract the no speech probability on the first iteration by looking at the first
            // token logits and the probability for the according token.
            if i == 0 {
                let logits = self
                    .model
                    .decoder_final_linear(&ys.i(..1)?)?
                    .i(0)?
                    .i(0)?
                    .to_dtype(DType::F32)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder_final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs = softmax(&(&logits / t)?, 0)?;
                let logits_v: Vec<f32> = prs.to_vec1()?;
                let distr = rand::distributions::WeightedIndex::new(&logits_v)?;
                u32::try_from(distr.sample(&mut self.rng))?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .ok_or_else(|| anyhow!("Empty logits"))?
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }
        let text = self.tokenizer.decode(&tokens, true).map_err(anyhow::Error::msg)?;
        let avg_logprob = sum_logprob / tokens.len() as f64;

        Ok(DecodingResult {
            text,
            avg_logprob,
            no_speech_prob,
            temperature: t,
            compression_ratio: f64::NAN,
        })
    }

    fn load_mel(&self, pcm_data: &[f32]) -> Result<Tensor> {
        if pcm_data.is_empty() {
            bail!("No audio samples to transcribe");
        }
        let config = self.model.config();
        let mel = audio::pcm_to_mel(config, pcm_data, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (1, config.num_mel_bins, mel_len / config.num_mel_bins),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        debug!("loaded mel: {:?}", mel.dims());
        Ok(mel)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Segment {
    pub start: f64,
    pub duration: f64,
    pub dr: DecodingResult,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DecodingResult {
    pub text: String,
    pub avg_logprob: f64,
    pub no_speech_prob: f64,
    pub temperature: f64,
    pub compression_ratio: f64,
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}
