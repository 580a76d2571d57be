use std::path::Path;

use candle_transformers::models::whisper::SAMPLE_RATE;
use tracing::{error, info, warn};

use crate::cache::ModelHandle;
use crate::dispatch::ModalityTag;
use crate::error::GenerationError;
use crate::error_result;
use crate::inference::runtime::RuntimeInput;
use crate::inference::task::{
    expect_text, file_name, join_per_file, strip_file_echo, TaskContext, TaskHandler, TaskRequest,
};
use crate::media::MediaCodec;
use crate::recovery::RecoveryChain;

/// Longer recordings are cut, recognition runs on a single window
const MAX_AUDIO_SECONDS: f32 = 30.0;

pub struct TranscribeHandler;

fn transcribe_file(
    handle: &ModelHandle,
    codec: &dyn MediaCodec,
    path: &Path,
) -> Result<String, GenerationError> {
    let samples = codec
        .decode_audio(path, SAMPLE_RATE as u32, MAX_AUDIO_SECONDS)
        .map_err(|e| GenerationError::Runtime(format!("Failed to load audio: {e:#}")))?;
    info!(
        "Audio {} loaded: {} samples ({:.1}s)",
        file_name(path),
        samples.len(),
        samples.len() as f32 / SAMPLE_RATE as f32
    );

    let output = handle.run(RuntimeInput::Audio {
        samples,
        sample_rate: SAMPLE_RATE as u32,
    })?;
    let text = expect_text(output)?;
    Ok(strip_file_echo(text.trim(), path).trim().to_string())
}

impl TaskHandler for TranscribeHandler {
    fn modality(&self) -> ModalityTag {
        ModalityTag::AutomaticSpeechRecognition
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model_id))]
    fn run_task(&self, context: &TaskContext<'_>, request: &TaskRequest) -> String {
        let audio_paths = match &request.parsed {
            Ok(parsed) => parsed.audio_paths(),
            Err(err) => {
                warn!("{err}");
                Vec::new()
            }
        };
        if audio_paths.is_empty() {
            return error_result!(
                "No valid audio file paths found in input. Input received: {}",
                request.raw_input
            );
        }

        if let Err(err) = context.codec.check_audio() {
            return error_result!("Audio processing dependencies not available. {}", err);
        }

        let handle = match context
            .cache
            .resolve(&request.model_request(ModalityTag::AutomaticSpeechRecognition))
        {
            Ok(handle) => handle,
            Err(err) => return error_result!("{}", err),
        };

        info!("Processing {} audio file(s)", audio_paths.len());
        let results = audio_paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                info!("Audio {}/{}: {}", i + 1, audio_paths.len(), file_name(path));
                RecoveryChain::new("speech-recognition")
                    .step("transcribe", || {
                        transcribe_file(&handle, context.codec, path)
                    })
                    .run(|failures| match failures.last().map(|f| &f.error) {
                        Some(GenerationError::EmptyOutput) | None => {
                            "No speech detected in the audio file".to_string()
                        }
                        Some(GenerationError::OutOfMemory(_)) => {
                            "ERROR - Insufficient GPU memory for audio processing. Try using CPU mode."
                                .to_string()
                        }
                        Some(err) => {
                            error!("Error processing audio {}: {err}", i + 1);
                            format!("ERROR - {err}")
                        }
                    })
                    .into_message()
            })
            .map(|text| {
                if text.is_empty() {
                    "No speech detected in the audio file".to_string()
                } else {
                    text
                }
            })
            .collect();

        join_per_file(results)
    }
}
