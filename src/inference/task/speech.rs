use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::cache::ModelHandle;
use crate::dispatch::ModalityTag;
use crate::error::GenerationError;
use crate::error_result;
use crate::inference::runtime::{RuntimeInput, RuntimeOutput};
use crate::inference::task::{TaskContext, TaskHandler, TaskRequest};
use crate::media::MediaCodec;
use crate::recovery::RecoveryChain;

/// A synthesis route selected by a keyword in the model id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SynthesisPath {
    name: &'static str,
    keyword: &'static str,
    label: &'static str,
    file_prefix: &'static str,
    /// Fixed output rate, otherwise the rate the model reports
    sample_rate: Option<u32>,
    voice: Option<&'static str>,
    vocoder: Option<&'static str>,
}

const SPEECHT5: SynthesisPath = SynthesisPath {
    name: "speecht5",
    keyword: "speecht5",
    label: "Speech synthesis",
    file_prefix: "tts_output",
    sample_rate: Some(16_000),
    voice: None,
    vocoder: Some("microsoft/speecht5_hifigan"),
};

const MMS: SynthesisPath = SynthesisPath {
    name: "mms",
    keyword: "mms-tts",
    label: "MMS TTS synthesis",
    file_prefix: "mms_tts_output",
    sample_rate: Some(22_050),
    voice: None,
    vocoder: None,
};

const BARK: SynthesisPath = SynthesisPath {
    name: "bark",
    keyword: "bark",
    label: "Bark TTS synthesis",
    file_prefix: "bark_tts_output",
    sample_rate: None,
    voice: Some("v2/en_speaker_6"),
    vocoder: None,
};

const GENERIC: SynthesisPath = SynthesisPath {
    name: "generic",
    keyword: "",
    label: "TTS synthesis",
    file_prefix: "generic_tts_output",
    sample_rate: None,
    voice: None,
    vocoder: None,
};

const NAMED_PATHS: [SynthesisPath; 3] = [SPEECHT5, MMS, BARK];

const VIBEVOICE_UNSUPPORTED: &str = "The VibeVoice model architecture is not yet supported. Please try using an alternative TTS model like 'microsoft/speecht5_tts' or 'facebook/mms-tts-eng'.";

fn named_path(model_id: &str) -> Option<SynthesisPath> {
    let lower = model_id.to_lowercase();
    NAMED_PATHS
        .into_iter()
        .find(|path| lower.contains(path.keyword))
}

fn output_file(dir: &Path, prefix: &str) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{prefix}_{timestamp}.wav"))
}

fn synthesize(
    handle: &ModelHandle,
    codec: &dyn MediaCodec,
    output_dir: &Path,
    text: &str,
    path: SynthesisPath,
) -> Result<String, GenerationError> {
    info!("Synthesizing speech through the {} path", path.name);
    let output = handle.run(RuntimeInput::Speech {
        text: text.to_string(),
        voice: path.voice.map(str::to_string),
        vocoder: path.vocoder.map(str::to_string),
    })?;

    let (samples, sample_rate) = match output {
        RuntimeOutput::Waveform {
            samples,
            sample_rate,
        } => (samples, sample_rate),
        other => {
            return Err(GenerationError::Runtime(format!(
                "expected a waveform, got {other}"
            )))
        }
    };
    if samples.is_empty() {
        return Err(GenerationError::EmptyOutput);
    }

    let file = output_file(output_dir, path.file_prefix);
    codec
        .write_wav(&file, &samples, path.sample_rate.unwrap_or(sample_rate))
        .map_err(|e| GenerationError::Runtime(format!("Failed to save audio: {e:#}")))?;
    Ok(format!(
        "{} completed. Audio saved to: {}",
        path.label,
        file.display()
    ))
}

pub struct SpeechSynthesisHandler;

impl TaskHandler for SpeechSynthesisHandler {
    fn modality(&self) -> ModalityTag {
        ModalityTag::TextToSpeech
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model_id))]
    fn run_task(&self, context: &TaskContext<'_>, request: &TaskRequest) -> String {
        let text = request.raw_input.trim();
        if text.is_empty() {
            return error_result!("No text provided for speech synthesis");
        }
        if request.model_id.to_lowercase().contains("vibevoice") {
            return error_result!(VIBEVOICE_UNSUPPORTED);
        }

        let handle = match context
            .cache
            .resolve(&request.model_request(ModalityTag::TextToSpeech))
        {
            Ok(handle) => handle,
            Err(err) => return error_result!("{}", err),
        };

        let named = named_path(&request.model_id);
        let output_dir = context.audio_output_dir;
        RecoveryChain::new("text-to-speech")
            .step_if(named.is_some(), named.map_or("named", |p| p.name), || {
                synthesize(&handle, context.codec, output_dir, text, named.unwrap_or(GENERIC))
            })
            .step(GENERIC.name, || {
                synthesize(&handle, context.codec, output_dir, text, GENERIC)
            })
            .run(|failures| match failures.last().map(|f| f.error.to_string()) {
                Some(message) if message.to_lowercase().contains("trust_remote_code") => {
                    error_result!("Model requires trust_remote_code=True but was blocked for security.")
                }
                Some(message) => error_result!("Speech synthesis failed: {}", message),
                None => error_result!("Speech synthesis produced no audio"),
            })
            .into_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_path_by_keyword() {
        assert_eq!(named_path("microsoft/speecht5_tts"), Some(SPEECHT5));
        assert_eq!(named_path("facebook/mms-tts-eng"), Some(MMS));
        assert_eq!(named_path("suno/bark-small"), Some(BARK));
        assert_eq!(named_path("espnet/kan-bayashi_ljspeech_vits"), None);
    }

    #[test]
    fn output_file_is_timestamped() {
        let file = output_file(Path::new("out"), "tts_output");
        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tts_output_"));
        assert!(name.ends_with(".wav"));
        // tts_output_YYYYmmdd_HHMMSS.wav
        assert_eq!(name.len(), "tts_output_".len() + 15 + 4);
    }
}
