//! The bundled model runtime built on candle.

use std::path::Path;

use anyhow::{bail, Result};
use candle_core::{DType, Device};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::dispatch::ModalityTag;
use crate::error::GenerationError;
use crate::inference::models::llama::LlamaModel;
use crate::inference::models::model::ArchitectureInfo;
use crate::inference::models::whisper::WhisperModel;
use crate::inference::runtime::{
    ArtifactRef, DevicePreference, LoadOptions, LoadedModel, ModelRuntime, Precision, RuntimeInput,
    RuntimeModel, RuntimeOutput,
};
use crate::inference::text_pipeline::find_gguf;

/// Families the llama loader can map onto its weights
const LLAMA_FAMILIES: [&str; 2] = ["llama", "mistral"];

#[derive(Debug, Default, Clone)]
pub struct CandleRuntime;

impl CandleRuntime {
    pub fn new() -> Self {
        Self
    }
}

fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Accelerated => Ok(Device::cuda_if_available(0)?),
    }
}

fn select_dtype(precision: Precision, device: &Device) -> DType {
    match (precision, device) {
        (Precision::F16, Device::Cpu) => DType::F32,
        (Precision::F16, _) => DType::F16,
        (Precision::F32, _) => DType::F32,
    }
}

fn load_tokenizer(dir: &Path) -> Result<Option<Tokenizer>> {
    let path = dir.join("tokenizer.json");
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(Tokenizer::from_file(path).map_err(anyhow::Error::msg)?))
}

impl ModelRuntime for CandleRuntime {
    #[tracing::instrument(level = "info", skip(self))]
    fn load(&self, artifact: &ArtifactRef, options: &LoadOptions) -> Result<LoadedModel> {
        if !artifact.dir.is_dir() {
            bail!("{} is not a directory", artifact.dir.display());
        }
        let device = select_device(options.device)?;
        let dtype = select_dtype(options.precision, &device);
        debug!("Loading {} on {device:?} with {dtype:?}", artifact.id);

        let info = ArchitectureInfo::read(&artifact.dir)?;
        if !options.trust_remote_code {
            debug!("Remote code is never executed by this runtime");
        }

        match options.modality {
            ModalityTag::AutomaticSpeechRecognition => {
                let architecture = info.map_or_else(|| "whisper".to_string(), |i| i.name());
                let model = WhisperModel::new(artifact, architecture, &device, dtype)?;
                let processor = model.tokenizer().clone();
                Ok(LoadedModel {
                    model: Box::new(model),
                    processor: Some(processor),
                })
            }
            ModalityTag::TextGeneration => {
                let has_gguf = find_gguf(&artifact.dir).is_some();
                let architecture = match &info {
                    Some(info) if !has_gguf => {
                        if !LLAMA_FAMILIES.contains(&info.family()) {
                            bail!(
                                "Architecture {} is not supported by the candle text runtime",
                                info.name()
                            );
                        }
                        info.name()
                    }
                    Some(info) => info.name(),
                    None if has_gguf => "llama (gguf)".to_string(),
                    None => bail!("No config.json or GGUF weights found in {}", artifact.dir.display()),
                };
                let Some(tokenizer) = load_tokenizer(&artifact.dir)? else {
                    bail!("No tokenizer.json found in {}", artifact.dir.display());
                };
                let model = LlamaModel::new(artifact, architecture, tokenizer.clone(), &device, dtype)?;
                info!("Loaded {} for text generation", artifact.id);
                Ok(LoadedModel {
                    model: Box::new(model),
                    processor: Some(tokenizer),
                })
            }
            modality => {
                let Some(info) = info else {
                    bail!("No config.json found in {}", artifact.dir.display());
                };
                warn!(
                    "{} ({}) is loaded without an executor for {modality}",
                    artifact.id,
                    info.name()
                );
                Ok(LoadedModel {
                    model: Box::new(UnsupportedModel {
                        architecture: info.name(),
                        modality,
                    }),
                    processor: load_tokenizer(&artifact.dir)?,
                })
            }
        }
    }
}

/// Placeholder for checkpoints this runtime can identify but not execute.
/// Every run reports a missing capability so the handlers can degrade.
pub struct UnsupportedModel {
    architecture: String,
    modality: ModalityTag,
}

impl RuntimeModel for UnsupportedModel {
    fn architecture(&self) -> &str {
        &self.architecture
    }

    fn run(&mut self, input: RuntimeInput) -> Result<RuntimeOutput, GenerationError> {
        Err(GenerationError::MissingCapability(format!(
            "{} input for {} is not supported by the candle runtime ({})",
            input.kind(),
            self.modality,
            self.architecture
        )))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn artifact(dir: &TempDir) -> ArtifactRef {
        ArtifactRef {
            id: "org/model".into(),
            dir: dir.path().to_path_buf(),
        }
    }

    #[test]
    fn rejects_missing_directory() {
        let options = LoadOptions::new(ModalityTag::TextGeneration, true, true);
        let missing = ArtifactRef {
            id: "org/model".into(),
            dir: "/nonexistent/model".into(),
        };
        assert!(CandleRuntime::new().load(&missing, &options).is_err());
    }

    #[test]
    fn unknown_text_architecture_fails_to_load() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"model_type": "gpt2"}"#).unwrap();

        let options = LoadOptions::new(ModalityTag::TextGeneration, true, true);
        let err = CandleRuntime::new().load(&artifact(&dir), &options).err().unwrap();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn vision_checkpoints_report_missing_capability() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"model_type": "mplug_owl3", "architectures": ["mPLUGOwl3Model"]}"#,
        )
        .unwrap();

        let options = LoadOptions::new(ModalityTag::VisionLanguage, true, true);
        let mut loaded = CandleRuntime::new().load(&artifact(&dir), &options).unwrap();
        assert_eq!(loaded.model.architecture(), "mPLUGOwl3Model");
        let err = loaded
            .model
            .run(RuntimeInput::Speech {
                text: "hi".into(),
                voice: None,
                vocoder: None,
            })
            .unwrap_err();
        assert!(matches!(err, GenerationError::MissingCapability(_)));
    }
}
