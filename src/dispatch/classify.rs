use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// The inference modality a model is dispatched under
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ModalityTag {
    TextGeneration,
    AutomaticSpeechRecognition,
    TextToSpeech,
    ImageToText,
    VisionLanguage,
    FillMask,
    #[serde(rename = "text2text-generation")]
    Text2TextGeneration,
    ImageClassification,
    TextToImage,
}

impl ModalityTag {
    pub const ALL: [ModalityTag; 9] = [
        ModalityTag::TextGeneration,
        ModalityTag::AutomaticSpeechRecognition,
        ModalityTag::TextToSpeech,
        ModalityTag::ImageToText,
        ModalityTag::VisionLanguage,
        ModalityTag::FillMask,
        ModalityTag::Text2TextGeneration,
        ModalityTag::ImageClassification,
        ModalityTag::TextToImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModalityTag::TextGeneration => "text-generation",
            ModalityTag::AutomaticSpeechRecognition => "automatic-speech-recognition",
            ModalityTag::TextToSpeech => "text-to-speech",
            ModalityTag::ImageToText => "image-to-text",
            ModalityTag::VisionLanguage => "vision-language",
            ModalityTag::FillMask => "fill-mask",
            ModalityTag::Text2TextGeneration => "text2text-generation",
            ModalityTag::ImageClassification => "image-classification",
            ModalityTag::TextToImage => "text-to-image",
        }
    }

    /// Modalities whose handler cannot run without at least one media path
    pub fn requires_media(&self) -> bool {
        matches!(
            self,
            ModalityTag::AutomaticSpeechRecognition
                | ModalityTag::ImageToText
                | ModalityTag::VisionLanguage
        )
    }
}

impl Default for ModalityTag {
    fn default() -> Self {
        ModalityTag::TextGeneration
    }
}

impl fmt::Display for ModalityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModalityTag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match ModalityTag::ALL.iter().find(|tag| tag.as_str() == s) {
            Some(tag) => Ok(*tag),
            None => bail!("Unknown modality {s}"),
        }
    }
}

struct ModalityRule {
    name: &'static str,
    matches: fn(&str) -> bool,
    tag: ModalityTag,
}

fn contains_any(id: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| id.contains(needle))
}

lazy_static! {
    /// Evaluated top to bottom against the lowercased identifier; the first hit wins.
    /// Vision-language sits above speech and captioning because names such as
    /// "blip2" or "qwen-vl" also contain their keywords.
    static ref MODALITY_RULES: Vec<ModalityRule> = vec![
        ModalityRule {
            name: "vision-language families",
            matches: |id| {
                contains_any(id, &["gui-owl", "mplug", "owl", "llava", "instructblip", "minigpt", "blip2"])
            },
            tag: ModalityTag::VisionLanguage,
        },
        ModalityRule {
            name: "qwen vision",
            matches: |id| id.contains("qwen") && (id.contains("vl") || id.contains("vision")),
            tag: ModalityTag::VisionLanguage,
        },
        ModalityRule {
            name: "speech recognition",
            matches: |id| contains_any(id, &["whisper", "wav2vec", "hubert", "speecht5_asr"]),
            tag: ModalityTag::AutomaticSpeechRecognition,
        },
        ModalityRule {
            name: "speech synthesis",
            matches: |id| contains_any(id, &["tts", "speecht5_tts", "mms-tts", "bark", "vibevoice"]),
            tag: ModalityTag::TextToSpeech,
        },
        ModalityRule {
            name: "captioning",
            matches: |id| id.contains("blip"),
            tag: ModalityTag::ImageToText,
        },
        ModalityRule {
            name: "image classification",
            matches: |id| contains_any(id, &["vit", "clip", "detr", "deit"]),
            tag: ModalityTag::ImageClassification,
        },
        ModalityRule {
            name: "diffusion",
            matches: |id| contains_any(id, &["stable-diffusion", "diffusion"]),
            tag: ModalityTag::TextToImage,
        },
        ModalityRule {
            name: "deepseek",
            matches: |id| id.contains("deepseek"),
            tag: ModalityTag::TextGeneration,
        },
        ModalityRule {
            name: "causal language models",
            matches: |id| contains_any(id, &["gpt", "llama", "mistral", "qwen", "phi"]),
            tag: ModalityTag::TextGeneration,
        },
        ModalityRule {
            name: "encoder-decoder",
            matches: |id| contains_any(id, &["t5", "bart", "pegasus"]),
            tag: ModalityTag::Text2TextGeneration,
        },
        ModalityRule {
            name: "masked language models",
            matches: |id| contains_any(id, &["bert", "roberta", "albert"]),
            tag: ModalityTag::FillMask,
        },
    ];
}

/// Friendly names accepted in place of repository ids, in lookup order
const FRIENDLY_NAMES: [(&str, &str); 9] = [
    ("GUI Owl 7B", "mPLUG/GUI-Owl-7B"),
    ("gui owl 7b", "mPLUG/GUI-Owl-7B"),
    ("gui-owl-7b", "mPLUG/GUI-Owl-7B"),
    ("gui owl", "mPLUG/GUI-Owl-7B"),
    ("guiowl", "mPLUG/GUI-Owl-7B"),
    ("whisper base", "openai/whisper-base"),
    ("whisper-base", "openai/whisper-base"),
    ("gpt2-small", "openai-community/gpt2"),
    ("action-model", "openai-community/gpt2"),
];

/// Maps a model identifier to its modality
pub fn classify(model_id: &str) -> ModalityTag {
    let id = model_id.to_lowercase();
    for rule in MODALITY_RULES.iter() {
        if (rule.matches)(&id) {
            debug!("{model_id} matched rule '{}' -> {}", rule.name, rule.tag);
            return rule.tag;
        }
    }
    ModalityTag::default()
}

/// Resolves friendly model names to canonical repository ids.
/// Unknown ids are returned unchanged.
pub fn canonical_id(model_id: &str) -> String {
    if let Some((_, mapped)) = FRIENDLY_NAMES.iter().find(|(name, _)| *name == model_id) {
        info!("Model mapping: '{model_id}' -> '{mapped}'");
        return (*mapped).to_string();
    }

    let lower = model_id.to_lowercase();
    if let Some((_, mapped)) = FRIENDLY_NAMES
        .iter()
        .find(|(name, _)| name.to_lowercase() == lower)
    {
        info!("Model mapping (case-insensitive): '{model_id}' -> '{mapped}'");
        return (*mapped).to_string();
    }

    if !lower.is_empty() {
        if let Some((_, mapped)) = FRIENDLY_NAMES.iter().find(|(name, _)| {
            let name = name.to_lowercase();
            lower.contains(&name) || name.contains(&lower)
        }) {
            info!("Model mapping (partial match): '{model_id}' -> '{mapped}'");
            return (*mapped).to_string();
        }
    }

    debug!("No model mapping found for '{model_id}', using as-is");
    model_id.to_string()
}
