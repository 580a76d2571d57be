use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The architecture fields of a checkpoint's `config.json`
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchitectureInfo {
    /// The family name, e.g. `llama` or `whisper`
    #[serde(default)]
    pub model_type: Option<String>,

    /// The concrete model classes the checkpoint was saved from
    #[serde(default)]
    pub architectures: Vec<String>,
}

impl ArchitectureInfo {
    /// Reads `config.json` from `dir`; a checkpoint without one yields `None`
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join("config.json");
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let info = serde_json::from_str(&text)
            .with_context(|| format!("Invalid model config {}", path.display()))?;
        Ok(Some(info))
    }

    pub fn name(&self) -> String {
        self.architectures
            .first()
            .cloned()
            .or_else(|| self.model_type.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn family(&self) -> &str {
        self.model_type.as_deref().unwrap_or("unknown")
    }

    /// Architectures whose chat template carries images inline (Qwen2-VL, Qwen2.5-VL)
    pub fn uses_vision_chat_template(&self) -> bool {
        let name = self.name().to_lowercase();
        name.contains("qwen") && name.contains("vl")
    }
}
