use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap_serde_derive::ClapSerde;
use serde::Deserialize;

use crate::cache::{CacheSettings, DEFAULT_FALLBACK_MODEL};

pub const DEFAULT_CONFIG_FILE: &str = "MultimodalRunner.toml";

#[derive(ClapSerde, Deserialize, Debug)]
pub struct Config {
    /// Directory holding downloaded model artifacts
    #[default(PathBuf::from("models"))]
    #[arg(long, env)]
    pub cache_dir: PathBuf,

    /// Directory synthesized speech is written to
    #[default(PathBuf::from("audio"))]
    #[arg(long, env)]
    pub audio_output_dir: PathBuf,

    /// Diagnostic log file, appended to on every run. Empty disables it.
    #[default(PathBuf::new())]
    #[arg(long, env)]
    pub log_file: PathBuf,

    /// Text model loaded when every other resolution attempt fails
    #[default(DEFAULT_FALLBACK_MODEL.to_string())]
    #[arg(long, env)]
    pub fallback_model: String,

    /// Maximum number of models kept loaded, 0 for no limit
    #[default(4)]
    #[arg(long, env)]
    pub cache_capacity: usize,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    /// Reads `path` and applies the command line overrides on top. Only the
    /// default file may be missing.
    pub fn load(path: &str, overrides: <Config as ClapSerde>::Opt) -> Result<Self> {
        match Config::from_toml(path) {
            Ok(config) => Ok(config.merge(overrides)),
            Err(_) if path == DEFAULT_CONFIG_FILE && !Path::new(path).exists() => {
                Ok(Config::default().merge(overrides))
            }
            Err(err) => Err(err).with_context(|| format!("Failed to read configuration file {path}")),
        }
    }

    pub fn log_file(&self) -> Option<&Path> {
        if self.log_file.as_os_str().is_empty() {
            None
        } else {
            Some(&self.log_file)
        }
    }

    pub fn cache_settings(&self, offline: bool) -> CacheSettings {
        CacheSettings {
            cache_dir: self.cache_dir.clone(),
            capacity: self.cache_capacity,
            fallback_model: self.fallback_model.clone(),
            offline,
        }
    }
}
