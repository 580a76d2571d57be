use serde::{Deserialize, Serialize};

use crate::inference::runtime::SamplingParams;

/// Per-request generation settings taken from the command line
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub cpu_optimize: bool,
    pub trust_remote_code: bool,
    pub fast_mode: bool,
    pub offline_mode: bool,
    /// Accepted for compatibility, inputs are never batched
    pub batch_size: usize,
}

impl Default for GenerationOptions {
    #[tracing::instrument(level = "trace", skip())]
    fn default() -> Self {
        Self {
            max_length: 250,
            temperature: 0.7,
            top_p: 0.9,
            cpu_optimize: false,
            trust_remote_code: true,
            fast_mode: false,
            offline_mode: false,
            batch_size: 1,
        }
    }
}

impl GenerationOptions {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            max_new_tokens: self.max_length,
            temperature: self.temperature,
            top_p: self.top_p,
            ..SamplingParams::default()
        }
    }
}
