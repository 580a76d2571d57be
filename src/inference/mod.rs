pub mod audio_pipeline;
pub mod candle_runtime;
pub mod mel;
pub mod model_config;
pub mod models;
pub mod runtime;
pub mod task;
pub mod text_pipeline;
