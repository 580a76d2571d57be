pub mod llama;
pub mod model;
pub mod whisper;
