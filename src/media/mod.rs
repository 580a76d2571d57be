pub mod codec;
pub mod pcm_decode;

use std::path::Path;

use anyhow::Result;
use image::imageops::FilterType;
use image::RgbImage;

use crate::error::DependencyError;

pub use codec::SymphoniaCodec;

pub trait MediaCodec: Send + Sync {
    /// Verifies that audio can actually be decoded on this system
    fn check_audio(&self) -> Result<(), DependencyError>;

    /// Mono samples resampled to `sample_rate` and truncated to `max_seconds`
    fn decode_audio(&self, path: &Path, sample_rate: u32, max_seconds: f32) -> Result<Vec<f32>>;

    fn decode_image(&self, path: &Path) -> Result<RgbImage>;

    fn write_wav(&self, path: &Path, samples: &[f32], sample_rate: u32) -> Result<()>;
}

pub fn resample_linear(audio: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if audio.is_empty() || src_rate == 0 || dst_rate == 0 || src_rate == dst_rate {
        return audio.to_vec();
    }

    let ratio = dst_rate as f64 / src_rate as f64;
    let out_len = ((audio.len() as f64) * ratio).round().max(1.0) as usize;
    let mut out = vec![0f32; out_len];

    for (i, sample) in out.iter_mut().enumerate() {
        let src_pos = i as f64 / ratio;
        let left = (src_pos.floor() as usize).min(audio.len() - 1);
        let right = (left + 1).min(audio.len() - 1);
        let frac = (src_pos - left as f64) as f32;
        *sample = audio[left] * (1.0 - frac) + audio[right] * frac;
    }

    out
}

/// Downscales so that the longer side is at most `max_side`; smaller images are returned as is
pub fn fit_within(image: RgbImage, max_side: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width.max(height) <= max_side || width == 0 || height == 0 {
        return image;
    }
    let scale = max_side as f64 / width.max(height) as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    image::imageops::resize(&image, new_width, new_height, FilterType::Lanczos3)
}

/// Scales to `target_width` keeping the aspect ratio, only ever shrinking
pub fn shrink_to_width(image: &RgbImage, target_width: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width <= target_width || width == 0 {
        return image.clone();
    }
    let new_height = ((height as f64 * target_width as f64 / width as f64).round() as u32).max(1);
    image::imageops::resize(image, target_width, new_height, FilterType::Lanczos3)
}
