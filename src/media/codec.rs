use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::DependencyError;
use crate::media::pcm_decode::{pcm_decode, pcm_decode_file};
use crate::media::{resample_linear, MediaCodec};

/// Audio through symphonia (resampled with linear interpolation), images
/// through the `image` crate and WAV output through hound
#[derive(Debug, Default, Clone)]
pub struct SymphoniaCodec;

impl SymphoniaCodec {
    pub fn new() -> Self {
        Self
    }
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn write_samples<W>(writer: &mut hound::WavWriter<W>, samples: &[f32]) -> Result<()>
where
    W: std::io::Write + std::io::Seek,
{
    for sample in samples {
        let value = if sample.is_finite() {
            sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        writer.write_sample((value * i16::MAX as f32) as i16)?;
    }
    Ok(())
}

/// Without a declared rate the audio is taken to already be at `target`
fn declared_rate(path: &Path, rate: Option<u32>, target: u32) -> u32 {
    rate.unwrap_or_else(|| {
        warn!("{} declares no sample rate, assuming {target} Hz", path.display());
        target
    })
}

impl MediaCodec for SymphoniaCodec {
    fn check_audio(&self) -> Result<(), DependencyError> {
        let self_test = || -> Result<usize> {
            let sample_rate = 16_000;
            let tone: Vec<f32> = (0..sample_rate / 10)
                .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / sample_rate as f32).sin() * 0.5)
                .collect();

            let mut buffer = Cursor::new(Vec::new());
            {
                let mut writer = hound::WavWriter::new(&mut buffer, wav_spec(sample_rate))?;
                write_samples(&mut writer, &tone)?;
                writer.finalize()?;
            }

            let mut hint = Hint::new();
            hint.with_extension("wav");
            let (decoded, rate) = pcm_decode(Box::new(Cursor::new(buffer.into_inner())), hint)?;
            if rate != Some(sample_rate) || decoded.is_empty() {
                bail!("decoded {} samples at {rate:?} Hz", decoded.len());
            }
            Ok(decoded.len())
        };

        match self_test() {
            Ok(count) => {
                debug!("Audio codec self-test decoded {count} samples");
                Ok(())
            }
            Err(err) => Err(DependencyError::MissingCodec(format!("{err:#}"))),
        }
    }

    fn decode_audio(&self, path: &Path, sample_rate: u32, max_seconds: f32) -> Result<Vec<f32>> {
        let (pcm, source_rate) =
            pcm_decode_file(path).with_context(|| format!("Failed to decode {}", path.display()))?;
        if pcm.is_empty() {
            bail!("{} contains no audio samples", path.display());
        }

        let source_rate = declared_rate(path, source_rate, sample_rate);
        let mut samples = resample_linear(&pcm, source_rate, sample_rate);
        let max_samples = (max_seconds * sample_rate as f32) as usize;
        if max_samples > 0 && samples.len() > max_samples {
            debug!(
                "Truncating {} from {:.1}s to {max_seconds}s",
                path.display(),
                samples.len() as f32 / sample_rate as f32
            );
            samples.truncate(max_samples);
        }
        Ok(samples)
    }

    fn decode_image(&self, path: &Path) -> Result<RgbImage> {
        let image = image::open(path).with_context(|| format!("Failed to open image {}", path.display()))?;
        Ok(image.to_rgb8())
    }

    fn write_wav(&self, path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = hound::WavWriter::create(path, wav_spec(sample_rate))
            .with_context(|| format!("Failed to create {}", path.display()))?;
        write_samples(&mut writer, samples)?;
        writer.finalize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn self_test_passes() {
        assert!(SymphoniaCodec::new().check_audio().is_ok());
    }

    #[test]
    fn wav_round_trip_resamples_and_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("tone.wav");
        let codec = SymphoniaCodec::new();
        let tone: Vec<f32> = (0..22_050 * 2).map(|i| ((i as f32) / 50.0).sin() * 0.3).collect();
        codec.write_wav(&path, &tone, 22_050).unwrap();

        let samples = codec.decode_audio(&path, 16_000, 1.0).unwrap();
        assert_eq!(samples.len(), 16_000);
    }

    #[test]
    fn undeclared_rate_assumes_the_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        SymphoniaCodec::new().write_wav(&path, &[0.1; 800], 8_000).unwrap();

        let (_, rate) = pcm_decode_file(&path).unwrap();
        assert_eq!(rate, Some(8_000));
        assert_eq!(declared_rate(&path, rate, 16_000), 8_000);
        assert_eq!(declared_rate(&path, None, 16_000), 16_000);
    }

    #[test]
    fn decodes_png() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(8, 4, image::Rgb([10, 20, 30])).save(&path).unwrap();

        let decoded = SymphoniaCodec::new().decode_image(&path).unwrap();
        assert_eq!(decoded.dimensions(), (8, 4));
    }

    #[test]
    fn missing_audio_file_errors() {
        let codec = SymphoniaCodec::new();
        assert!(codec.decode_audio(Path::new("/nonexistent/a.wav"), 16_000, 30.0).is_err());
    }
}
