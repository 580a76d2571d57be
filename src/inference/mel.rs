use std::path::Path;

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use candle_transformers::models::whisper::{N_FFT, SAMPLE_RATE};
use tracing::debug;

/// Mel filters for `n_mels` bins. A `melfilters.bytes` (80 bins) or
/// `melfilters128.bytes` file shipped next to the weights takes precedence,
/// otherwise the Slaney filterbank whisper was trained with is computed.
pub fn load_mel_filters(dir: &Path, n_mels: usize) -> Result<Vec<f32>> {
    let file_name = if n_mels == 128 {
        "melfilters128.bytes"
    } else {
        "melfilters.bytes"
    };
    let path = dir.join(file_name);
    if path.is_file() {
        let mel_bytes = std::fs::read(&path)?;
        let mut mel_filters = vec![0f32; mel_bytes.len() / 4];
        LittleEndian::read_f32_into(&mel_bytes[..mel_filters.len() * 4], &mut mel_filters);
        if mel_filters.len() != n_mels * (N_FFT / 2 + 1) {
            bail!(
                "{} holds {} filters, expected {n_mels} x {}",
                path.display(),
                mel_filters.len(),
                N_FFT / 2 + 1
            );
        }
        debug!("Loaded mel filters from {}", path.display());
        return Ok(mel_filters);
    }
    Ok(mel_filterbank(SAMPLE_RATE, N_FFT, n_mels))
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;

    if hz < min_log_hz {
        hz / f_sp
    } else {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;

    if mel < min_log_mel {
        mel * f_sp
    } else {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    }
}

/// Row-major `n_mels x (n_fft / 2 + 1)` triangular filters with Slaney area normalization
pub fn mel_filterbank(sample_rate: usize, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f32 / 2.0;
    let mel_max = hz_to_mel_slaney(nyquist);

    let hz_points: Vec<f32> = (0..(n_mels + 2))
        .map(|i| mel_to_hz_slaney(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|i| nyquist * i as f32 / (n_freqs - 1).max(1) as f32)
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let lower_width = (center - left).max(1e-12);
        let upper_width = (right - center).max(1e-12);
        let enorm = 2.0 / (right - left).max(1e-12);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / lower_width;
            let upper = (right - freq) / upper_width;
            filters[m * n_freqs + k] = lower.min(upper).max(0.0) * enorm;
        }
    }
    filters
}
