use super::decode::Pcm;
use super::tempo;
use crate::db::models::{FeatureError, Features};
use thiserror::Error;

/// RMS analysis frame, in samples.
pub const RMS_FRAME_LENGTH: usize = 2048;
/// Hop between RMS frames, in samples.
pub const RMS_HOP_LENGTH: usize = 512;

const ENERGY_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, PartialEq)]
pub enum AnalysisError {
    #[error("no samples to analyze")]
    EmptyInput,
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
    #[error("non-finite sample at index {index}")]
    NonFiniteSample { index: usize },
    #[error("computed features are invalid: {0}")]
    Invalid(#[from] FeatureError),
}

/// Compute duration, tempo and energy from canonical PCM.
pub fn extract(pcm: &Pcm) -> Result<Features, AnalysisError> {
    if pcm.sample_rate == 0 {
        return Err(AnalysisError::InvalidSampleRate(pcm.sample_rate));
    }
    if pcm.samples.is_empty() {
        return Err(AnalysisError::EmptyInput);
    }
    if let Some(index) = pcm.samples.iter().position(|s| !s.is_finite()) {
        return Err(AnalysisError::NonFiniteSample { index });
    }

    let duration = pcm.samples.len() as f64 / pcm.sample_rate as f64;
    let energy = relative_energy(&rms_envelope(&pcm.samples));
    let envelope = tempo::onset_envelope(&pcm.samples);
    let bpm = tempo::estimate_bpm(&envelope, pcm.sample_rate);

    log::trace!(
        "Extracted duration={duration:.2}s bpm={bpm:.1} energy={energy:.3} from {} samples",
        pcm.samples.len()
    );

    Ok(Features::new(duration, bpm, energy)?)
}

/// Short-time RMS over full frames. A buffer shorter than one frame is
/// treated as a single frame.
pub fn rms_envelope(samples: &[f32]) -> Vec<f64> {
    if samples.len() <= RMS_FRAME_LENGTH {
        return vec![rms(samples)];
    }

    // Prefix sums of squares: each frame is then O(1).
    let mut prefix = Vec::with_capacity(samples.len() + 1);
    prefix.push(0.0_f64);
    let mut acc = 0.0_f64;
    for &s in samples {
        acc += (s as f64) * (s as f64);
        prefix.push(acc);
    }

    let n_frames = (samples.len() - RMS_FRAME_LENGTH) / RMS_HOP_LENGTH + 1;
    (0..n_frames)
        .map(|frame| {
            let start = frame * RMS_HOP_LENGTH;
            let energy = (prefix[start + RMS_FRAME_LENGTH] - prefix[start]).max(0.0);
            (energy / RMS_FRAME_LENGTH as f64).sqrt()
        })
        .collect()
}

fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Mean of the envelope relative to its peak, clipped to [0, 1].
pub fn relative_energy(envelope: &[f64]) -> f64 {
    if envelope.is_empty() {
        return 0.0;
    }
    let mean = envelope.iter().sum::<f64>() / envelope.len() as f64;
    let peak = envelope.iter().cloned().fold(0.0_f64, f64::max);
    (mean / (peak + ENERGY_EPSILON)).clamp(0.0, 1.0)
}
