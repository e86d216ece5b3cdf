//! Tempo estimation: spectral-flux onset envelope, then autocorrelation.

use rustfft::{num_complex::Complex, FftPlanner};

/// STFT size for the onset envelope.
pub const FFT_SIZE: usize = 2048;
/// Hop between STFT frames (and between onset envelope values).
pub const HOP_LENGTH: usize = 512;

/// Tempo reported when the envelope has no usable periodicity.
pub const FALLBACK_BPM: f64 = 120.0;

const MIN_BPM: f64 = 40.0;
const MAX_BPM: f64 = 240.0;

/// Centre and width (in octaves) of the log-normal tempo prior.
const PRIOR_BPM: f64 = 120.0;
const PRIOR_OCTAVES: f64 = 1.0;

/// Log compression applied to magnitudes before differencing.
const LOG_GAIN: f32 = 1000.0;

fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / n as f32;
            0.5 * (1.0 - x.cos())
        })
        .collect()
}

/// Onset strength per hop: half-wave rectified frame-to-frame increase in
/// log magnitude, summed over frequency bins.
///
/// Returns an empty envelope when the signal is shorter than one frame.
pub fn onset_envelope(samples: &[f32]) -> Vec<f32> {
    if samples.len() < FFT_SIZE {
        return Vec::new();
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(FFT_SIZE);
    let window = hann_window(FFT_SIZE);
    let bins = FFT_SIZE / 2 + 1;

    let n_frames = (samples.len() - FFT_SIZE) / HOP_LENGTH + 1;
    let mut envelope = Vec::with_capacity(n_frames);
    let mut previous: Option<Vec<f32>> = None;
    let mut buffer = vec![Complex::new(0.0_f32, 0.0); FFT_SIZE];

    for frame in 0..n_frames {
        let start = frame * HOP_LENGTH;
        for ((slot, &s), &w) in buffer
            .iter_mut()
            .zip(&samples[start..start + FFT_SIZE])
            .zip(&window)
        {
            *slot = Complex::new(s * w, 0.0);
        }
        fft.process(&mut buffer);

        let magnitudes: Vec<f32> = buffer[..bins]
            .iter()
            .map(|c| (1.0 + LOG_GAIN * c.norm()).ln())
            .collect();

        let flux: f32 = match &previous {
            Some(prev) => magnitudes
                .iter()
                .zip(prev)
                .map(|(m, p)| (m - p).max(0.0))
                .sum(),
            None => 0.0,
        };
        envelope.push(flux);
        previous = Some(magnitudes);
    }

    envelope
}

/// Dominant tempo from an onset envelope sampled every `HOP_LENGTH` samples.
///
/// Always finite and positive; falls back to [`FALLBACK_BPM`] when the
/// envelope is too short, flat, or aperiodic.
pub fn estimate_bpm(envelope: &[f32], sample_rate: u32) -> f64 {
    let frame_rate = sample_rate as f64 / HOP_LENGTH as f64;
    let min_lag = (60.0 * frame_rate / MAX_BPM).ceil().max(1.0) as usize;
    let max_lag = (60.0 * frame_rate / MIN_BPM).floor() as usize;

    if envelope.len() < min_lag + 2 {
        return FALLBACK_BPM;
    }
    let max_lag = max_lag.min(envelope.len() - 2);

    let n = envelope.len() as f64;
    let mean = envelope.iter().map(|&v| v as f64).sum::<f64>() / n;
    let centered: Vec<f64> = envelope.iter().map(|&v| v as f64 - mean).collect();
    let variance = centered.iter().map(|v| v * v).sum::<f64>();
    if variance <= 1e-12 {
        return FALLBACK_BPM;
    }

    // Normalized autocorrelation for lags min_lag-1 ..= max_lag+1 so the
    // peak can be interpolated against both neighbours.
    let lo = min_lag.saturating_sub(1).max(1);
    let hi = (max_lag + 1).min(envelope.len() - 1);
    let acf: Vec<f64> = (lo..=hi)
        .map(|lag| {
            let sum: f64 = centered[..centered.len() - lag]
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum();
            sum / variance
        })
        .collect();
    let at = |lag: usize| acf[lag - lo];

    let mut best: Option<(usize, f64)> = None;
    for lag in min_lag..=max_lag {
        let value = at(lag);
        if value <= 0.0 {
            continue;
        }
        let bpm = 60.0 * frame_rate / lag as f64;
        let octaves = (bpm / PRIOR_BPM).log2() / PRIOR_OCTAVES;
        let weighted = value * (-0.5 * octaves * octaves).exp();
        if best.is_none_or(|(_, w)| weighted > w) {
            best = Some((lag, weighted));
        }
    }

    let Some((lag, _)) = best else {
        return FALLBACK_BPM;
    };

    // Parabolic interpolation around the peak.
    let mut period = lag as f64;
    if lag > lo && lag < hi {
        let (left, centre, right) = (at(lag - 1), at(lag), at(lag + 1));
        let denom = left - 2.0 * centre + right;
        if denom.abs() > 1e-12 {
            period += (0.5 * (left - right) / denom).clamp(-0.5, 0.5);
        }
    }

    let bpm = 60.0 * frame_rate / period;
    if bpm.is_finite() && bpm > 0.0 {
        bpm
    } else {
        FALLBACK_BPM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 22050;

    /// Short decaying noise-like bursts every `period` samples.
    fn click_track(period: usize, seconds: f64) -> Vec<f32> {
        let len = (seconds * SR as f64) as usize;
        let mut samples = vec![0.0_f32; len];
        let burst = 400;
        for start in (0..len).step_by(period) {
            for i in 0..burst.min(len - start) {
                let decay = 1.0 - i as f32 / burst as f32;
                let sign = if (i * 7919) % 3 == 0 { -1.0 } else { 1.0 };
                samples[start + i] = 0.8 * decay * sign;
            }
        }
        samples
    }

    #[test]
    fn test_envelope_length() {
        assert!(onset_envelope(&[0.0; FFT_SIZE - 1]).is_empty());
        let env = onset_envelope(&vec![0.0; FFT_SIZE + 3 * HOP_LENGTH]);
        assert_eq!(env.len(), 4);
        assert!(env.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_click_track_tempo() {
        // 20 hops per beat: ~129.2 BPM.
        let period = 20 * HOP_LENGTH;
        let expected = 60.0 * SR as f64 / period as f64;
        let env = onset_envelope(&click_track(period, 20.0));
        let bpm = estimate_bpm(&env, SR);
        assert!((bpm - expected).abs() < 4.0, "got {bpm}, expected ~{expected}");
    }

    #[test]
    fn test_fast_tempo_may_fold_to_half() {
        // 140 BPM falls between hop-aligned lags (~18.46 hops), while its
        // double period (~36.9 hops) is nearly aligned, so the estimate can
        // land an octave down. Either way it stays in the same tempo family.
        let period = (60.0 * SR as f64 / 140.0).round() as usize;
        let env = onset_envelope(&click_track(period, 20.0));
        let bpm = estimate_bpm(&env, SR);
        assert!(
            (bpm - 140.0).abs() < 3.0 || (bpm - 70.0).abs() < 3.0,
            "got {bpm}, expected ~140 or ~70"
        );
    }

    #[test]
    fn test_flat_envelope_falls_back() {
        assert_eq!(estimate_bpm(&[0.0; 500], SR), FALLBACK_BPM);
        assert_eq!(estimate_bpm(&[1.0; 500], SR), FALLBACK_BPM);
        assert_eq!(estimate_bpm(&[], SR), FALLBACK_BPM);
        assert_eq!(estimate_bpm(&[3.0], SR), FALLBACK_BPM);
    }

    #[test]
    fn test_single_spike_is_finite() {
        let mut env = vec![0.0_f32; 400];
        env[3] = 10.0;
        let bpm = estimate_bpm(&env, SR);
        assert!(bpm.is_finite() && bpm > 0.0);
    }
}
