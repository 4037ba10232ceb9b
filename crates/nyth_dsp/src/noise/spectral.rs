//! Spectral Noise Reduction
//!
//! Short-time Fourier noise suppression. Input is gathered into frames of
//! `fft_size` samples every `hop_size` samples, windowed with a periodic Hann,
//! transformed, attenuated bin by bin against a running noise-floor estimate,
//! inverse-transformed, windowed again and overlap-added.
//!
//! Two gain rules share that frame machinery:
//! - [`SpectralRule::Subtraction`]: `1 - beta * N / |Y|`
//! - [`SpectralRule::Wiener`]: `xi / (1 + xi)`, where the a-priori SNR `xi`
//!   is the decision-directed blend of the previous frame's cleaned SNR and
//!   the current `max(|Y|^2 / N^2 - 1, 0)`
//!
//! Analysis and synthesis both use the same window, so a sample that lands at
//! frame positions `p, p + hop, p + 2 * hop, ...` is reconstructed with total
//! weight `sum(w[p + j * hop]^2)`. That sum is precomputed per output position
//! and divided out, which makes the chain an exact identity when no bin is
//! attenuated, for any hop up to half the frame.
//!
//! Output lags input by exactly `fft_size` samples.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{check_range, check_sample_rate, DspError, DspResult};
use crate::fft::{hann_periodic, validate_fft_size, FftEngine};
use rustfft::num_complex::Complex;

/// A frame counts as noise-only when its energy is within this factor of
/// the current noise estimate's energy
const NOISE_FRAME_RATIO: f32 = 2.0;

/// A-priori SNR limits for the Wiener rule (-30 dB to +30 dB)
const MIN_PRIOR_SNR: f32 = 1e-3;
const MAX_PRIOR_SNR: f32 = 1e3;

/// Keeps empty noise bins out of the SNR division
const MIN_NOISE_POWER: f32 = 1e-12;

/// How a bin's gain is derived from its magnitude and noise estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectralRule {
    #[default]
    Subtraction,
    Wiener,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralNrConfig {
    pub enabled: bool,
    pub sample_rate: f32,
    /// Power of two, 64 to 8192
    pub fft_size: usize,
    /// 1 to fft_size / 2
    pub hop_size: usize,
    /// Over-subtraction factor (0 to 5, 0 = no attenuation)
    pub beta: f32,
    /// Lowest gain a bin is pulled down to (0 to 1)
    pub floor_gain: f32,
    /// Noise estimate smoothing per noise-only frame (0 to 1, higher = slower)
    pub noise_update: f32,
    pub rule: SpectralRule,
    /// Decision-directed weight of the previous frame's SNR (0 to 0.999,
    /// Wiener rule only)
    pub snr_smoothing: f32,
}

impl Default for SpectralNrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48000.0,
            fft_size: 1024,
            hop_size: 256,
            beta: 1.5,
            floor_gain: 0.05,
            noise_update: 0.98,
            rule: SpectralRule::Subtraction,
            snr_smoothing: 0.98,
        }
    }
}

impl SpectralNrConfig {
    pub fn validate(&self) -> DspResult<()> {
        check_sample_rate(self.sample_rate)?;
        validate_fft_size(self.fft_size)?;
        if self.hop_size == 0 || self.hop_size > self.fft_size / 2 {
            return Err(DspError::InvalidHopSize {
                hop: self.hop_size,
                fft_size: self.fft_size,
            });
        }
        check_range("beta", self.beta, 0.0, 5.0)?;
        check_range("floor gain", self.floor_gain, 0.0, 1.0)?;
        check_range("noise update", self.noise_update, 0.0, 1.0)?;
        check_range("snr smoothing", self.snr_smoothing, 0.0, 0.999)
    }
}

pub struct SpectralNR {
    config: SpectralNrConfig,
    fft: FftEngine,
    window: Vec<f32>,
    /// 1 / overlap-add weight for each position of a released hop
    inv_weight: Vec<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
    accumulator: Vec<f32>,
    frame: Vec<f32>,
    noise: Vec<f32>,
    /// Cleaned SNR of the previous frame per bin (Wiener rule)
    prior_snr: Vec<f32>,
    noise_energy: f32,
    has_estimate: bool,
    frames: u64,
    /// Write position inside `input`, always in `[fft_size - hop, fft_size)`
    rover: usize,
}

impl SpectralNR {
    pub fn new(config: SpectralNrConfig) -> DspResult<Self> {
        config.validate()?;
        let n = config.fft_size;
        let hop = config.hop_size;
        let fft = FftEngine::new(n)?;
        let window = hann_periodic(n);
        let inv_weight = (0..hop)
            .map(|p| {
                let weight: f32 = (p..n).step_by(hop).map(|i| window[i] * window[i]).sum();
                if weight > f32::EPSILON {
                    1.0 / weight
                } else {
                    0.0
                }
            })
            .collect();
        let bins = fft.num_bins();
        debug!(fft_size = n, hop, "spectral noise reducer prepared");
        Ok(Self {
            config,
            fft,
            window,
            inv_weight,
            input: vec![0.0; n],
            output: vec![0.0; hop],
            accumulator: vec![0.0; n],
            frame: vec![0.0; n],
            noise: vec![0.0; bins],
            prior_snr: vec![0.0; bins],
            noise_energy: 0.0,
            has_estimate: false,
            frames: 0,
            rover: n - hop,
        })
    }

    pub fn config(&self) -> SpectralNrConfig {
        self.config
    }

    /// Apply new parameters; a new frame or hop size rebuilds all buffers
    ///
    /// Note: This allocates when the frame layout changes. Only call during
    /// setup, not in audio callback.
    pub fn set_config(&mut self, config: SpectralNrConfig) -> DspResult<()> {
        config.validate()?;
        if config.fft_size != self.config.fft_size || config.hop_size != self.config.hop_size {
            *self = Self::new(config)?;
        } else {
            self.config = config;
        }
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn latency_samples(&self) -> usize {
        self.config.fft_size
    }

    /// Per-bin noise magnitude, DC through Nyquist
    pub fn noise_estimate(&self) -> &[f32] {
        &self.noise
    }

    pub fn has_noise_estimate(&self) -> bool {
        self.has_estimate
    }

    /// Clear the FIFOs and forget the noise estimate
    pub fn reset(&mut self) {
        self.input.fill(0.0);
        self.output.fill(0.0);
        self.accumulator.fill(0.0);
        self.noise.fill(0.0);
        self.prior_snr.fill(0.0);
        self.noise_energy = 0.0;
        self.has_estimate = false;
        self.frames = 0;
        self.rover = self.config.fft_size - self.config.hop_size;
    }

    /// Process samples in place; output is delayed by [`latency_samples`](Self::latency_samples)
    ///
    /// # Real-time Safety
    /// No allocations. One FFT pair per `hop_size` samples.
    pub fn process_in_place(&mut self, samples: &mut [f32]) {
        if !self.config.enabled {
            return;
        }
        let start = self.config.fft_size - self.config.hop_size;
        for sample in samples.iter_mut() {
            let x = if sample.is_finite() { *sample } else { 0.0 };
            *sample = self.output[self.rover - start];
            self.input[self.rover] = x;
            self.rover += 1;
            if self.rover == self.config.fft_size {
                self.process_frame();
                self.rover = start;
            }
        }
    }

    pub fn process_mono(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        self.process_in_place(&mut output[..n]);
        n
    }

    fn process_frame(&mut self) {
        let n = self.config.fft_size;
        let hop = self.config.hop_size;

        self.fft.forward_windowed(&self.input, &self.window);
        self.update_noise_estimate();
        self.apply_gains();
        self.fft.inverse(&mut self.frame);

        for ((acc, &y), &w) in self.accumulator.iter_mut().zip(&self.frame).zip(&self.window) {
            *acc += y * w;
        }
        for ((out, &acc), &inv) in self.output.iter_mut().zip(&self.accumulator).zip(&self.inv_weight) {
            *out = acc * inv;
        }

        self.accumulator.copy_within(hop.., 0);
        self.accumulator[n - hop..].fill(0.0);
        self.input.copy_within(hop.., 0);
        self.frames += 1;
    }

    fn update_noise_estimate(&mut self) {
        let bins = self.noise.len();
        let spectrum = self.fft.spectrum();
        let energy: f32 = spectrum[..bins].iter().map(|c| c.norm_sqr()).sum();

        if !self.has_estimate {
            // Frames that still overlap the zero prefill would underestimate
            let primed = (self.frames + 1) * self.config.hop_size as u64 >= self.config.fft_size as u64;
            if primed {
                for (noise, bin) in self.noise.iter_mut().zip(spectrum) {
                    *noise = bin.norm();
                }
                self.noise_energy = energy;
                self.has_estimate = true;
            }
            return;
        }

        if energy <= self.noise_energy * NOISE_FRAME_RATIO {
            let keep = self.config.noise_update;
            for (noise, bin) in self.noise.iter_mut().zip(spectrum) {
                *noise = keep * *noise + (1.0 - keep) * bin.norm();
            }
            self.noise_energy = self.noise.iter().map(|m| m * m).sum();
        }
    }

    fn apply_gains(&mut self) {
        if !self.has_estimate {
            return;
        }
        let n = self.config.fft_size;
        let floor = self.config.floor_gain;
        let spectrum = self.fft.spectrum_mut();

        match self.config.rule {
            SpectralRule::Subtraction => {
                let beta = self.config.beta;
                if beta <= 0.0 {
                    return;
                }
                for (k, &noise) in self.noise.iter().enumerate() {
                    let magnitude = spectrum[k].norm();
                    let subtract = beta * noise;
                    let gain = if subtract <= 0.0 {
                        1.0
                    } else if magnitude > subtract {
                        1.0 - subtract / magnitude
                    } else {
                        0.0
                    };
                    scale_bin(spectrum, n, k, gain.max(floor));
                }
            }
            SpectralRule::Wiener => {
                let alpha = self.config.snr_smoothing;
                for (k, (&noise, prior)) in self.noise.iter().zip(&mut self.prior_snr).enumerate() {
                    let posterior = spectrum[k].norm_sqr() / (noise * noise).max(MIN_NOISE_POWER);
                    let xi = (alpha * *prior + (1.0 - alpha) * (posterior - 1.0).max(0.0))
                        .clamp(MIN_PRIOR_SNR, MAX_PRIOR_SNR);
                    let gain = (xi / (1.0 + xi)).max(floor);
                    *prior = gain * gain * posterior;
                    scale_bin(spectrum, n, k, gain);
                }
            }
        }
    }
}

/// Scale bin `k` and its mirror so the inverse stays real
#[inline]
fn scale_bin(spectrum: &mut [Complex<f32>], n: usize, k: usize, gain: f32) {
    spectrum[k] *= gain;
    if k != 0 && k != n / 2 {
        spectrum[n - k] *= gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic white-ish noise in [-amplitude, amplitude]
    fn noise(len: usize, amplitude: f32, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_config_validation() {
        assert!(SpectralNrConfig::default().validate().is_ok());
        let bad_fft = SpectralNrConfig {
            fft_size: 1000,
            ..Default::default()
        };
        assert!(SpectralNR::new(bad_fft).is_err());
        let bad_hop = SpectralNrConfig {
            hop_size: 1024,
            ..Default::default()
        };
        assert!(matches!(
            SpectralNR::new(bad_hop),
            Err(DspError::InvalidHopSize { hop: 1024, .. })
        ));
        let bad_beta = SpectralNrConfig {
            beta: 6.0,
            ..Default::default()
        };
        assert!(bad_beta.validate().is_err());
    }

    #[test]
    fn test_zero_beta_reconstructs_input() {
        for hop in [64, 128, 96] {
            let config = SpectralNrConfig {
                fft_size: 256,
                hop_size: hop,
                beta: 0.0,
                ..Default::default()
            };
            let mut nr = SpectralNR::new(config).unwrap();
            let latency = nr.latency_samples();
            let input = noise(2048, 0.5, 7);
            let mut output = vec![0.0; input.len()];
            nr.process_mono(&input, &mut output);

            assert!(output[..latency].iter().all(|&s| s.abs() < 1e-6));
            for t in latency..input.len() {
                assert!(
                    (output[t] - input[t - latency]).abs() < 1e-4,
                    "hop {hop}, sample {t}: {} vs {}",
                    output[t],
                    input[t - latency]
                );
            }
        }
    }

    #[test]
    fn test_stationary_noise_is_reduced() {
        let config = SpectralNrConfig {
            fft_size: 512,
            hop_size: 128,
            beta: 2.0,
            floor_gain: 0.05,
            ..Default::default()
        };
        let mut nr = SpectralNR::new(config).unwrap();
        let mut samples = noise(48000, 0.1, 3);
        let input_rms = rms(&samples[24000..]);
        nr.process_in_place(&mut samples);
        assert!(nr.has_noise_estimate());
        assert!(rms(&samples[24000..]) < input_rms * 0.5);
    }

    fn wiener(fft_size: usize, hop_size: usize) -> SpectralNrConfig {
        SpectralNrConfig {
            fft_size,
            hop_size,
            rule: SpectralRule::Wiener,
            floor_gain: 0.05,
            ..Default::default()
        }
    }

    #[test]
    fn test_wiener_reduces_stationary_noise() {
        let mut nr = SpectralNR::new(wiener(512, 128)).unwrap();
        let mut samples = noise(48000, 0.1, 3);
        let input_rms = rms(&samples[24000..]);
        nr.process_in_place(&mut samples);
        assert!(nr.has_noise_estimate());
        assert!(rms(&samples[24000..]) < input_rms * 0.5);
    }

    #[test]
    fn test_wiener_passes_tone_over_learned_noise() {
        let mut nr = SpectralNR::new(wiener(512, 128)).unwrap();
        let latency = nr.latency_samples();

        // One second of hiss to learn the floor, then a loud tone on top
        let mut samples = noise(96000, 0.01, 9);
        let tone: Vec<f32> = (0..48000)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 48000.0).sin())
            .collect();
        for (s, t) in samples[48000..].iter_mut().zip(&tone) {
            *s += t;
        }
        let input = samples.clone();
        nr.process_in_place(&mut samples);

        // Compare a stretch well inside the tone, aligned for latency
        let out = rms(&samples[72000..90000]);
        let expected = rms(&input[72000 - latency..90000 - latency]);
        assert!(out > expected * 0.85 && out < expected * 1.1, "{out} vs {expected}");
    }

    #[test]
    fn test_wiener_snr_smoothing_range() {
        assert!(SpectralNrConfig {
            snr_smoothing: 1.0,
            ..wiener(512, 128)
        }
        .validate()
        .is_err());
        let config: SpectralNrConfig = serde_json::from_str(r#"{"rule": "wiener"}"#).unwrap();
        assert_eq!(config.rule, SpectralRule::Wiener);
        assert_eq!(config.snr_smoothing, 0.98);
    }

    #[test]
    fn test_reset_clears_prior_snr() {
        let mut nr = SpectralNR::new(wiener(64, 32)).unwrap();
        let mut samples = noise(1024, 0.2, 4);
        nr.process_in_place(&mut samples);
        nr.reset();
        assert!(nr.prior_snr.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_non_finite_input_is_dropped() {
        let config = SpectralNrConfig {
            fft_size: 64,
            hop_size: 16,
            ..Default::default()
        };
        let mut nr = SpectralNR::new(config).unwrap();
        let mut samples = vec![0.1; 512];
        samples[100] = f32::NAN;
        samples[200] = f32::INFINITY;
        nr.process_in_place(&mut samples);
        assert!(samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_reset_forgets_estimate() {
        let config = SpectralNrConfig {
            fft_size: 64,
            hop_size: 32,
            ..Default::default()
        };
        let mut nr = SpectralNR::new(config).unwrap();
        let mut samples = noise(256, 0.2, 11);
        nr.process_in_place(&mut samples);
        assert!(nr.has_noise_estimate());
        nr.reset();
        assert!(!nr.has_noise_estimate());
        assert!(nr.noise_estimate().iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_disabled_is_passthrough() {
        let mut nr = SpectralNR::new(SpectralNrConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        let input = noise(300, 0.3, 5);
        let mut output = vec![0.0; 300];
        nr.process_mono(&input, &mut output);
        assert_eq!(input, output);
    }

    #[test]
    fn test_set_config_rebuilds_layout() {
        let mut nr = SpectralNR::new(SpectralNrConfig::default()).unwrap();
        nr.set_config(SpectralNrConfig {
            fft_size: 256,
            hop_size: 64,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(nr.latency_samples(), 256);
        assert_eq!(nr.noise_estimate().len(), 129);
        assert!(nr
            .set_config(SpectralNrConfig {
                hop_size: 0,
                ..Default::default()
            })
            .is_err());
        assert_eq!(nr.config().fft_size, 256);
    }
}
