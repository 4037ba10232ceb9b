//! FFT Engine
//!
//! Thin wrapper around a pair of `rustfft` plans (forward + inverse) with
//! preallocated work buffers, shared by the spectrum analyzer and the
//! spectral noise reducer. Planning happens once at construction; the
//! transforms themselves never allocate.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::error::{DspError, DspResult};

pub const MIN_FFT_SIZE: usize = 64;
pub const MAX_FFT_SIZE: usize = 8192;

/// Power of two in [`MIN_FFT_SIZE`, `MAX_FFT_SIZE`]
pub fn validate_fft_size(size: usize) -> DspResult<()> {
    if size.is_power_of_two() && (MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(DspError::InvalidFftSize(size))
    }
}

/// Symmetric Hann window (zero at both ends), used for one-shot analysis
pub fn hann_symmetric(size: usize) -> Vec<f32> {
    if size <= 1 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f32 / (size - 1) as f32).cos()))
        .collect()
}

/// Periodic Hann window, the variant that overlap-adds cleanly
pub fn hann_periodic(size: usize) -> Vec<f32> {
    (0..size)
        .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f32 / size as f32).cos()))
        .collect()
}

/// Complex FFT of a real signal with reusable buffers
pub struct FftEngine {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl FftEngine {
    pub fn new(size: usize) -> DspResult<Self> {
        validate_fft_size(size)?;
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Ok(Self {
            size,
            forward,
            inverse,
            buffer: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of non-negative frequency bins (DC through Nyquist)
    pub fn num_bins(&self) -> usize {
        self.size / 2 + 1
    }

    /// Transform `input`, zero-padding or truncating it to the FFT size
    pub fn forward(&mut self, input: &[f32]) {
        let n = input.len().min(self.size);
        for (slot, &x) in self.buffer.iter_mut().zip(&input[..n]) {
            *slot = Complex::new(x, 0.0);
        }
        for slot in &mut self.buffer[n..] {
            *slot = Complex::new(0.0, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
    }

    /// Transform `input * window` sample by sample
    pub fn forward_windowed(&mut self, input: &[f32], window: &[f32]) {
        let n = input.len().min(window.len()).min(self.size);
        for ((slot, &x), &w) in self.buffer.iter_mut().zip(&input[..n]).zip(window) {
            *slot = Complex::new(x * w, 0.0);
        }
        for slot in &mut self.buffer[n..] {
            *slot = Complex::new(0.0, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
    }

    /// Full complex spectrum from the last forward transform
    pub fn spectrum(&self) -> &[Complex<f32>] {
        &self.buffer
    }

    pub fn spectrum_mut(&mut self) -> &mut [Complex<f32>] {
        &mut self.buffer
    }

    /// |X[k]| for the non-negative bins
    pub fn magnitudes(&self, output: &mut [f32]) {
        for (out, bin) in output.iter_mut().zip(&self.buffer[..self.num_bins()]) {
            *out = bin.norm();
        }
    }

    /// Inverse-transform the current spectrum into `output` (scaled by 1/N)
    pub fn inverse(&mut self, output: &mut [f32]) {
        self.inverse
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
        let scale = 1.0 / self.size as f32;
        for (out, bin) in output.iter_mut().zip(&self.buffer) {
            *out = bin.re * scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fft_size_validation() {
        assert!(FftEngine::new(1024).is_ok());
        assert!(FftEngine::new(32).is_err());
        assert!(FftEngine::new(1000).is_err());
        assert!(FftEngine::new(16384).is_err());
    }

    #[test]
    fn test_hann_windows() {
        let w = hann_symmetric(64);
        assert!(w[0] < 1e-6 && w[63] < 1e-6);
        let p = hann_periodic(64);
        assert!(p[0] < 1e-6);
        assert!((p[32] - 1.0).abs() < 1e-6);
        // Periodic Hann at 50% overlap sums to a constant
        for i in 0..32 {
            assert!((p[i] + p[i + 32] - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sine_peaks_in_expected_bin() {
        let size = 256;
        let mut fft = FftEngine::new(size).unwrap();
        let input: Vec<f32> = (0..size)
            .map(|i| (2.0 * PI * 16.0 * i as f32 / size as f32).sin())
            .collect();
        fft.forward(&input);
        let mut mags = vec![0.0; fft.num_bins()];
        fft.magnitudes(&mut mags);
        let peak = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(16));
        assert!((mags[16] - size as f32 / 2.0).abs() < 0.01);
    }

    #[test]
    fn test_round_trip_restores_signal() {
        let size = 128;
        let mut fft = FftEngine::new(size).unwrap();
        let input: Vec<f32> = (0..size).map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5).collect();
        fft.forward(&input);
        let mut output = vec![0.0; size];
        fft.inverse(&mut output);
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
