//! BiQuad Filter Section
//!
//! One second-order IIR section with coefficients for the eight RBJ
//! (Robert Bristow-Johnson) Audio EQ Cookbook responses.
//!
//! Coefficients are derived in f64 here and handed to the `biquad` crate's
//! `DirectForm2Transposed` for the per-sample difference equation. Every
//! `calculate_*` call clears the filter memory; `process*` calls accumulate it.

use std::f64::consts::PI;

use biquad::{Biquad, Coefficients, DirectForm2Transposed};
use serde::{Deserialize, Serialize};

use crate::error::{check_range, DspError, DspResult};

/// Highest usable cutoff as a fraction of the sample rate (just below Nyquist)
const MAX_FREQUENCY_RATIO: f64 = 0.499;

/// Gain range accepted by the shelf/peak responses
pub const MAX_FILTER_GAIN_DB: f32 = 120.0;

/// Leading denominator coefficients smaller than this are treated as 1
const MIN_A0: f64 = 1e-12;

/// Filter response of a single section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    LowPass,
    HighPass,
    BandPass,
    Notch,
    Peaking,
    LowShelf,
    HighShelf,
    AllPass,
}

impl FilterType {
    /// Responses whose shape depends on a gain parameter
    pub fn uses_gain(self) -> bool {
        matches!(
            self,
            FilterType::Peaking | FilterType::LowShelf | FilterType::HighShelf
        )
    }
}

/// Normalized coefficients (a0 divided out)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl FilterCoefficients {
    pub const IDENTITY: Self = Self {
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
        a1: 0.0,
        a2: 0.0,
    };

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        let a0 = if a0.abs() < MIN_A0 { 1.0 } else { a0 };
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    fn is_finite(&self) -> bool {
        [self.b0, self.b1, self.b2, self.a1, self.a2]
            .iter()
            .all(|c| c.is_finite())
    }

    fn to_biquad(self) -> Coefficients<f64> {
        Coefficients {
            a1: self.a1,
            a2: self.a2,
            b0: self.b0,
            b1: self.b1,
            b2: self.b2,
        }
    }
}

/// A single biquad section with its own filter memory
pub struct BiquadFilter {
    coefficients: FilterCoefficients,
    state: DirectForm2Transposed<f64>,
    filter_type: Option<FilterType>,
}

impl BiquadFilter {
    /// Create an identity (pass-through) filter
    pub fn new() -> Self {
        Self {
            coefficients: FilterCoefficients::IDENTITY,
            state: DirectForm2Transposed::<f64>::new(FilterCoefficients::IDENTITY.to_biquad()),
            filter_type: None,
        }
    }

    /// Create a filter already configured for `filter_type`
    pub fn with_response(
        filter_type: FilterType,
        frequency: f32,
        sample_rate: f32,
        q: f32,
        gain_db: f32,
    ) -> DspResult<Self> {
        let mut filter = Self::new();
        filter.configure(filter_type, frequency, sample_rate, q, gain_db)?;
        Ok(filter)
    }

    /// Response the filter was last configured for (`None` for raw coefficients)
    pub fn filter_type(&self) -> Option<FilterType> {
        self.filter_type
    }

    pub fn coefficients(&self) -> FilterCoefficients {
        self.coefficients
    }

    /// Compute coefficients for any response; `gain_db` is ignored by the
    /// responses that don't use it
    pub fn configure(
        &mut self,
        filter_type: FilterType,
        frequency: f32,
        sample_rate: f32,
        q: f32,
        gain_db: f32,
    ) -> DspResult<()> {
        let design = Design::new(frequency, sample_rate, q)?;
        if filter_type.uses_gain() {
            check_range("gain", gain_db, -MAX_FILTER_GAIN_DB, MAX_FILTER_GAIN_DB)?;
        }
        let coefficients = design.coefficients(filter_type, gain_db as f64);
        if !coefficients.is_finite() {
            return Err(DspError::InvalidCoefficients {
                frequency,
                sample_rate,
            });
        }
        self.install(coefficients, Some(filter_type));
        Ok(())
    }

    pub fn calculate_lowpass(&mut self, frequency: f32, sample_rate: f32, q: f32) -> DspResult<()> {
        self.configure(FilterType::LowPass, frequency, sample_rate, q, 0.0)
    }

    pub fn calculate_highpass(&mut self, frequency: f32, sample_rate: f32, q: f32) -> DspResult<()> {
        self.configure(FilterType::HighPass, frequency, sample_rate, q, 0.0)
    }

    /// Constant 0 dB peak gain bandpass
    pub fn calculate_bandpass(&mut self, frequency: f32, sample_rate: f32, q: f32) -> DspResult<()> {
        self.configure(FilterType::BandPass, frequency, sample_rate, q, 0.0)
    }

    pub fn calculate_notch(&mut self, frequency: f32, sample_rate: f32, q: f32) -> DspResult<()> {
        self.configure(FilterType::Notch, frequency, sample_rate, q, 0.0)
    }

    pub fn calculate_allpass(&mut self, frequency: f32, sample_rate: f32, q: f32) -> DspResult<()> {
        self.configure(FilterType::AllPass, frequency, sample_rate, q, 0.0)
    }

    pub fn calculate_peaking(
        &mut self,
        frequency: f32,
        sample_rate: f32,
        q: f32,
        gain_db: f32,
    ) -> DspResult<()> {
        self.configure(FilterType::Peaking, frequency, sample_rate, q, gain_db)
    }

    pub fn calculate_low_shelf(
        &mut self,
        frequency: f32,
        sample_rate: f32,
        q: f32,
        gain_db: f32,
    ) -> DspResult<()> {
        self.configure(FilterType::LowShelf, frequency, sample_rate, q, gain_db)
    }

    pub fn calculate_high_shelf(
        &mut self,
        frequency: f32,
        sample_rate: f32,
        q: f32,
        gain_db: f32,
    ) -> DspResult<()> {
        self.configure(FilterType::HighShelf, frequency, sample_rate, q, gain_db)
    }

    /// Install raw coefficients: denominator `(a0, a1, a2)` first, then
    /// numerator `(b0, b1, b2)`, all normalized by `a0`
    ///
    /// No stability check is made. `(1, 0, 0, 1, 0, 0)` is the identity.
    pub fn set_coefficients(
        &mut self,
        a0: f64,
        a1: f64,
        a2: f64,
        b0: f64,
        b1: f64,
        b2: f64,
    ) -> DspResult<()> {
        let coefficients = FilterCoefficients::normalized(b0, b1, b2, a0, a1, a2);
        if !coefficients.is_finite() {
            return Err(DspError::InvalidParameter {
                name: "coefficient",
                value: f32::NAN,
                min: f32::MIN,
                max: f32::MAX,
            });
        }
        self.install(coefficients, None);
        Ok(())
    }

    fn install(&mut self, coefficients: FilterCoefficients, filter_type: Option<FilterType>) {
        self.coefficients = coefficients;
        self.filter_type = filter_type;
        self.state.update_coefficients(coefficients.to_biquad());
        self.state.reset_state();
    }

    /// Clear the filter memory
    pub fn reset(&mut self) {
        self.state.reset_state();
    }

    /// Run one sample through the section
    ///
    /// # Real-time Safety
    /// No allocations, O(1).
    #[inline]
    pub fn process_sample(&mut self, input: f32) -> f32 {
        // Checked after narrowing: a finite f64 can still overflow f32
        let output = self.state.run(input as f64) as f32;
        if output.is_finite() {
            output
        } else {
            // A blown-up state would otherwise stay NaN forever
            self.state.reset_state();
            0.0
        }
    }

    /// Filter `input` into `output`; returns the number of samples written
    #[inline]
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let n = input.len().min(output.len());
        for (out, &x) in output[..n].iter_mut().zip(&input[..n]) {
            *out = self.process_sample(x);
        }
        n
    }

    /// Filter a buffer in place
    #[inline]
    pub fn process_in_place(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }

    /// |H(e^jw)| of the current coefficients at `frequency`
    pub fn magnitude_response(&self, frequency: f32, sample_rate: f32) -> f64 {
        let c = &self.coefficients;
        let w = 2.0 * PI * frequency as f64 / sample_rate as f64;
        let (cos1, sin1) = (w.cos(), w.sin());
        let (cos2, sin2) = ((2.0 * w).cos(), (2.0 * w).sin());

        let num_re = c.b0 + c.b1 * cos1 + c.b2 * cos2;
        let num_im = -(c.b1 * sin1 + c.b2 * sin2);
        let den_re = 1.0 + c.a1 * cos1 + c.a2 * cos2;
        let den_im = -(c.a1 * sin1 + c.a2 * sin2);

        let den = (den_re * den_re + den_im * den_im).sqrt();
        if den < f64::EPSILON {
            return f64::INFINITY;
        }
        (num_re * num_re + num_im * num_im).sqrt() / den
    }
}

impl Default for BiquadFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BiquadFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiquadFilter")
            .field("filter_type", &self.filter_type)
            .field("coefficients", &self.coefficients)
            .finish()
    }
}

/// Shared intermediate terms of the cookbook formulas
///
/// All eight responses are derived here in f64; only the finished
/// coefficients are handed to `biquad` through `FilterCoefficients::to_biquad`.
struct Design {
    cos_w0: f64,
    alpha: f64,
}

impl Design {
    fn new(frequency: f32, sample_rate: f32, q: f32) -> DspResult<Self> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(DspError::InvalidSampleRate(sample_rate));
        }
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(DspError::InvalidCoefficients {
                frequency,
                sample_rate,
            });
        }
        if !q.is_finite() || q <= 0.0 {
            return Err(DspError::InvalidParameter {
                name: "Q",
                value: q,
                min: f32::MIN_POSITIVE,
                max: f32::MAX,
            });
        }

        let fs = sample_rate as f64;
        // At or above Nyquist the cookbook terms degenerate, so pin just below it
        let f = (frequency as f64).min(fs * MAX_FREQUENCY_RATIO);
        let w0 = 2.0 * PI * f / fs;
        Ok(Self {
            cos_w0: w0.cos(),
            alpha: w0.sin() / (2.0 * q as f64),
        })
    }

    fn coefficients(&self, filter_type: FilterType, gain_db: f64) -> FilterCoefficients {
        let (cos, alpha) = (self.cos_w0, self.alpha);
        match filter_type {
            FilterType::LowPass => FilterCoefficients::normalized(
                (1.0 - cos) / 2.0,
                1.0 - cos,
                (1.0 - cos) / 2.0,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
            FilterType::HighPass => FilterCoefficients::normalized(
                (1.0 + cos) / 2.0,
                -(1.0 + cos),
                (1.0 + cos) / 2.0,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
            FilterType::BandPass => FilterCoefficients::normalized(
                alpha,
                0.0,
                -alpha,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
            FilterType::Notch => FilterCoefficients::normalized(
                1.0,
                -2.0 * cos,
                1.0,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
            FilterType::AllPass => FilterCoefficients::normalized(
                1.0 - alpha,
                -2.0 * cos,
                1.0 + alpha,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
            FilterType::Peaking => {
                let a = 10.0_f64.powf(gain_db / 40.0);
                FilterCoefficients::normalized(
                    1.0 + alpha * a,
                    -2.0 * cos,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cos,
                    1.0 - alpha / a,
                )
            }
            FilterType::LowShelf => {
                let a = 10.0_f64.powf(gain_db / 40.0);
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                FilterCoefficients::normalized(
                    a * ((a + 1.0) - (a - 1.0) * cos + two_sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
                    a * ((a + 1.0) - (a - 1.0) * cos - two_sqrt_a_alpha),
                    (a + 1.0) + (a - 1.0) * cos + two_sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos),
                    (a + 1.0) + (a - 1.0) * cos - two_sqrt_a_alpha,
                )
            }
            FilterType::HighShelf => {
                let a = 10.0_f64.powf(gain_db / 40.0);
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                FilterCoefficients::normalized(
                    a * ((a + 1.0) + (a - 1.0) * cos + two_sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
                    a * ((a + 1.0) + (a - 1.0) * cos - two_sqrt_a_alpha),
                    (a + 1.0) - (a - 1.0) * cos + two_sqrt_a_alpha,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos),
                    (a + 1.0) - (a - 1.0) * cos - two_sqrt_a_alpha,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f32 = 48000.0;

    fn sine(freq: f32, sample_rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn test_identity_coefficients() {
        let mut filter = BiquadFilter::new();
        filter.set_coefficients(1.0, 0.0, 0.0, 1.0, 0.0, 0.0).unwrap();
        let input = sine(440.0, FS, 64, 0.8);
        let mut output = vec![0.0; 64];
        filter.process(&input, &mut output);
        assert_eq!(input, output);
    }

    #[test]
    fn test_zero_a0_treated_as_one() {
        let mut filter = BiquadFilter::new();
        filter.set_coefficients(0.0, 0.0, 0.0, 0.5, 0.0, 0.0).unwrap();
        assert_eq!(filter.process_sample(1.0), 0.5);
    }

    #[test]
    fn test_raw_coefficients_take_denominator_first() {
        let mut filter = BiquadFilter::new();
        // a0 = 4, b0 = 1: a quarter-gain wire
        filter.set_coefficients(4.0, 0.0, 0.0, 1.0, 0.0, 0.0).unwrap();
        assert_eq!(filter.process_sample(1.0), 0.25);
        assert_eq!(filter.coefficients().b0, 0.25);
        // y[n] = x[n] + 0.5 y[n-1]
        filter.set_coefficients(1.0, -0.5, 0.0, 1.0, 0.0, 0.0).unwrap();
        assert_eq!(filter.process_sample(1.0), 1.0);
        assert_eq!(filter.process_sample(0.0), 0.5);
    }

    #[test]
    fn test_output_overflowing_f32_resets() {
        let mut filter = BiquadFilter::new();
        filter.set_coefficients(1.0, 0.0, 0.0, 1e30, 0.0, 0.0).unwrap();
        // 1e30 * 1e10 is finite in f64 but not in f32
        assert_eq!(filter.process_sample(1e10), 0.0);
        let recovered = filter.process_sample(1.0);
        assert!(recovered.is_finite() && recovered > 1e29);
    }

    #[test]
    fn test_lowpass_passes_dc_blocks_nyquist() {
        let mut filter = BiquadFilter::new();
        filter.calculate_lowpass(1000.0, FS, 0.707).unwrap();
        assert!((filter.magnitude_response(1.0, FS) - 1.0).abs() < 1e-3);
        assert!(filter.magnitude_response(23_000.0, FS) < 0.01);
        // -3 dB at cutoff for Butterworth Q
        let at_cutoff = 20.0 * filter.magnitude_response(1000.0, FS).log10();
        assert!((at_cutoff + 3.01).abs() < 0.05, "got {at_cutoff}");
    }

    #[test]
    fn test_highpass_blocks_dc() {
        let mut filter = BiquadFilter::new();
        filter.calculate_highpass(500.0, FS, 0.707).unwrap();
        assert!(filter.magnitude_response(1.0, FS) < 1e-3);
        assert!((filter.magnitude_response(20_000.0, FS) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_bandpass_and_notch_at_center() {
        let mut bp = BiquadFilter::new();
        bp.calculate_bandpass(2000.0, FS, 2.0).unwrap();
        assert!((bp.magnitude_response(2000.0, FS) - 1.0).abs() < 1e-6);

        let mut notch = BiquadFilter::new();
        notch.calculate_notch(2000.0, FS, 2.0).unwrap();
        assert!(notch.magnitude_response(2000.0, FS) < 1e-6);
    }

    #[test]
    fn test_allpass_is_flat() {
        let mut filter = BiquadFilter::new();
        filter.calculate_allpass(1000.0, FS, 0.707).unwrap();
        for freq in [50.0, 1000.0, 5000.0, 15000.0] {
            assert!((filter.magnitude_response(freq, FS) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_peaking_gain_at_center() {
        let mut filter = BiquadFilter::new();
        filter.calculate_peaking(1000.0, FS, 1.0, 6.0).unwrap();
        let db = 20.0 * filter.magnitude_response(1000.0, FS).log10();
        assert!((db - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_shelves() {
        let mut low = BiquadFilter::new();
        low.calculate_low_shelf(200.0, FS, 0.707, -12.0).unwrap();
        let db = 20.0 * low.magnitude_response(5.0, FS).log10();
        assert!((db + 12.0).abs() < 0.1);

        let mut high = BiquadFilter::new();
        high.calculate_high_shelf(4000.0, FS, 0.707, 9.0).unwrap();
        let db = 20.0 * high.magnitude_response(23_000.0, FS).log10();
        assert!((db - 9.0).abs() < 0.2);
    }

    #[test]
    fn test_frequency_above_nyquist_is_clamped() {
        let mut filter = BiquadFilter::new();
        filter.calculate_lowpass(40_000.0, FS, 0.707).unwrap();
        let input = sine(1000.0, FS, 512, 1.0);
        let mut output = vec![0.0; 512];
        filter.process(&input, &mut output);
        assert!(output.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut filter = BiquadFilter::new();
        filter.calculate_peaking(1000.0, FS, 1.0, 3.0).unwrap();
        let before = filter.coefficients();

        assert!(filter.calculate_lowpass(1000.0, FS, 0.0).is_err());
        assert!(filter.calculate_lowpass(1000.0, FS, -1.0).is_err());
        assert!(filter.calculate_lowpass(f32::NAN, FS, 0.7).is_err());
        assert!(filter.calculate_lowpass(1000.0, 0.0, 0.7).is_err());
        assert!(filter.calculate_peaking(1000.0, FS, 1.0, 500.0).is_err());

        // Previous configuration retained
        assert_eq!(filter.coefficients(), before);
        assert_eq!(filter.filter_type(), Some(FilterType::Peaking));
    }

    #[test]
    fn test_recalculate_resets_state() {
        let mut filter = BiquadFilter::new();
        filter.calculate_lowpass(100.0, FS, 0.707).unwrap();
        for _ in 0..100 {
            filter.process_sample(1.0);
        }
        filter.calculate_lowpass(100.0, FS, 0.707).unwrap();
        let mut fresh = BiquadFilter::new();
        fresh.calculate_lowpass(100.0, FS, 0.707).unwrap();
        assert_eq!(filter.process_sample(0.5), fresh.process_sample(0.5));
    }

    #[test]
    fn test_extreme_parameters_stay_finite() {
        let input = sine(997.0, FS, 4096, 1.0);
        for filter_type in [FilterType::Peaking, FilterType::LowShelf, FilterType::HighShelf] {
            for gain in [-120.0, 120.0] {
                let mut filter =
                    BiquadFilter::with_response(filter_type, 1000.0, FS, 50.0, gain).unwrap();
                let mut output = input.clone();
                filter.process_in_place(&mut output);
                assert!(output.iter().all(|s| s.is_finite()), "{filter_type:?} {gain}");
            }
        }
    }

    #[test]
    fn test_non_finite_state_recovers() {
        let mut filter = BiquadFilter::new();
        filter.calculate_lowpass(1000.0, FS, 0.707).unwrap();
        assert_eq!(filter.process_sample(f32::NAN), 0.0);
        assert!(filter.process_sample(0.5).is_finite());
    }
}
