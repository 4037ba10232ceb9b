//! N-Band Parametric Equalizer
//!
//! Implements a cascade of BiQuad filters for audio equalization.
//! Based on the RBJ (Robert Bristow-Johnson) Audio EQ Cookbook.
//!
//! Bands run in index order; the order chosen at construction is the order
//! the signal sees. Each channel owns its own filter memory.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::{scale, AudioBuffer};
use crate::convert::db_to_linear;
use crate::error::{check_range, check_sample_rate, DspError, DspResult};
use crate::filter::{BiquadFilter, FilterType};
use crate::presets::{find_preset, preset_gain, Preset};

/// Standard EQ band frequencies (Hz) - ISO octave centers
pub const EQ_BANDS: [f32; 10] = [
    31.25,   // Sub-bass
    62.5,    // Bass
    125.0,   // Low-mid
    250.0,   // Mid
    500.0,   // Mid
    1000.0,  // Upper-mid
    2000.0,  // Presence
    4000.0,  // Brilliance
    8000.0,  // High
    16000.0, // Air
];

pub const DEFAULT_BAND_COUNT: usize = 10;
pub const MAX_BAND_COUNT: usize = 31;
pub const MIN_BAND_FREQUENCY: f32 = 20.0;
pub const MAX_BAND_FREQUENCY: f32 = 20000.0;
pub const MAX_BAND_GAIN_DB: f32 = 24.0;
pub const MIN_BAND_Q: f32 = 0.1;
pub const MAX_BAND_Q: f32 = 10.0;
pub const MAX_MASTER_GAIN_DB: f32 = 24.0;
pub const MAX_EQ_CHANNELS: usize = 8;

/// Gain-type bands flatter than this are the identity and get skipped
const FLAT_GAIN_DB: f32 = 0.01;

/// Butterworth Q, gives a smooth response
const DEFAULT_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Single EQ band configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerBand {
    pub frequency: f32,
    pub gain_db: f32,
    pub q: f32,
    pub filter_type: FilterType,
    pub enabled: bool,
}

impl EqualizerBand {
    pub fn new(frequency: f32, filter_type: FilterType) -> Self {
        Self {
            frequency,
            gain_db: 0.0,
            q: DEFAULT_Q,
            filter_type,
            enabled: true,
        }
    }

    pub fn validate(&self) -> DspResult<()> {
        check_range("frequency", self.frequency, MIN_BAND_FREQUENCY, MAX_BAND_FREQUENCY)?;
        check_range("gain", self.gain_db, -MAX_BAND_GAIN_DB, MAX_BAND_GAIN_DB)?;
        check_range("Q", self.q, MIN_BAND_Q, MAX_BAND_Q)
    }

    /// Whether the band changes the signal at all
    fn is_active(&self) -> bool {
        self.enabled && !(self.filter_type.uses_gain() && self.gain_db.abs() <= FLAT_GAIN_DB)
    }

    fn to_filter(self, sample_rate: f32) -> DspResult<BiquadFilter> {
        BiquadFilter::with_response(
            self.filter_type,
            self.frequency,
            sample_rate,
            self.q,
            self.gain_db,
        )
    }
}

/// Default band layout: ISO octaves for 10 bands, log spacing 20 Hz - 20 kHz
/// otherwise. Low shelf first, high shelf last, peaking in between.
pub fn default_bands(num_bands: usize) -> Vec<EqualizerBand> {
    (0..num_bands)
        .map(|i| {
            let frequency = if num_bands == DEFAULT_BAND_COUNT {
                EQ_BANDS[i]
            } else if num_bands == 1 {
                1000.0
            } else {
                let ratio = MAX_BAND_FREQUENCY / MIN_BAND_FREQUENCY;
                MIN_BAND_FREQUENCY * ratio.powf(i as f32 / (num_bands - 1) as f32)
            };
            let filter_type = match i {
                0 if num_bands > 1 => FilterType::LowShelf,
                i if i == num_bands - 1 && num_bands > 1 => FilterType::HighShelf,
                _ => FilterType::Peaking,
            };
            EqualizerBand::new(frequency.clamp(MIN_BAND_FREQUENCY, MAX_BAND_FREQUENCY), filter_type)
        })
        .collect()
}

/// The main equalizer processor
///
/// Designed for real-time use: no allocations in any `process*` call.
/// All setters run on the control thread and leave the previous state
/// intact when they fail.
pub struct Equalizer {
    bands: Vec<EqualizerBand>,
    /// `filters[channel][band]`
    filters: Vec<Vec<BiquadFilter>>,
    sample_rate: f32,
    master_gain_db: f32,
    master_gain_linear: f32,
    bypass: bool,
}

impl Equalizer {
    /// Create a flat stereo 10-band equalizer
    pub fn new(sample_rate: f32) -> DspResult<Self> {
        Self::with_bands(sample_rate, default_bands(DEFAULT_BAND_COUNT), 2)
    }

    /// Create an equalizer from an explicit band list
    pub fn with_bands(
        sample_rate: f32,
        bands: Vec<EqualizerBand>,
        channels: usize,
    ) -> DspResult<Self> {
        check_sample_rate(sample_rate)?;
        if bands.is_empty() || bands.len() > MAX_BAND_COUNT {
            return Err(DspError::InvalidBandCount(bands.len()));
        }
        if channels == 0 || channels > MAX_EQ_CHANNELS {
            return Err(DspError::InvalidChannelCount(channels));
        }
        for band in &bands {
            band.validate()?;
        }

        let filters = (0..channels)
            .map(|_| Self::build_filters(&bands, sample_rate))
            .collect::<DspResult<Vec<_>>>()?;

        debug!(bands = bands.len(), channels, sample_rate, "equalizer created");
        Ok(Self {
            bands,
            filters,
            sample_rate,
            master_gain_db: 0.0,
            master_gain_linear: 1.0,
            bypass: false,
        })
    }

    fn build_filters(bands: &[EqualizerBand], sample_rate: f32) -> DspResult<Vec<BiquadFilter>> {
        bands.iter().map(|b| b.to_filter(sample_rate)).collect()
    }

    pub fn num_bands(&self) -> usize {
        self.bands.len()
    }

    pub fn num_channels(&self) -> usize {
        self.filters.len()
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn bands(&self) -> &[EqualizerBand] {
        &self.bands
    }

    pub fn band(&self, index: usize) -> Option<&EqualizerBand> {
        self.bands.get(index)
    }

    pub fn master_gain_db(&self) -> f32 {
        self.master_gain_db
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Gains of every band, in band order
    pub fn gains(&self) -> Vec<f32> {
        self.bands.iter().map(|b| b.gain_db).collect()
    }

    /// Validate a modified band and install it on every channel
    fn update_band(
        &mut self,
        index: usize,
        modify: impl FnOnce(&mut EqualizerBand),
    ) -> DspResult<()> {
        let mut band = *self
            .bands
            .get(index)
            .ok_or(DspError::InvalidBandIndex(index))?;
        modify(&mut band);
        band.validate()?;
        // Compute once up front so a failure leaves everything untouched
        band.to_filter(self.sample_rate)?;

        for channel in &mut self.filters {
            channel[index].configure(
                band.filter_type,
                band.frequency,
                self.sample_rate,
                band.q,
                band.gain_db,
            )?;
        }
        self.bands[index] = band;
        Ok(())
    }

    pub fn set_band_gain(&mut self, index: usize, gain_db: f32) -> DspResult<()> {
        self.update_band(index, |b| b.gain_db = gain_db)
    }

    pub fn set_band_frequency(&mut self, index: usize, frequency: f32) -> DspResult<()> {
        self.update_band(index, |b| b.frequency = frequency)
    }

    pub fn set_band_q(&mut self, index: usize, q: f32) -> DspResult<()> {
        self.update_band(index, |b| b.q = q)
    }

    pub fn set_band_type(&mut self, index: usize, filter_type: FilterType) -> DspResult<()> {
        self.update_band(index, |b| b.filter_type = filter_type)
    }

    pub fn set_band_enabled(&mut self, index: usize, enabled: bool) -> DspResult<()> {
        self.update_band(index, |b| b.enabled = enabled)
    }

    /// Replace one band wholesale
    pub fn set_band(&mut self, index: usize, band: EqualizerBand) -> DspResult<()> {
        self.update_band(index, |b| *b = band)
    }

    pub fn set_master_gain(&mut self, gain_db: f32) -> DspResult<()> {
        check_range("master gain", gain_db, -MAX_MASTER_GAIN_DB, MAX_MASTER_GAIN_DB)?;
        self.master_gain_db = gain_db;
        self.master_gain_linear = db_to_linear(gain_db);
        Ok(())
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    /// Change the sample rate and recompute every band
    pub fn set_sample_rate(&mut self, sample_rate: f32) -> DspResult<()> {
        check_sample_rate(sample_rate)?;
        let filters = (0..self.filters.len())
            .map(|_| Self::build_filters(&self.bands, sample_rate))
            .collect::<DspResult<Vec<_>>>()?;
        self.filters = filters;
        self.sample_rate = sample_rate;
        debug!(sample_rate, "equalizer sample rate changed");
        Ok(())
    }

    /// Change how many channels keep independent filter memory
    ///
    /// Allocates. Control thread only.
    pub fn set_num_channels(&mut self, channels: usize) -> DspResult<()> {
        if channels == 0 || channels > MAX_EQ_CHANNELS {
            return Err(DspError::InvalidChannelCount(channels));
        }
        while self.filters.len() < channels {
            self.filters
                .push(Self::build_filters(&self.bands, self.sample_rate)?);
        }
        self.filters.truncate(channels);
        Ok(())
    }

    /// Overwrite band gains from a preset; frequency, Q and type are untouched
    pub fn apply_preset(&mut self, preset: &Preset) -> DspResult<()> {
        let num_bands = self.bands.len();
        let gains: Vec<f32> = (0..num_bands)
            .map(|i| preset_gain(preset, i, num_bands))
            .collect();
        self.set_gains(&gains)?;
        debug!(preset = preset.0, "equalizer preset applied");
        Ok(())
    }

    /// Apply a built-in preset by name
    pub fn load_preset(&mut self, name: &str) -> DspResult<()> {
        let preset = find_preset(name).ok_or_else(|| DspError::UnknownPreset(name.to_string()))?;
        self.apply_preset(preset)
    }

    /// Set every band gain at once (all or nothing)
    pub fn set_gains(&mut self, gains: &[f32]) -> DspResult<()> {
        if gains.len() != self.bands.len() {
            return Err(DspError::BufferSizeMismatch {
                expected: self.bands.len(),
                got: gains.len(),
            });
        }
        for &gain in gains {
            check_range("gain", gain, -MAX_BAND_GAIN_DB, MAX_BAND_GAIN_DB)?;
        }
        for (index, &gain) in gains.iter().enumerate() {
            self.set_band_gain(index, gain)?;
        }
        Ok(())
    }

    /// Process a mono block (uses channel 0's filter memory)
    ///
    /// # Real-time Safety
    /// No allocations. O(n * bands).
    #[inline]
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        self.process_channel(0, &mut output[..n]);
        n
    }

    /// Process one channel in place
    #[inline]
    pub fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        if self.bypass {
            return;
        }
        let Some(filters) = self.filters.get_mut(channel) else {
            return;
        };
        for (band, filter) in self.bands.iter().zip(filters.iter_mut()) {
            if band.is_active() {
                filter.process_in_place(samples);
            }
        }
        if self.master_gain_linear != 1.0 {
            scale(samples, self.master_gain_linear);
        }
    }

    /// Process every channel of a buffer in place
    ///
    /// Channels beyond [`Equalizer::num_channels`] pass through.
    pub fn process_buffer(&mut self, buffer: &mut AudioBuffer) {
        for (channel, samples) in buffer.channels_mut().enumerate() {
            self.process_channel(channel, samples);
        }
    }

    /// Process an interleaved buffer in-place
    ///
    /// Buffer format: [C0, C1, ..., C0, C1, ...] with
    /// [`Equalizer::num_channels`] samples per frame.
    #[inline]
    pub fn process_interleaved(&mut self, buffer: &mut [f32]) {
        if self.bypass {
            return;
        }
        let channels = self.filters.len();
        let gain = self.master_gain_linear;
        for frame in buffer.chunks_exact_mut(channels) {
            for (sample, filters) in frame.iter_mut().zip(self.filters.iter_mut()) {
                let mut x = *sample;
                for (band, filter) in self.bands.iter().zip(filters.iter_mut()) {
                    if band.is_active() {
                        x = filter.process_sample(x);
                    }
                }
                *sample = x * gain;
            }
        }
    }

    /// Combined magnitude response (dB) at `frequency`, master gain included
    pub fn frequency_response(&self, frequency: f32) -> f32 {
        let Some(filters) = self.filters.first() else {
            return 0.0;
        };
        let mut magnitude = self.master_gain_linear as f64;
        for (band, filter) in self.bands.iter().zip(filters) {
            if band.is_active() {
                magnitude *= filter.magnitude_response(frequency, self.sample_rate);
            }
        }
        (20.0 * magnitude.max(1e-12).log10()) as f32
    }

    /// Reset filter state (clear delay lines)
    ///
    /// Call when switching audio sources to prevent filter ringing
    pub fn reset(&mut self) {
        for filter in self.filters.iter_mut().flatten() {
            filter.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize) -> Vec<f32> {
        // Deterministic LCG so the test doesn't need a rand dependency
        let mut state = 0x1234_5678_u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_default_layout() {
        let eq = Equalizer::new(48000.0).unwrap();
        assert_eq!(eq.num_bands(), 10);
        assert_eq!(eq.bands()[0].filter_type, FilterType::LowShelf);
        assert_eq!(eq.bands()[9].filter_type, FilterType::HighShelf);
        for band in &eq.bands()[1..9] {
            assert_eq!(band.filter_type, FilterType::Peaking);
        }
        for (band, freq) in eq.bands().iter().zip(EQ_BANDS) {
            assert_eq!(band.frequency, freq);
            assert_eq!(band.gain_db, 0.0, "Default should be flat (0dB)");
        }
    }

    #[test]
    fn test_log_spaced_layout() {
        let bands = default_bands(5);
        assert!((bands[0].frequency - 20.0).abs() < 1e-3);
        assert!((bands[4].frequency - 20000.0).abs() < 1.0);
        for pair in bands.windows(2) {
            assert!(pair[1].frequency > pair[0].frequency);
        }
    }

    #[test]
    fn test_flat_eq_equals_bypass() {
        let input = noise(1024);
        let mut eq = Equalizer::new(44100.0).unwrap();
        let mut flat = vec![0.0; 1024];
        eq.process(&input, &mut flat);

        eq.set_bypass(true);
        let mut bypassed = vec![0.0; 1024];
        eq.process(&input, &mut bypassed);

        for (a, b) in flat.iter().zip(&bypassed) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invalid_band_index() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        assert_eq!(eq.set_band_gain(10, 3.0), Err(DspError::InvalidBandIndex(10)));
        assert!(eq.set_band_frequency(100, 500.0).is_err());
    }

    #[test]
    fn test_rejected_values_keep_previous_state() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_band_gain(3, 6.0).unwrap();
        assert!(eq.set_band_gain(3, 100.0).is_err());
        assert!(eq.set_band_q(3, 0.0).is_err());
        assert!(eq.set_band_frequency(3, f32::NAN).is_err());
        assert!(eq.set_master_gain(60.0).is_err());
        assert!(eq.set_sample_rate(-1.0).is_err());

        let band = eq.band(3).unwrap();
        assert_eq!(band.gain_db, 6.0);
        assert_eq!(band.q, DEFAULT_Q);
        assert_eq!(eq.master_gain_db(), 0.0);
        assert_eq!(eq.sample_rate(), 48000.0);
    }

    #[test]
    fn test_band_boost_changes_response() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_band_gain(5, 12.0).unwrap();
        let at_1k = eq.frequency_response(1000.0);
        assert!((at_1k - 12.0).abs() < 0.5, "got {at_1k}");
        assert!(eq.frequency_response(60.0).abs() < 1.0);
    }

    #[test]
    fn test_master_gain_applied_last() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_master_gain(-6.0).unwrap();
        let input = vec![0.5; 16];
        let mut output = vec![0.0; 16];
        eq.process(&input, &mut output);
        for s in output {
            assert!((s - 0.5 * db_to_linear(-6.0)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_preset_changes_only_gains() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_band_q(4, 2.5).unwrap();
        eq.set_band_type(4, FilterType::Notch).unwrap();
        eq.load_preset("rock").unwrap();

        assert_eq!(eq.gains(), find_preset("rock").unwrap().1.to_vec());
        assert_eq!(eq.band(4).unwrap().q, 2.5);
        assert_eq!(eq.band(4).unwrap().filter_type, FilterType::Notch);
        assert_eq!(eq.band(4).unwrap().frequency, 500.0);
    }

    #[test]
    fn test_unknown_preset() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        assert!(matches!(eq.load_preset("polka"), Err(DspError::UnknownPreset(_))));
    }

    #[test]
    fn test_disabled_band_is_skipped() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_band_gain(5, 12.0).unwrap();
        eq.set_band_enabled(5, false).unwrap();
        assert!(eq.frequency_response(1000.0).abs() < 1e-3);
    }

    #[test]
    fn test_channels_have_independent_state() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_band_gain(2, 9.0).unwrap();
        let mut buffer = AudioBuffer::new(2, 256);
        buffer.channel_mut(0).fill(0.25);
        eq.process_buffer(&mut buffer);
        // Silent right channel must stay silent
        assert!(buffer.channel(1).iter().all(|&s| s == 0.0));
        assert!(buffer.channel(0).iter().any(|&s| s != 0.25));
    }

    #[test]
    fn test_interleaved_matches_planar() {
        let signal = noise(512);
        let mut interleaved: Vec<f32> = signal.iter().flat_map(|&s| [s, -s]).collect();

        let mut a = Equalizer::new(48000.0).unwrap();
        a.load_preset("loudness").unwrap();
        a.process_interleaved(&mut interleaved);

        let mut b = Equalizer::new(48000.0).unwrap();
        b.load_preset("loudness").unwrap();
        let mut left = signal.clone();
        b.process_channel(0, &mut left);

        for (i, l) in left.iter().enumerate() {
            assert!((interleaved[2 * i] - l).abs() < 1e-6);
        }
    }

    #[test]
    fn test_sample_rate_change() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_band_gain(9, 6.0).unwrap();
        eq.set_sample_rate(22050.0).unwrap();
        // 16 kHz is above the new Nyquist; the band must still be stable
        let mut samples = noise(256);
        eq.process_channel(0, &mut samples);
        assert!(samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_set_num_channels() {
        let mut eq = Equalizer::new(48000.0).unwrap();
        eq.set_num_channels(6).unwrap();
        assert_eq!(eq.num_channels(), 6);
        assert!(eq.set_num_channels(0).is_err());
        assert_eq!(eq.num_channels(), 6);
    }
}
