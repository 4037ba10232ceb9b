//! Dynamic Range Compressor
//!
//! Feed-forward design: a peak envelope follower drives a static gain
//! curve (threshold/ratio with an optional quadratic soft knee), and the
//! makeup gain is applied after the curve.
//!
//! Stereo is handled as independent channels. Every channel has its own
//! envelope, sized by `set_sample_rate(rate, channels)`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{time_constant, AudioEffect, MAX_EFFECT_CHANNELS};
use crate::convert::{db_to_linear, linear_to_db, MIN_DB};
use crate::error::{check_range, check_sample_rate, DspError, DspResult};

/// Keeps the envelope out of log10(0)
const ENVELOPE_FLOOR: f32 = 1e-9;

/// Compressor parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    /// Level where compression starts (dB, -60 to 0)
    pub threshold_db: f32,
    /// Input:output ratio above threshold (1 to 20)
    pub ratio: f32,
    /// Envelope attack time constant (ms, 0.1 to 100)
    pub attack_ms: f32,
    /// Envelope release time constant (ms, 1 to 1000)
    pub release_ms: f32,
    /// Soft knee width centred on the threshold (dB, 0 = hard knee, up to 24)
    pub knee_db: f32,
    /// Gain applied after the curve (dB, -12 to 24)
    pub makeup_db: f32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            threshold_db: -20.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            knee_db: 6.0,
            makeup_db: 0.0,
        }
    }
}

impl CompressorConfig {
    pub fn validate(&self) -> DspResult<()> {
        check_range("threshold", self.threshold_db, -60.0, 0.0)?;
        check_range("ratio", self.ratio, 1.0, 20.0)?;
        check_range("attack", self.attack_ms, 0.1, 100.0)?;
        check_range("release", self.release_ms, 1.0, 1000.0)?;
        check_range("knee", self.knee_db, 0.0, 24.0)?;
        check_range("makeup gain", self.makeup_db, -12.0, 24.0)
    }

    /// Static curve: output level (dB) for an input level (dB)
    pub fn output_level(&self, input_db: f32) -> f32 {
        let over = input_db - self.threshold_db;
        let knee = self.knee_db;
        if knee > 0.0 && 2.0 * over.abs() <= knee {
            let x = over + knee / 2.0;
            input_db + (1.0 / self.ratio - 1.0) * x * x / (2.0 * knee)
        } else if over > 0.0 {
            self.threshold_db + over / self.ratio
        } else {
            input_db
        }
    }
}

/// Snapshot of the last processed block, for meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressorMetrics {
    pub input_level_db: f32,
    pub output_level_db: f32,
    /// Positive dB of attenuation (0 when idle)
    pub gain_reduction_db: f32,
    pub ratio: f32,
    /// True when any gain reduction happened in the last block
    pub active: bool,
}

impl Default for CompressorMetrics {
    fn default() -> Self {
        Self {
            input_level_db: MIN_DB,
            output_level_db: MIN_DB,
            gain_reduction_db: 0.0,
            ratio: 1.0,
            active: false,
        }
    }
}

pub struct Compressor {
    config: CompressorConfig,
    sample_rate: f32,
    attack_coeff: f32,
    release_coeff: f32,
    makeup_linear: f32,
    /// Linear peak envelope per channel
    envelopes: Vec<f32>,
    metrics: CompressorMetrics,
    enabled: bool,
}

impl Compressor {
    /// Stereo compressor at 48 kHz with default settings, disabled
    pub fn new() -> Self {
        let config = CompressorConfig::default();
        let sample_rate = 48000.0;
        Self {
            config,
            sample_rate,
            attack_coeff: time_constant(config.attack_ms, sample_rate),
            release_coeff: time_constant(config.release_ms, sample_rate),
            makeup_linear: db_to_linear(config.makeup_db),
            envelopes: vec![0.0; 2],
            metrics: CompressorMetrics::default(),
            enabled: false,
        }
    }

    pub fn with_config(config: CompressorConfig) -> DspResult<Self> {
        let mut compressor = Self::new();
        compressor.set_config(config)?;
        Ok(compressor)
    }

    pub fn config(&self) -> CompressorConfig {
        self.config
    }

    pub fn metrics(&self) -> CompressorMetrics {
        self.metrics
    }

    /// Replace every parameter at once
    pub fn set_config(&mut self, config: CompressorConfig) -> DspResult<()> {
        config.validate()?;
        self.config = config;
        self.update_coefficients();
        debug!(?config, "compressor configured");
        Ok(())
    }

    /// Set the main parameters, keeping the current knee
    pub fn set_parameters(
        &mut self,
        threshold_db: f32,
        ratio: f32,
        attack_ms: f32,
        release_ms: f32,
        makeup_db: f32,
    ) -> DspResult<()> {
        self.set_config(CompressorConfig {
            threshold_db,
            ratio,
            attack_ms,
            release_ms,
            makeup_db,
            ..self.config
        })
    }

    pub fn set_knee(&mut self, knee_db: f32) -> DspResult<()> {
        self.set_config(CompressorConfig {
            knee_db,
            ..self.config
        })
    }

    fn update_coefficients(&mut self) {
        self.attack_coeff = time_constant(self.config.attack_ms, self.sample_rate);
        self.release_coeff = time_constant(self.config.release_ms, self.sample_rate);
        self.makeup_linear = db_to_linear(self.config.makeup_db);
    }

    #[inline]
    fn follow(&mut self, channel: usize, input: f32) -> f32 {
        // A NaN would stick in the envelope and switch the curve off for good
        let level = if input.is_finite() { input.abs() } else { 0.0 };
        let envelope = &mut self.envelopes[channel];
        let coeff = if level > *envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        *envelope = coeff * *envelope + (1.0 - coeff) * level;
        *envelope
    }

    /// Gain-computer output for one sample; returns (gain, reduction dB)
    #[inline]
    fn compute_gain(&self, envelope: f32) -> (f32, f32) {
        let level_db = linear_to_db(envelope.max(ENVELOPE_FLOOR));
        let reduction_db = level_db - self.config.output_level(level_db);
        (
            db_to_linear(-reduction_db) * self.makeup_linear,
            reduction_db,
        )
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEffect for Compressor {
    #[inline]
    fn process_sample(&mut self, channel: usize, input: f32) -> f32 {
        if !self.enabled || channel >= self.envelopes.len() {
            return input;
        }
        let envelope = self.follow(channel, input);
        let (gain, _) = self.compute_gain(envelope);
        input * gain
    }

    fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        if !self.enabled || channel >= self.envelopes.len() || samples.is_empty() {
            return;
        }
        let mut input_peak = 0.0_f32;
        let mut output_peak = 0.0_f32;
        let mut max_reduction = 0.0_f32;
        for sample in samples.iter_mut() {
            let envelope = self.follow(channel, *sample);
            let (gain, reduction_db) = self.compute_gain(envelope);
            input_peak = input_peak.max(sample.abs());
            *sample *= gain;
            output_peak = output_peak.max(sample.abs());
            max_reduction = max_reduction.max(reduction_db);
        }
        self.metrics = CompressorMetrics {
            input_level_db: linear_to_db(input_peak),
            output_level_db: linear_to_db(output_peak),
            gain_reduction_db: max_reduction,
            ratio: self.config.ratio,
            active: max_reduction > 0.0,
        };
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_sample_rate(&mut self, sample_rate: f32, channels: usize) -> DspResult<()> {
        check_sample_rate(sample_rate)?;
        if channels == 0 || channels > MAX_EFFECT_CHANNELS {
            return Err(DspError::InvalidChannelCount(channels));
        }
        self.sample_rate = sample_rate;
        self.envelopes = vec![0.0; channels];
        self.update_coefficients();
        Ok(())
    }

    fn reset(&mut self) {
        self.envelopes.fill(0.0);
        self.metrics = CompressorMetrics::default();
    }

    fn name(&self) -> &'static str {
        "Compressor"
    }
}
