//! Noise Gate (downward expander)
//!
//! Below the threshold the gain drops by `(ratio - 1)` dB for every dB the
//! envelope sits under it, and never further than `floor_db`:
//!
//! ```text
//! gain_db = max((level_db - threshold_db) * (ratio - 1), floor_db)   level < threshold
//! gain_db = 0                                                          otherwise
//! ```
//!
//! An optional rumble high-pass runs ahead of the level detector and the
//! gain stage. Each channel keeps its own envelope, gain and filter state.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::convert::{db_to_linear, linear_to_db};
use crate::effects::MAX_EFFECT_CHANNELS;
use crate::error::{check_range, check_sample_rate, DspError, DspResult};
use crate::filter::BiquadFilter;

/// Gain opens this much faster than the envelope attack
const GAIN_ATTACK_FACTOR: f32 = 0.5;
const MIN_GAIN_ATTACK_MS: f32 = 0.1;
/// Closing the gate faster than this clicks
const MIN_GAIN_RELEASE_MS: f32 = 5.0;
const HIGH_PASS_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseReducerConfig {
    pub enabled: bool,
    /// Level below which attenuation starts (dB, -80 to 0)
    pub threshold_db: f32,
    /// Expansion ratio (1 to 20, 1 = no effect)
    pub ratio: f32,
    /// Deepest attenuation (dB, -60 to 0)
    pub floor_db: f32,
    /// ms, 0.1 to 100
    pub attack_ms: f32,
    /// ms, 1 to 1000
    pub release_ms: f32,
    /// Rumble filter cutoff (Hz, 20 to 1000)
    pub high_pass_hz: f32,
    pub enable_high_pass: bool,
}

impl Default for NoiseReducerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -30.0,
            ratio: 2.0,
            floor_db: -40.0,
            attack_ms: 10.0,
            release_ms: 50.0,
            high_pass_hz: 100.0,
            enable_high_pass: true,
        }
    }
}

impl NoiseReducerConfig {
    pub fn validate(&self) -> DspResult<()> {
        check_range("threshold", self.threshold_db, -80.0, 0.0)?;
        check_range("ratio", self.ratio, 1.0, 20.0)?;
        check_range("floor", self.floor_db, -60.0, 0.0)?;
        check_range("attack", self.attack_ms, 0.1, 100.0)?;
        check_range("release", self.release_ms, 1.0, 1000.0)?;
        check_range("high-pass frequency", self.high_pass_hz, 20.0, 1000.0)
    }

    /// Static curve: gain (dB, <= 0) for an envelope level (dB)
    pub fn gain_db(&self, level_db: f32) -> f32 {
        if level_db >= self.threshold_db {
            0.0
        } else {
            ((level_db - self.threshold_db) * (self.ratio - 1.0)).max(self.floor_db)
        }
    }
}

#[derive(Debug)]
struct ChannelState {
    envelope: f32,
    gain: f32,
    high_pass: BiquadFilter,
}

/// Smoothing coefficients derived from the config and sample rate
#[derive(Debug, Clone, Copy)]
struct Coefficients {
    env_attack: f32,
    env_release: f32,
    gain_attack: f32,
    gain_release: f32,
}

impl Coefficients {
    fn new(config: &NoiseReducerConfig, sample_rate: f32) -> Self {
        use crate::effects::time_constant;
        Self {
            env_attack: time_constant(config.attack_ms, sample_rate),
            env_release: time_constant(config.release_ms, sample_rate),
            gain_attack: time_constant(
                (config.attack_ms * GAIN_ATTACK_FACTOR).max(MIN_GAIN_ATTACK_MS),
                sample_rate,
            ),
            gain_release: time_constant(config.release_ms.max(MIN_GAIN_RELEASE_MS), sample_rate),
        }
    }
}

pub struct NoiseReducer {
    config: NoiseReducerConfig,
    sample_rate: f32,
    coefficients: Coefficients,
    channels: Vec<ChannelState>,
}

impl NoiseReducer {
    pub fn new(config: NoiseReducerConfig, sample_rate: f32, channels: usize) -> DspResult<Self> {
        config.validate()?;
        check_sample_rate(sample_rate)?;
        if channels == 0 || channels > MAX_EFFECT_CHANNELS {
            return Err(DspError::InvalidChannelCount(channels));
        }
        let channels = (0..channels)
            .map(|_| Self::channel_state(&config, sample_rate))
            .collect::<DspResult<Vec<_>>>()?;
        Ok(Self {
            coefficients: Coefficients::new(&config, sample_rate),
            config,
            sample_rate,
            channels,
        })
    }

    fn channel_state(config: &NoiseReducerConfig, sample_rate: f32) -> DspResult<ChannelState> {
        let mut high_pass = BiquadFilter::new();
        high_pass.calculate_highpass(config.high_pass_hz, sample_rate, HIGH_PASS_Q)?;
        Ok(ChannelState {
            envelope: 0.0,
            gain: 1.0,
            high_pass,
        })
    }

    pub fn config(&self) -> NoiseReducerConfig {
        self.config
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Apply new parameters, keeping envelope and gain history
    pub fn set_config(&mut self, config: NoiseReducerConfig) -> DspResult<()> {
        config.validate()?;
        if config.high_pass_hz != self.config.high_pass_hz {
            for state in &mut self.channels {
                state
                    .high_pass
                    .calculate_highpass(config.high_pass_hz, self.sample_rate, HIGH_PASS_Q)?;
            }
        }
        self.coefficients = Coefficients::new(&config, self.sample_rate);
        self.config = config;
        debug!(?config, "noise gate configured");
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current attenuation of `channel` in dB (0 when fully open)
    pub fn gain_reduction_db(&self, channel: usize) -> f32 {
        self.channels
            .get(channel)
            .map(|s| -linear_to_db(s.gain))
            .unwrap_or(0.0)
    }

    pub fn reset(&mut self) {
        for state in &mut self.channels {
            state.envelope = 0.0;
            state.gain = 1.0;
            state.high_pass.reset();
        }
    }

    /// Process one channel in place
    ///
    /// # Real-time Safety
    /// No allocations, O(n).
    pub fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        if !self.config.enabled {
            return;
        }
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };
        let config = &self.config;
        let c = self.coefficients;
        for sample in samples.iter_mut() {
            let x = if config.enable_high_pass {
                state.high_pass.process_sample(*sample)
            } else {
                *sample
            };

            let level = x.abs();
            let env_coeff = if level > state.envelope {
                c.env_attack
            } else {
                c.env_release
            };
            state.envelope = env_coeff * state.envelope + (1.0 - env_coeff) * level;

            let target = db_to_linear(config.gain_db(linear_to_db(state.envelope)));
            let gain_coeff = if target > state.gain {
                c.gain_attack
            } else {
                c.gain_release
            };
            state.gain = gain_coeff * state.gain + (1.0 - gain_coeff) * target;

            *sample = x * state.gain;
        }
    }

    /// Process a mono block through channel 0
    pub fn process_mono(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        self.process_channel(0, &mut output[..n]);
        n
    }

    /// Process a stereo pair in place with independent channel state
    pub fn process_stereo(&mut self, left: &mut [f32], right: &mut [f32]) {
        self.process_channel(0, left);
        self.process_channel(1, right);
    }
}
