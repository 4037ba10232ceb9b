//! Feedback Delay
//!
//! Circular-buffer delay line with a single recirculating tap:
//!
//! ```text
//! delayed = line[n - d]
//! line[n] = input + feedback * delayed
//! output  = input * (1 - mix) + delayed * mix
//! ```
//!
//! The line is sized for [`MAX_DELAY_MS`] when the sample rate is set, so
//! changing the delay time never allocates. Jumping the read position can
//! click; that is accepted for a control-rate parameter.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AudioEffect, MAX_EFFECT_CHANNELS};
use crate::error::{check_range, check_sample_rate, DspError, DspResult};

/// Longest supported delay time
pub const MAX_DELAY_MS: f32 = 4000.0;

/// Feedback above this rings for too long to be useful
const MAX_FEEDBACK: f32 = 0.95;

/// Delay parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Delay time (ms, 0 to [`MAX_DELAY_MS`])
    pub delay_ms: f32,
    /// Amount of the delayed signal fed back into the line (0 to 0.95)
    pub feedback: f32,
    /// Dry/wet balance (0 = dry only, 1 = wet only)
    pub mix: f32,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            delay_ms: 250.0,
            feedback: 0.3,
            mix: 0.5,
        }
    }
}

impl DelayConfig {
    pub fn validate(&self) -> DspResult<()> {
        check_range("delay time", self.delay_ms, 0.0, MAX_DELAY_MS)?;
        check_range("feedback", self.feedback, 0.0, MAX_FEEDBACK)?;
        check_range("mix", self.mix, 0.0, 1.0)
    }
}

pub struct Delay {
    config: DelayConfig,
    sample_rate: f32,
    /// One line per channel, each `capacity` samples long
    lines: Vec<Vec<f32>>,
    write_pos: Vec<usize>,
    delay_samples: usize,
    enabled: bool,
}

impl Delay {
    /// Stereo delay at 48 kHz with default settings, disabled
    pub fn new() -> Self {
        let mut delay = Self {
            config: DelayConfig::default(),
            sample_rate: 48000.0,
            lines: Vec::new(),
            write_pos: Vec::new(),
            delay_samples: 1,
            enabled: false,
        };
        delay.allocate(2);
        delay.update_delay_samples();
        delay
    }

    pub fn with_config(config: DelayConfig) -> DspResult<Self> {
        let mut delay = Self::new();
        delay.set_config(config)?;
        Ok(delay)
    }

    pub fn config(&self) -> DelayConfig {
        self.config
    }

    /// Current delay in whole samples
    pub fn delay_samples(&self) -> usize {
        self.delay_samples
    }

    pub fn set_config(&mut self, config: DelayConfig) -> DspResult<()> {
        config.validate()?;
        self.config = config;
        self.update_delay_samples();
        debug!(?config, "delay configured");
        Ok(())
    }

    pub fn set_parameters(&mut self, delay_ms: f32, feedback: f32, mix: f32) -> DspResult<()> {
        self.set_config(DelayConfig {
            delay_ms,
            feedback,
            mix,
        })
    }

    fn capacity(&self) -> usize {
        (MAX_DELAY_MS * self.sample_rate / 1000.0).ceil() as usize + 1
    }

    fn allocate(&mut self, channels: usize) {
        let capacity = self.capacity();
        self.lines = vec![vec![0.0; capacity]; channels];
        self.write_pos = vec![0; channels];
    }

    fn update_delay_samples(&mut self) {
        let samples = (self.config.delay_ms * self.sample_rate / 1000.0).round() as usize;
        // A zero-length line would read the sample being written
        self.delay_samples = samples.clamp(1, self.capacity() - 1);
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEffect for Delay {
    #[inline]
    fn process_sample(&mut self, channel: usize, input: f32) -> f32 {
        if !self.enabled {
            return input;
        }
        let (Some(line), Some(pos)) = (self.lines.get_mut(channel), self.write_pos.get_mut(channel))
        else {
            return input;
        };
        let len = line.len();
        let read = (*pos + len - self.delay_samples) % len;
        let delayed = line[read];
        line[*pos] = input + self.config.feedback * delayed;
        *pos = (*pos + 1) % len;
        input * (1.0 - self.config.mix) + delayed * self.config.mix
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
        self.allocate(channels);
        self.update_delay_samples();
        Ok(())
    }

    fn reset(&mut self) {
        for line in &mut self.lines {
            line.fill(0.0);
        }
        self.write_pos.fill(0);
    }

    fn name(&self) -> &'static str {
        "Delay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse_response(delay: &mut Delay, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| delay.process_sample(0, if i == 0 { 1.0 } else { 0.0 }))
            .collect()
    }

    #[test]
    fn test_echo_position_and_feedback() {
        let mut delay = Delay::new();
        delay.set_sample_rate(1000.0 * 8.0, 1).unwrap();
        delay.set_parameters(1.0, 0.5, 1.0).unwrap(); // 8 samples
        delay.set_enabled(true);
        assert_eq!(delay.delay_samples(), 8);

        let out = impulse_response(&mut delay, 20);
        assert_eq!(out[0], 0.0); // fully wet
        assert_eq!(out[8], 1.0);
        assert_eq!(out[16], 0.5);
        assert!(out.iter().enumerate().all(|(i, &s)| s == 0.0 || i % 8 == 0));
    }

    #[test]
    fn test_mix_blends_dry_and_wet() {
        let mut delay = Delay::with_config(DelayConfig {
            delay_ms: 1.0,
            feedback: 0.0,
            mix: 0.25,
        })
        .unwrap();
        delay.set_sample_rate(8000.0, 1).unwrap();
        delay.set_enabled(true);
        let out = impulse_response(&mut delay, 10);
        assert_eq!(out[0], 0.75);
        assert_eq!(out[8], 0.25);
    }

    #[test]
    fn test_disabled_passthrough() {
        let mut delay = Delay::new();
        assert_eq!(delay.process_sample(0, 0.3), 0.3);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut delay = Delay::new();
        assert!(delay.set_parameters(-1.0, 0.3, 0.5).is_err());
        assert!(delay.set_parameters(5000.0, 0.3, 0.5).is_err());
        assert!(delay.set_parameters(100.0, 0.99, 0.5).is_err());
        assert!(delay.set_parameters(100.0, 0.3, 1.5).is_err());
        assert_eq!(delay.config(), DelayConfig::default());
    }

    #[test]
    fn test_max_delay_fits() {
        let mut delay = Delay::new();
        delay.set_sample_rate(48000.0, 1).unwrap();
        delay.set_parameters(MAX_DELAY_MS, 0.9, 0.5).unwrap();
        assert_eq!(delay.delay_samples(), 192_000);
        delay.set_enabled(true);
        for _ in 0..1000 {
            assert!(delay.process_sample(0, 0.5).is_finite());
        }
    }

    #[test]
    fn test_reset_clears_line() {
        let mut delay = Delay::with_config(DelayConfig {
            delay_ms: 1.0,
            feedback: 0.0,
            mix: 1.0,
        })
        .unwrap();
        delay.set_sample_rate(8000.0, 1).unwrap();
        delay.set_enabled(true);
        delay.process_sample(0, 1.0);
        delay.reset();
        let out = impulse_response(&mut delay, 1)
            .into_iter()
            .chain((0..10).map(|_| delay.process_sample(0, 0.0)))
            .collect::<Vec<_>>();
        assert_eq!(out[8], 1.0);
        assert_eq!(out.iter().filter(|&&s| s != 0.0).count(), 1);
    }

    #[test]
    fn test_unknown_channel_passthrough() {
        let mut delay = Delay::new();
        delay.set_enabled(true);
        assert_eq!(delay.process_sample(5, 0.4), 0.4);
    }
}
