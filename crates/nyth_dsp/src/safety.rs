//! Safety Limiter
//!
//! First stage of the chain. Guarantees that everything downstream sees
//! finite samples that never exceed full scale:
//!
//! 1. NaN and infinite samples are replaced with silence
//! 2. Optional DC offset removal (one-pole high-pass at a few Hz)
//! 3. Above the threshold, either tanh saturation into the headroom left to
//!    full scale (soft) or a clamp at the threshold itself (hard)
//! 4. Feedback detection: the peak normalized autocorrelation of the limited
//!    block over lags of 32 to 512 samples. A howling loop is close to
//!    periodic and scores near 1; broadband material stays near 0.
//!
//! Threshold and switches live in [`SafetyControls`], a set of atomics that
//! the control thread can adjust while the audio thread keeps processing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::AudioBuffer;
use crate::convert::{db_to_linear, linear_to_db};
use crate::effects::MAX_EFFECT_CHANNELS;
use crate::error::{check_range, DspError, DspResult};

/// DC blocker pole, about 38 Hz corner at 48 kHz
const DC_POLE: f32 = 0.995;

/// Shortest lag searched for feedback periodicity
const FEEDBACK_MIN_LAG: usize = 32;
/// Longest lag searched; blocks shorter than twice this search up to half their length
const FEEDBACK_MAX_LAG: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enabled: bool,
    /// Output ceiling (dBFS, -24 to 0)
    pub threshold_db: f32,
    /// Saturate smoothly above the threshold instead of clamping
    pub soft_clip: bool,
    pub dc_removal: bool,
    /// Score each block for feedback periodicity
    pub feedback_detection: bool,
    /// Score at which a block counts as feedback (0 to 1)
    pub feedback_threshold: f32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -1.0,
            soft_clip: true,
            dc_removal: false,
            feedback_detection: true,
            feedback_threshold: 0.95,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> DspResult<()> {
        check_range("safety threshold", self.threshold_db, -24.0, 0.0)?;
        check_range("feedback threshold", self.feedback_threshold, 0.0, 1.0)
    }
}

/// What the limiter saw in one block
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    /// Peak magnitude of the finite input samples
    pub peak: f32,
    pub rms: f32,
    /// Mean of the finite input samples
    pub dc_offset: f32,
    /// Samples the limiter had to pull under the threshold
    pub clipped_samples: usize,
    pub non_finite_samples: usize,
    /// Input peak went over the threshold while limiting was on
    pub overload: bool,
    /// Highest normalized autocorrelation over the searched lags (0 to 1)
    pub feedback_score: f32,
    pub feedback_likely: bool,
}

impl SafetyReport {
    /// True when the block needed intervention worth reporting
    pub fn needs_attention(&self) -> bool {
        self.clipped_samples > 0 || self.non_finite_samples > 0 || self.feedback_likely
    }
}

/// Lock-free limiter settings shared between control and audio threads
#[derive(Debug)]
pub struct SafetyControls {
    /// Linear threshold stored as f32 bits
    threshold_bits: AtomicU32,
    enabled: AtomicBool,
    soft_clip: AtomicBool,
    dc_removal: AtomicBool,
    feedback_detection: AtomicBool,
    feedback_threshold_bits: AtomicU32,
}

impl SafetyControls {
    fn new(config: &SafetyConfig) -> Self {
        Self {
            threshold_bits: AtomicU32::new(db_to_linear(config.threshold_db).to_bits()),
            enabled: AtomicBool::new(config.enabled),
            soft_clip: AtomicBool::new(config.soft_clip),
            dc_removal: AtomicBool::new(config.dc_removal),
            feedback_detection: AtomicBool::new(config.feedback_detection),
            feedback_threshold_bits: AtomicU32::new(config.feedback_threshold.to_bits()),
        }
    }

    /// Set the ceiling in dBFS
    pub fn set_threshold_db(&self, db: f32) -> DspResult<()> {
        check_range("safety threshold", db, -24.0, 0.0)?;
        self.threshold_bits
            .store(db_to_linear(db).to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Current ceiling (linear)
    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_soft_clip(&self, soft_clip: bool) {
        self.soft_clip.store(soft_clip, Ordering::Relaxed);
    }

    pub fn set_dc_removal(&self, dc_removal: bool) {
        self.dc_removal.store(dc_removal, Ordering::Relaxed);
    }

    pub fn set_feedback_detection(&self, enabled: bool) {
        self.feedback_detection.store(enabled, Ordering::Relaxed);
    }

    pub fn set_feedback_threshold(&self, threshold: f32) -> DspResult<()> {
        check_range("feedback threshold", threshold, 0.0, 1.0)?;
        self.feedback_threshold_bits
            .store(threshold.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn feedback_threshold(&self) -> f32 {
        f32::from_bits(self.feedback_threshold_bits.load(Ordering::Relaxed))
    }

    fn store(&self, config: &SafetyConfig) {
        self.threshold_bits
            .store(db_to_linear(config.threshold_db).to_bits(), Ordering::Relaxed);
        self.set_enabled(config.enabled);
        self.set_soft_clip(config.soft_clip);
        self.set_dc_removal(config.dc_removal);
        self.set_feedback_detection(config.feedback_detection);
        self.feedback_threshold_bits
            .store(config.feedback_threshold.to_bits(), Ordering::Relaxed);
    }

    /// Settings as a plain config
    pub fn config(&self) -> SafetyConfig {
        SafetyConfig {
            enabled: self.is_enabled(),
            threshold_db: linear_to_db(self.threshold()),
            soft_clip: self.soft_clip.load(Ordering::Relaxed),
            dc_removal: self.dc_removal.load(Ordering::Relaxed),
            feedback_detection: self.feedback_detection.load(Ordering::Relaxed),
            feedback_threshold: self.feedback_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DcBlocker {
    x1: f32,
    y1: f32,
}

impl DcBlocker {
    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = x - self.x1 + DC_POLE * self.y1;
        self.x1 = x;
        self.y1 = y;
        y
    }
}

/// Per-channel accumulation for one block
#[derive(Default)]
struct Tally {
    peak: f32,
    sum: f64,
    sum_squares: f64,
    finite: usize,
    clipped: usize,
    non_finite: usize,
    overload: bool,
    feedback_score: f32,
    feedback_likely: bool,
}

impl Tally {
    fn report(&self) -> SafetyReport {
        let (dc_offset, rms) = if self.finite > 0 {
            let n = self.finite as f64;
            ((self.sum / n) as f32, (self.sum_squares / n).sqrt() as f32)
        } else {
            (0.0, 0.0)
        };
        SafetyReport {
            peak: self.peak,
            rms,
            dc_offset,
            clipped_samples: self.clipped,
            non_finite_samples: self.non_finite,
            overload: self.overload,
            feedback_score: self.feedback_score,
            feedback_likely: self.feedback_likely,
        }
    }
}

pub struct SafetyLimiter {
    controls: Arc<SafetyControls>,
    dc: Vec<DcBlocker>,
}

impl SafetyLimiter {
    pub fn new(config: SafetyConfig, channels: usize) -> DspResult<Self> {
        config.validate()?;
        if channels == 0 || channels > MAX_EFFECT_CHANNELS {
            return Err(DspError::InvalidChannelCount(channels));
        }
        Ok(Self {
            controls: Arc::new(SafetyControls::new(&config)),
            dc: vec![DcBlocker::default(); channels],
        })
    }

    /// Shared handle for adjusting the limiter from another thread
    pub fn controls(&self) -> Arc<SafetyControls> {
        Arc::clone(&self.controls)
    }

    pub fn config(&self) -> SafetyConfig {
        self.controls.config()
    }

    pub fn set_config(&mut self, config: SafetyConfig) -> DspResult<()> {
        config.validate()?;
        self.controls.store(&config);
        debug!(?config, "safety limiter configured");
        Ok(())
    }

    /// Resize per-channel DC state
    ///
    /// Note: This allocates. Only call during setup, not in audio callback.
    pub fn set_num_channels(&mut self, channels: usize) -> DspResult<()> {
        if channels == 0 || channels > MAX_EFFECT_CHANNELS {
            return Err(DspError::InvalidChannelCount(channels));
        }
        self.dc.resize(channels, DcBlocker::default());
        Ok(())
    }

    pub fn reset(&mut self) {
        self.dc.fill(DcBlocker::default());
    }

    fn process_into(&mut self, channel: usize, samples: &mut [f32], tally: &mut Tally) {
        let enabled = self.controls.is_enabled();
        let threshold = self.controls.threshold();
        let soft = self.controls.soft_clip.load(Ordering::Relaxed);
        let mut dc = if self.controls.dc_removal.load(Ordering::Relaxed) {
            self.dc.get_mut(channel)
        } else {
            None
        };
        let mut peak = 0.0f32;

        for sample in samples.iter_mut() {
            let x = *sample;
            if !x.is_finite() {
                tally.non_finite += 1;
                if enabled {
                    *sample = 0.0;
                }
                continue;
            }
            tally.finite += 1;
            peak = peak.max(x.abs());
            tally.sum += x as f64;
            tally.sum_squares += (x as f64) * (x as f64);

            if !enabled {
                continue;
            }
            let y = match dc.as_deref_mut() {
                Some(blocker) => blocker.process(x),
                None => x,
            };
            if y.abs() > threshold {
                tally.clipped += 1;
                *sample = if soft {
                    soft_clip(y, threshold)
                } else {
                    y.clamp(-threshold, threshold)
                };
            } else {
                *sample = y;
            }
        }

        tally.peak = tally.peak.max(peak);
        if !enabled {
            return;
        }
        tally.overload |= peak > threshold;
        if self.controls.feedback_detection.load(Ordering::Relaxed) {
            let score = feedback_score(samples);
            tally.feedback_score = tally.feedback_score.max(score);
            tally.feedback_likely |= score >= self.controls.feedback_threshold();
        }
    }

    /// Limit one channel in place
    ///
    /// # Real-time Safety
    /// No allocations, no locks, O(n).
    pub fn process_channel(&mut self, channel: usize, samples: &mut [f32]) -> SafetyReport {
        let mut tally = Tally::default();
        self.process_into(channel, samples, &mut tally);
        tally.report()
    }

    /// Limit every channel of `buffer`; the report covers all of them
    pub fn process_buffer(&mut self, buffer: &mut AudioBuffer) -> SafetyReport {
        let mut tally = Tally::default();
        for (channel, samples) in buffer.channels_mut().enumerate() {
            self.process_into(channel, samples, &mut tally);
        }
        tally.report()
    }
}

/// Peak normalized autocorrelation of the mean-removed block
///
/// Zero for silence, constant blocks and blocks too short to hold the
/// shortest lag twice.
fn feedback_score(samples: &[f32]) -> f32 {
    let n = samples.len();
    let max_lag = (n / 2).min(FEEDBACK_MAX_LAG);
    if max_lag < FEEDBACK_MIN_LAG {
        return 0.0;
    }
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n as f64;
    let energy: f64 = samples.iter().map(|&s| (s as f64 - mean).powi(2)).sum();
    if energy < 1e-12 {
        return 0.0;
    }

    let mut best = 0.0f64;
    for lag in FEEDBACK_MIN_LAG..=max_lag {
        let (mut cross, mut head, mut tail) = (0.0f64, 0.0f64, 0.0f64);
        for (&a, &b) in samples[..n - lag].iter().zip(&samples[lag..]) {
            let (a, b) = (a as f64 - mean, b as f64 - mean);
            cross += a * b;
            head += a * a;
            tail += b * b;
        }
        let norm = (head * tail).sqrt();
        if norm > 0.0 {
            best = best.max(cross / norm);
        }
    }
    best.clamp(0.0, 1.0) as f32
}

/// Tanh saturation above `threshold`
///
/// The excess over the threshold is squeezed into the headroom left to full
/// scale: continuous at the threshold, asymptotic to 1.0, polarity kept.
#[inline]
fn soft_clip(sample: f32, threshold: f32) -> f32 {
    let magnitude = sample.abs();
    if magnitude <= threshold {
        return sample;
    }
    let headroom = (1.0 - threshold).max(1e-3);
    let excess = (magnitude - threshold) / headroom;
    (sample.signum() * (threshold + headroom * excess.tanh())).clamp(-1.0, 1.0)
}
