//! Audio Effects
//!
//! Effects share one capability interface ([`AudioEffect`]). The chain
//! stores them as the closed [`Effect`] enum so the hot loop dispatches with
//! a `match` instead of a vtable; anything outside the built-in set rides in
//! [`Effect::Custom`].
//!
//! Available effects:
//! - **Compressor**: feed-forward compressor with soft knee and makeup gain
//! - **Delay**: single-tap feedback delay line

mod chain;
mod compressor;
mod delay;

pub use chain::{EffectChain, EffectId};
pub use compressor::{Compressor, CompressorConfig, CompressorMetrics};
pub use delay::{Delay, DelayConfig, MAX_DELAY_MS};

use crate::error::DspResult;

/// Highest channel count an effect keeps independent state for
pub const MAX_EFFECT_CHANNELS: usize = 8;

/// Capability interface shared by every effect
///
/// # Real-time Safety Contract
///
/// `process_*` implementations MUST NOT allocate, lock, or block.
/// `set_sample_rate` is the one place an effect may allocate, and it is
/// only ever called from the control thread.
pub trait AudioEffect: Send {
    /// Process one sample of `channel`
    fn process_sample(&mut self, channel: usize, input: f32) -> f32;

    /// Process a mono block through channel 0's state
    fn process_mono(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        self.process_channel(0, &mut output[..n]);
        n
    }

    /// Process one channel in place
    fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        if !self.is_enabled() {
            return;
        }
        for sample in samples.iter_mut() {
            *sample = self.process_sample(channel, *sample);
        }
    }

    fn set_enabled(&mut self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Reallocate per-channel state for a new stream format
    fn set_sample_rate(&mut self, sample_rate: f32, channels: usize) -> DspResult<()>;

    /// Clear envelopes, delay lines and other history
    fn reset(&mut self);

    /// Human-readable name for debugging/UI
    fn name(&self) -> &'static str;

    /// Delay this effect adds to the signal path
    fn latency_samples(&self) -> usize {
        0
    }
}

/// Closed set of effect kinds held by [`EffectChain`]
pub enum Effect {
    Compressor(Compressor),
    Delay(Delay),
    Custom(Box<dyn AudioEffect>),
}

/// Generates the `match` dispatch for every [`AudioEffect`] method
macro_rules! dispatch {
    ($self:ident, $effect:ident => $body:expr) => {
        match $self {
            Effect::Compressor($effect) => $body,
            Effect::Delay($effect) => $body,
            Effect::Custom($effect) => $body,
        }
    };
}

impl AudioEffect for Effect {
    #[inline]
    fn process_sample(&mut self, channel: usize, input: f32) -> f32 {
        dispatch!(self, e => e.process_sample(channel, input))
    }

    #[inline]
    fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        dispatch!(self, e => e.process_channel(channel, samples))
    }

    fn set_enabled(&mut self, enabled: bool) {
        dispatch!(self, e => e.set_enabled(enabled))
    }

    fn is_enabled(&self) -> bool {
        dispatch!(self, e => e.is_enabled())
    }

    fn set_sample_rate(&mut self, sample_rate: f32, channels: usize) -> DspResult<()> {
        dispatch!(self, e => e.set_sample_rate(sample_rate, channels))
    }

    fn reset(&mut self) {
        dispatch!(self, e => e.reset())
    }

    fn name(&self) -> &'static str {
        dispatch!(self, e => e.name())
    }

    fn latency_samples(&self) -> usize {
        dispatch!(self, e => e.latency_samples())
    }
}

impl From<Compressor> for Effect {
    fn from(effect: Compressor) -> Self {
        Effect::Compressor(effect)
    }
}

impl From<Delay> for Effect {
    fn from(effect: Delay) -> Self {
        Effect::Delay(effect)
    }
}

impl From<Box<dyn AudioEffect>> for Effect {
    fn from(effect: Box<dyn AudioEffect>) -> Self {
        Effect::Custom(effect)
    }
}

/// Built-in effect types that can be borrowed back out of an [`Effect`]
pub trait EffectKind: Into<Effect> {
    fn from_effect_mut(effect: &mut Effect) -> Option<&mut Self>;
    fn from_effect(effect: &Effect) -> Option<&Self>;
}

impl EffectKind for Compressor {
    fn from_effect_mut(effect: &mut Effect) -> Option<&mut Self> {
        match effect {
            Effect::Compressor(c) => Some(c),
            _ => None,
        }
    }

    fn from_effect(effect: &Effect) -> Option<&Self> {
        match effect {
            Effect::Compressor(c) => Some(c),
            _ => None,
        }
    }
}

impl EffectKind for Delay {
    fn from_effect_mut(effect: &mut Effect) -> Option<&mut Self> {
        match effect {
            Effect::Delay(d) => Some(d),
            _ => None,
        }
    }

    fn from_effect(effect: &Effect) -> Option<&Self> {
        match effect {
            Effect::Delay(d) => Some(d),
            _ => None,
        }
    }
}

/// Per-sample smoothing coefficient for a time constant in milliseconds:
/// `exp(-1 / (tau_ms * sample_rate / 1000))`
#[inline]
pub(crate) fn time_constant(tau_ms: f32, sample_rate: f32) -> f32 {
    let samples = tau_ms * sample_rate / 1000.0;
    if samples <= 0.0 {
        return 0.0;
    }
    (-1.0 / samples).exp()
}
