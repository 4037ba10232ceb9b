//! Effect Chain
//!
//! Ordered list of effects processed one after another. The chain-level
//! enable flag bypasses the whole chain; each effect keeps its own flag too.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AudioEffect, Effect, EffectKind, MAX_EFFECT_CHANNELS};
use crate::buffer::{scale, AudioBuffer};
use crate::error::{check_range, check_sample_rate, DspError, DspResult};

/// Highest master level (linear) accepted for chain input/output
const MAX_MASTER_LEVEL: f32 = 4.0;

/// Stable handle for an effect inside an [`EffectChain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectId(pub u32);

pub struct EffectChain {
    effects: Vec<(EffectId, Effect)>,
    next_id: u32,
    enabled: bool,
    sample_rate: f32,
    channels: usize,
    input_level: f32,
    output_level: f32,
}

impl EffectChain {
    pub fn new(sample_rate: f32, channels: usize) -> DspResult<Self> {
        check_sample_rate(sample_rate)?;
        if channels == 0 || channels > MAX_EFFECT_CHANNELS {
            return Err(DspError::InvalidChannelCount(channels));
        }
        Ok(Self {
            effects: Vec::new(),
            next_id: 1,
            enabled: true,
            sample_rate,
            channels,
            input_level: 1.0,
            output_level: 1.0,
        })
    }

    /// Append an effect, preparing it for the chain's stream format
    ///
    /// Note: This allocates. Only call during setup, not in audio callback.
    pub fn add_effect(&mut self, effect: impl Into<Effect>) -> DspResult<EffectId> {
        let mut effect = effect.into();
        effect.set_sample_rate(self.sample_rate, self.channels)?;
        let id = EffectId(self.next_id);
        self.next_id += 1;
        info!(id = id.0, effect = effect.name(), "effect added");
        self.effects.push((id, effect));
        Ok(id)
    }

    /// Construct a default-configured effect in place at the end of the chain
    pub fn emplace_effect<T: EffectKind + Default>(&mut self) -> DspResult<EffectId> {
        self.add_effect(T::default())
    }

    pub fn remove_effect(&mut self, id: EffectId) -> Option<Effect> {
        let index = self.effects.iter().position(|(i, _)| *i == id)?;
        let (_, effect) = self.effects.remove(index);
        info!(id = id.0, effect = effect.name(), "effect removed");
        Some(effect)
    }

    pub fn get(&self, id: EffectId) -> Option<&Effect> {
        self.effects.iter().find(|(i, _)| *i == id).map(|(_, e)| e)
    }

    pub fn get_mut(&mut self, id: EffectId) -> Option<&mut Effect> {
        self.effects
            .iter_mut()
            .find(|(i, _)| *i == id)
            .map(|(_, e)| e)
    }

    /// Borrow a built-in effect by id and concrete type
    pub fn effect<T: EffectKind>(&self, id: EffectId) -> Option<&T> {
        self.get(id).and_then(T::from_effect)
    }

    pub fn effect_mut<T: EffectKind>(&mut self, id: EffectId) -> Option<&mut T> {
        self.get_mut(id).and_then(T::from_effect_mut)
    }

    /// First effect of type `T` in chain order
    pub fn first_mut<T: EffectKind>(&mut self) -> Option<(EffectId, &mut T)> {
        self.effects
            .iter_mut()
            .find_map(|(id, e)| T::from_effect_mut(e).map(|t| (*id, t)))
    }

    /// Enable or disable one effect
    pub fn set_effect_enabled(&mut self, id: EffectId, enabled: bool) -> DspResult<()> {
        let effect = self.get_mut(id).ok_or(DspError::UnknownEffect(id.0))?;
        effect.set_enabled(enabled);
        Ok(())
    }

    /// Ids in processing order
    pub fn effect_ids(&self) -> Vec<EffectId> {
        self.effects.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Bypass (false) or engage (true) the whole chain
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        debug!(enabled, "effect chain toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Linear gains applied before the first and after the last effect
    pub fn set_master_levels(&mut self, input: f32, output: f32) -> DspResult<()> {
        check_range("input level", input, 0.0, MAX_MASTER_LEVEL)?;
        check_range("output level", output, 0.0, MAX_MASTER_LEVEL)?;
        self.input_level = input;
        self.output_level = output;
        Ok(())
    }

    pub fn master_levels(&self) -> (f32, f32) {
        (self.input_level, self.output_level)
    }

    /// Re-prepare every effect for a new stream format
    pub fn set_sample_rate(&mut self, sample_rate: f32, channels: usize) -> DspResult<()> {
        check_sample_rate(sample_rate)?;
        if channels == 0 || channels > MAX_EFFECT_CHANNELS {
            return Err(DspError::InvalidChannelCount(channels));
        }
        for (_, effect) in &mut self.effects {
            effect.set_sample_rate(sample_rate, channels)?;
        }
        self.sample_rate = sample_rate;
        self.channels = channels;
        Ok(())
    }

    /// Total delay the enabled effects add
    pub fn latency_samples(&self) -> usize {
        self.effects
            .iter()
            .filter(|(_, e)| e.is_enabled())
            .map(|(_, e)| e.latency_samples())
            .sum()
    }

    pub fn reset(&mut self) {
        for (_, effect) in &mut self.effects {
            effect.reset();
        }
    }

    /// Process one channel in place through every enabled effect
    ///
    /// # Real-time Safety
    /// No allocations. O(n * effects).
    #[inline]
    pub fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        if self.input_level != 1.0 {
            scale(samples, self.input_level);
        }
        for (_, effect) in &mut self.effects {
            if effect.is_enabled() {
                effect.process_channel(channel, samples);
            }
        }
        if self.output_level != 1.0 {
            scale(samples, self.output_level);
        }
    }

    /// Process a mono block through channel 0
    pub fn process_mono(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        self.process_channel(0, &mut output[..n]);
        n
    }

    pub fn process_buffer(&mut self, buffer: &mut AudioBuffer) {
        for (channel, samples) in buffer.channels_mut().enumerate() {
            self.process_channel(channel, samples);
        }
    }
}
