//! Multi-channel Audio Buffer
//!
//! Planar float storage in one contiguous vector. Each channel's stride is
//! rounded up to a whole number of 4-float lanes, so channel starts are a
//! multiple of 16 bytes apart. The gain and mix kernels walk the data in 4-sample blocks (which
//! the compiler turns into SIMD on every target we ship) and finish with a
//! scalar tail.
//!
//! # Error Policy
//!
//! Nothing in here returns an error on the audio path. An out-of-range
//! channel yields an empty slice, and copies/ranges are clamped to what is
//! actually available. Callers that care use the returned sample counts.

use crate::error::{DspError, DspResult};

/// Floats per SIMD lane
pub const SIMD_WIDTH: usize = 4;

/// Round a sample count up to the SIMD width
#[inline]
pub fn aligned_len(samples: usize) -> usize {
    (samples + SIMD_WIDTH - 1) & !(SIMD_WIDTH - 1)
}

/// Owned, lane-strided, planar multi-channel float storage
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    data: Vec<f32>,
    num_channels: usize,
    num_samples: usize,
    aligned_samples: usize,
}

impl AudioBuffer {
    /// Allocate a zeroed buffer of `channels` x `samples`
    ///
    /// This is the only allocation the buffer ever makes.
    pub fn new(channels: usize, samples: usize) -> Self {
        let aligned_samples = aligned_len(samples);
        Self {
            data: vec![0.0; channels * aligned_samples],
            num_channels: channels,
            num_samples: samples,
            aligned_samples,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Per-channel stride (always a multiple of [`SIMD_WIDTH`])
    pub fn aligned_samples(&self) -> usize {
        self.aligned_samples
    }

    /// Change the active length without reallocating
    ///
    /// Fails if `samples` exceeds the capacity chosen at construction.
    pub fn set_num_samples(&mut self, samples: usize) -> DspResult<()> {
        if samples > self.aligned_samples {
            return Err(DspError::BufferSizeMismatch {
                expected: self.aligned_samples,
                got: samples,
            });
        }
        self.num_samples = samples;
        Ok(())
    }

    /// Active samples of `channel`, or an empty slice if it doesn't exist
    pub fn channel(&self, channel: usize) -> &[f32] {
        if channel >= self.num_channels {
            return &[];
        }
        let start = channel * self.aligned_samples;
        &self.data[start..start + self.num_samples]
    }

    /// Mutable view of `channel`, or an empty slice if it doesn't exist
    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        if channel >= self.num_channels {
            return &mut [];
        }
        let start = channel * self.aligned_samples;
        let len = self.num_samples;
        &mut self.data[start..start + len]
    }

    /// Iterate mutable views of every channel at once
    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        let len = self.num_samples;
        let stride = self.aligned_samples.max(1);
        let channels = self.num_channels;
        self.data
            .chunks_exact_mut(stride)
            .take(channels)
            .map(move |c| &mut c[..len])
    }

    /// Zero every channel
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Zero one channel
    pub fn clear_channel(&mut self, channel: usize) {
        self.channel_mut(channel).fill(0.0);
    }

    /// Zero `len` samples of `channel` from `start`, clamped to the buffer
    pub fn clear_range(&mut self, channel: usize, start: usize, len: usize) {
        range_mut(self.channel_mut(channel), start, len).fill(0.0);
    }

    /// Copy as much of `other` as fits; returns samples copied per channel
    pub fn copy_from(&mut self, other: &AudioBuffer) -> usize {
        let channels = self.num_channels.min(other.num_channels);
        let n = self.num_samples.min(other.num_samples);
        for ch in 0..channels {
            self.channel_mut(ch)[..n].copy_from_slice(&other.channel(ch)[..n]);
        }
        n
    }

    /// Copy a raw slice into the start of `channel`; returns samples copied
    pub fn copy_from_slice(&mut self, channel: usize, source: &[f32]) -> usize {
        let dest = self.channel_mut(channel);
        let n = dest.len().min(source.len());
        dest[..n].copy_from_slice(&source[..n]);
        n
    }

    /// Copy a region of another buffer; returns samples actually copied
    pub fn copy_from_region(
        &mut self,
        dest_channel: usize,
        dest_start: usize,
        source: &AudioBuffer,
        source_channel: usize,
        source_start: usize,
        len: usize,
    ) -> usize {
        let src = range(source.channel(source_channel), source_start, len);
        let dest = range_mut(self.channel_mut(dest_channel), dest_start, len);
        let n = src.len().min(dest.len());
        dest[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Multiply-accumulate a raw slice into `channel`; returns samples mixed
    pub fn add_from_slice(&mut self, channel: usize, source: &[f32], gain: f32) -> usize {
        let dest = self.channel_mut(channel);
        let n = dest.len().min(source.len());
        mul_add(&mut dest[..n], &source[..n], gain);
        n
    }

    /// Multiply-accumulate another buffer into this one, channel by channel
    pub fn add_from(&mut self, other: &AudioBuffer, gain: f32) {
        let channels = self.num_channels.min(other.num_channels);
        for ch in 0..channels {
            self.add_from_slice(ch, other.channel(ch), gain);
        }
    }

    /// Scale every active sample
    pub fn apply_gain(&mut self, gain: f32) {
        for channel in self.channels_mut() {
            scale(channel, gain);
        }
    }

    /// Scale one channel
    pub fn apply_gain_channel(&mut self, channel: usize, gain: f32) {
        scale(self.channel_mut(channel), gain);
    }

    /// Scale a clamped range of one channel
    pub fn apply_gain_range(&mut self, channel: usize, start: usize, len: usize, gain: f32) {
        scale(range_mut(self.channel_mut(channel), start, len), gain);
    }

    /// Linear gain ramp: `start_gain` on the first sample, stepping by
    /// `(end_gain - start_gain) / len` each sample after that
    pub fn apply_gain_ramp(
        &mut self,
        channel: usize,
        start: usize,
        len: usize,
        start_gain: f32,
        end_gain: f32,
    ) {
        if len == 0 {
            return;
        }
        let increment = (end_gain - start_gain) / len as f32;
        let mut gain = start_gain;
        for sample in range_mut(self.channel_mut(channel), start, len) {
            *sample *= gain;
            gain += increment;
        }
    }

    /// Peak absolute value over a clamped range
    pub fn magnitude(&self, channel: usize, start: usize, len: usize) -> f32 {
        peak(range(self.channel(channel), start, len))
    }

    /// Root-mean-square over a clamped range (0 for an empty range)
    pub fn rms_level(&self, channel: usize, start: usize, len: usize) -> f32 {
        rms(range(self.channel(channel), start, len))
    }

    /// Peak over all channels
    pub fn magnitude_all(&self) -> f32 {
        (0..self.num_channels)
            .map(|ch| peak(self.channel(ch)))
            .fold(0.0, f32::max)
    }

    /// RMS over all channels taken together
    pub fn rms_level_all(&self) -> f32 {
        let total = self.num_channels * self.num_samples;
        if total == 0 {
            return 0.0;
        }
        let sum: f64 = (0..self.num_channels)
            .map(|ch| sum_squares(self.channel(ch)))
            .sum();
        (sum / total as f64).sqrt() as f32
    }

    /// True if any active sample is NaN or infinite
    pub fn has_non_finite(&self) -> bool {
        (0..self.num_channels).any(|ch| self.channel(ch).iter().any(|s| !s.is_finite()))
    }
}

#[inline]
fn range(slice: &[f32], start: usize, len: usize) -> &[f32] {
    let start = start.min(slice.len());
    let end = start.saturating_add(len).min(slice.len());
    &slice[start..end]
}

#[inline]
fn range_mut(slice: &mut [f32], start: usize, len: usize) -> &mut [f32] {
    let start = start.min(slice.len());
    let end = start.saturating_add(len).min(slice.len());
    &mut slice[start..end]
}

/// `dest *= gain`, four samples at a time
#[inline]
pub(crate) fn scale(dest: &mut [f32], gain: f32) {
    let mut blocks = dest.chunks_exact_mut(SIMD_WIDTH);
    for block in &mut blocks {
        block[0] *= gain;
        block[1] *= gain;
        block[2] *= gain;
        block[3] *= gain;
    }
    for sample in blocks.into_remainder() {
        *sample *= gain;
    }
}

/// `dest += source * gain`, four samples at a time
#[inline]
pub(crate) fn mul_add(dest: &mut [f32], source: &[f32], gain: f32) {
    let n = dest.len().min(source.len());
    let (dest, source) = (&mut dest[..n], &source[..n]);
    let mut dest_blocks = dest.chunks_exact_mut(SIMD_WIDTH);
    let mut src_blocks = source.chunks_exact(SIMD_WIDTH);
    for (d, s) in (&mut dest_blocks).zip(&mut src_blocks) {
        d[0] += s[0] * gain;
        d[1] += s[1] * gain;
        d[2] += s[2] * gain;
        d[3] += s[3] * gain;
    }
    for (d, s) in dest_blocks
        .into_remainder()
        .iter_mut()
        .zip(src_blocks.remainder())
    {
        *d += s * gain;
    }
}

#[inline]
pub(crate) fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()))
}

#[inline]
fn sum_squares(samples: &[f32]) -> f64 {
    samples.iter().map(|&s| (s as f64) * (s as f64)).sum()
}

#[inline]
pub(crate) fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (sum_squares(samples) / samples.len() as f64).sqrt() as f32
}
