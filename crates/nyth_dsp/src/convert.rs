//! Sample Format Conversion
//!
//! Helpers for moving audio between the capture backends' formats
//! (interleaved, 16-bit PCM) and the planar float buffers used internally.

use crate::buffer::AudioBuffer;

/// Scale factor between 16-bit PCM and float
const INT16_SCALE: f32 = 32768.0;

/// Silence floor for level conversions
pub const MIN_DB: f32 = -120.0;

/// Convert decibels to linear amplitude
/// Formula: amplitude = 10^(dB/20)
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert linear amplitude to decibels, floored at [`MIN_DB`]
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 || !linear.is_finite() {
        return MIN_DB;
    }
    (20.0 * linear.log10()).max(MIN_DB)
}

/// Float to 16-bit PCM: scale, round to nearest, saturate
///
/// Returns the number of samples written.
pub fn float_to_int16(input: &[f32], output: &mut [i16]) -> usize {
    let n = input.len().min(output.len());
    for (dst, &src) in output[..n].iter_mut().zip(&input[..n]) {
        let sample = if src.is_finite() { src } else { 0.0 };
        *dst = (sample * INT16_SCALE)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
    n
}

/// 16-bit PCM to float in [-1, 1)
pub fn int16_to_float(input: &[i16], output: &mut [f32]) -> usize {
    let n = input.len().min(output.len());
    for (dst, &src) in output[..n].iter_mut().zip(&input[..n]) {
        *dst = src as f32 / INT16_SCALE;
    }
    n
}

/// Interleave planar channels into `output` ([L0, R0, L1, R1, ...])
///
/// Writes as many whole frames as both sides allow and returns the frame count.
pub fn interleave(channels: &[&[f32]], output: &mut [f32]) -> usize {
    let num_channels = channels.len();
    if num_channels == 0 {
        return 0;
    }
    let frames = channels
        .iter()
        .map(|c| c.len())
        .min()
        .unwrap_or(0)
        .min(output.len() / num_channels);
    for (i, frame) in output.chunks_exact_mut(num_channels).take(frames).enumerate() {
        for (sample, channel) in frame.iter_mut().zip(channels) {
            *sample = channel[i];
        }
    }
    frames
}

/// Interleave an [`AudioBuffer`] into `output`
pub fn interleave_buffer(buffer: &AudioBuffer, output: &mut [f32]) -> usize {
    let num_channels = buffer.num_channels();
    if num_channels == 0 {
        return 0;
    }
    let frames = buffer.num_samples().min(output.len() / num_channels);
    for (i, frame) in output.chunks_exact_mut(num_channels).take(frames).enumerate() {
        for (ch, sample) in frame.iter_mut().enumerate() {
            *sample = buffer.channel(ch)[i];
        }
    }
    frames
}

/// Split interleaved samples into the channels of `buffer`
///
/// `channels` describes the layout of `input`; extra input channels are
/// dropped and missing buffer channels are left untouched.
pub fn deinterleave(input: &[f32], channels: usize, buffer: &mut AudioBuffer) -> usize {
    if channels == 0 {
        return 0;
    }
    let frames = (input.len() / channels).min(buffer.num_samples());
    let used = channels.min(buffer.num_channels());
    for (ch, dest) in buffer.channels_mut().take(used).enumerate() {
        for (i, sample) in dest[..frames].iter_mut().enumerate() {
            *sample = input[i * channels + ch];
        }
    }
    frames
}

/// Duplicate a mono signal into both stereo channels
pub fn mono_to_stereo(mono: &[f32], left: &mut [f32], right: &mut [f32]) -> usize {
    let n = mono.len().min(left.len()).min(right.len());
    left[..n].copy_from_slice(&mono[..n]);
    right[..n].copy_from_slice(&mono[..n]);
    n
}

/// Average a stereo pair down to mono: 0.5 * (L + R)
pub fn stereo_to_mono(left: &[f32], right: &[f32], mono: &mut [f32]) -> usize {
    let n = mono.len().min(left.len()).min(right.len());
    for ((m, l), r) in mono[..n].iter_mut().zip(left).zip(right) {
        *m = 0.5 * (l + r);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_conversions() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0) - 0.501).abs() < 0.01);
        assert!((linear_to_db(1.0)).abs() < 1e-6);
        assert_eq!(linear_to_db(0.0), MIN_DB);
        assert_eq!(linear_to_db(-1.0), MIN_DB);
    }

    #[test]
    fn test_int16_saturates() {
        let mut out = [0i16; 4];
        float_to_int16(&[1.5, -1.5, 1.0, f32::NAN], &mut out);
        assert_eq!(out, [i16::MAX, i16::MIN, i16::MAX, 0]);
    }

    #[test]
    fn test_int16_to_float_range() {
        let mut out = [0.0f32; 3];
        int16_to_float(&[i16::MIN, 0, 16384], &mut out);
        assert_eq!(out, [-1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_interleave_and_back() {
        let left = [1.0, 2.0, 3.0];
        let right = [-1.0, -2.0, -3.0];
        let mut interleaved = [0.0; 6];
        assert_eq!(interleave(&[&left, &right], &mut interleaved), 3);
        assert_eq!(interleaved, [1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);

        let mut buffer = AudioBuffer::new(2, 3);
        assert_eq!(deinterleave(&interleaved, 2, &mut buffer), 3);
        assert_eq!(buffer.channel(0), &left);
        assert_eq!(buffer.channel(1), &right);

        let mut again = [0.0; 6];
        interleave_buffer(&buffer, &mut again);
        assert_eq!(again, interleaved);
    }

    #[test]
    fn test_stereo_to_mono() {
        let mut mono = [0.0; 2];
        stereo_to_mono(&[1.0, 0.0], &[0.0, -1.0], &mut mono);
        assert_eq!(mono, [0.5, -0.5]);
    }

    #[test]
    fn test_mono_to_stereo_truncates() {
        let mut left = [0.0; 2];
        let mut right = [0.0; 3];
        assert_eq!(mono_to_stereo(&[0.1, 0.2, 0.3], &mut left, &mut right), 2);
        assert_eq!(left, [0.1, 0.2]);
        assert_eq!(right, [0.1, 0.2, 0.0]);
    }
}
