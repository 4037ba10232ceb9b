//! DSP Error Types
//!
//! Every configuration entry point returns one of these instead of applying
//! a bad value. Processing calls never produce them.

use thiserror::Error;

/// Errors that can occur while configuring DSP components
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DspError {
    #[error("Invalid band index: {0}")]
    InvalidBandIndex(usize),

    #[error("Invalid {name}: {value} (expected {min} to {max})")]
    InvalidParameter {
        name: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("Invalid filter coefficients for frequency {frequency}Hz at sample rate {sample_rate}Hz")]
    InvalidCoefficients { frequency: f32, sample_rate: f32 },

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(f32),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(usize),

    #[error("Invalid FFT size: {0} (must be a power of two between 64 and 8192)")]
    InvalidFftSize(usize),

    #[error("Invalid hop size: {hop} for FFT size {fft_size}")]
    InvalidHopSize { hop: usize, fft_size: usize },

    #[error("Invalid frequency range: {min}Hz to {max}Hz")]
    InvalidFrequencyRange { min: f32, max: f32 },

    #[error("Invalid band count: {0}")]
    InvalidBandCount(usize),

    #[error("No effect with id {0} in the chain")]
    UnknownEffect(u32),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Invalid state transition: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Buffer size mismatch: expected {expected}, got {got}")]
    BufferSizeMismatch { expected: usize, got: usize },
}

/// Result type alias for DSP configuration calls
pub type DspResult<T> = Result<T, DspError>;

/// Reject `value` unless it is finite and inside `[min, max]`
pub(crate) fn check_range(name: &'static str, value: f32, min: f32, max: f32) -> DspResult<()> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(DspError::InvalidParameter {
            name,
            value,
            min,
            max,
        })
    }
}

/// Sample rates accepted by every component
pub(crate) fn check_sample_rate(sample_rate: f32) -> DspResult<()> {
    if sample_rate.is_finite() && (8000.0..=192_000.0).contains(&sample_rate) {
        Ok(())
    } else {
        Err(DspError::InvalidSampleRate(sample_rate))
    }
}
