//! Nyth DSP - Real-time Digital Signal Processing
//!
//! The signal chain behind Nyth Audio:
//! - [`AudioBuffer`]: aligned multi-channel storage and block primitives
//! - [`BiquadFilter`]: RBJ cookbook biquads (8 response types)
//! - [`Equalizer`]: multi-band parametric EQ with presets
//! - Effects: [`Compressor`], [`Delay`], composed in an [`EffectChain`]
//! - Noise reduction: [`NoiseReducer`] (gate) and [`SpectralNR`] (STFT
//!   spectral subtraction or Wiener) behind a [`NoiseManager`]
//! - [`SpectrumAnalyzer`]: windowed FFT band analysis for metering
//! - [`SafetyLimiter`]: NaN scrubbing, DC removal and clipping protection
//!
//! # Architecture
//!
//! Configuration calls validate and return [`DspResult`], leaving the
//! previous state untouched on error. Processing calls never fail, never
//! allocate and never lock; all buffers are sized when a component is
//! configured.

mod buffer;
pub mod convert;
pub mod effects;
mod eq;
mod error;
mod fft;
mod filter;
pub mod noise;
mod presets;
mod processor;
mod safety;
mod spectrum;

pub use buffer::{aligned_len, AudioBuffer, SIMD_WIDTH};
pub use effects::{
    AudioEffect, Compressor, CompressorConfig, CompressorMetrics, Delay, DelayConfig, Effect,
    EffectChain, EffectId, EffectKind, MAX_DELAY_MS,
};
pub use eq::{
    default_bands, Equalizer, EqualizerBand, DEFAULT_BAND_COUNT, EQ_BANDS, MAX_BAND_COUNT,
    MAX_BAND_FREQUENCY, MAX_BAND_GAIN_DB, MAX_BAND_Q, MAX_EQ_CHANNELS, MAX_MASTER_GAIN_DB,
    MIN_BAND_FREQUENCY, MIN_BAND_Q,
};
pub use error::{DspError, DspResult};
pub use fft::{
    hann_periodic, hann_symmetric, validate_fft_size, FftEngine, MAX_FFT_SIZE, MIN_FFT_SIZE,
};
pub use filter::{BiquadFilter, FilterCoefficients, FilterType, MAX_FILTER_GAIN_DB};
pub use noise::{
    NoiseAlgorithm, NoiseConfig, NoiseManager, NoiseReducer, NoiseReducerConfig, NoiseState,
    NoiseStatistics, SpectralNR, SpectralNrConfig, SpectralRule,
};
pub use presets::{find_preset, preset_gain, preset_names, Preset, PRESETS};
pub use processor::{AudioProcessor, ProcessContext, ProcessorChain};
pub use safety::{SafetyConfig, SafetyControls, SafetyLimiter, SafetyReport};
pub use spectrum::{
    BandScale, OwnedSpectrum, SpectrumAnalyzer, SpectrumConfig, SpectrumData, SpectrumState,
    SpectrumStatistics,
};
