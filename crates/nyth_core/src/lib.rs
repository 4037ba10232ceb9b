//! Nyth Core - Pipeline and Engine
//!
//! This crate wires the `nyth_dsp` components into a running signal chain:
//! - [`AudioPipeline`]: safety -> equalizer -> effects -> noise reduction -> custom stages
//! - [`AudioEngine`]: thread-safe control surface, metering and events
//! - Background spectrum analysis fed through a lock-free ring
//! - serde-backed [`PipelineConfig`] with presets
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Control Thread                         │
//! │   setters ──mutex──▶ Engine ◀──events── (crossbeam queue)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Audio Thread                          │
//! │   process_block ──▶ AudioPipeline ──▶ meter (atomics)       │
//! │                           │                                 │
//! │                           └──rtrb──▶ Analysis Thread        │
//! │              (Zero allocation in this path)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod engine;
mod error;
mod message;
mod meter;
mod pipeline;

pub use config::{EqualizerSettings, PipelineConfig, StreamConfig, MAX_EVENT_QUEUE_CAPACITY};
pub use engine::AudioEngine;
pub use error::{EngineError, EngineResult};
pub use message::{Event, EventQueue};
pub use meter::{LevelMeter, Levels};
pub use pipeline::{AudioPipeline, BlockReport};

// Re-export DSP types for convenience
pub use nyth_dsp::{
    AudioBuffer, AudioProcessor, CompressorConfig, DelayConfig, EqualizerBand, FilterType,
    NoiseAlgorithm, NoiseConfig, OwnedSpectrum, ProcessContext, SafetyConfig, SpectrumConfig,
};
