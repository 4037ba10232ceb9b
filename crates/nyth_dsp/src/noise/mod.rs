//! Noise Reduction
//!
//! Interchangeable algorithms behind one manager:
//! - [`NoiseReducer`]: level-driven downward expander (noise gate)
//! - [`SpectralNR`]: STFT spectral subtraction or Wiener filtering against a
//!   running noise floor

mod gate;
mod manager;
mod spectral;

pub use gate::{NoiseReducer, NoiseReducerConfig};
pub use manager::{NoiseAlgorithm, NoiseConfig, NoiseManager, NoiseState, NoiseStatistics};
pub use spectral::{SpectralNR, SpectralNrConfig, SpectralRule};
