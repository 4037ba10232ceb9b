//! Noise Reduction Manager
//!
//! Owns whichever noise reduction algorithm is active, one processing state
//! per channel, and the running statistics. Audio passes through untouched
//! unless the manager is in the `Processing` state.
//!
//! ```text
//! Uninitialized --initialize--> Initialized --start--> Processing
//!                                    ^                     |
//!                                    +--------stop---------+
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{NoiseReducer, NoiseReducerConfig, SpectralNR, SpectralNrConfig, SpectralRule};
use crate::buffer::{rms, AudioBuffer};
use crate::convert::linear_to_db;
use crate::effects::MAX_EFFECT_CHANNELS;
use crate::error::{check_sample_rate, DspError, DspResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseAlgorithm {
    /// Envelope-driven downward expander
    #[default]
    Gate,
    /// STFT spectral subtraction
    SpectralSubtraction,
    /// STFT Wiener filter with a decision-directed SNR estimate
    Wiener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseState {
    Uninitialized,
    Initialized,
    Processing,
    Error,
}

impl NoiseState {
    pub fn as_str(self) -> &'static str {
        match self {
            NoiseState::Uninitialized => "uninitialized",
            NoiseState::Initialized => "initialized",
            NoiseState::Processing => "processing",
            NoiseState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Start processing as soon as the owner builds the manager
    pub enabled: bool,
    pub algorithm: NoiseAlgorithm,
    pub sample_rate: f32,
    pub channels: usize,
    pub gate: NoiseReducerConfig,
    /// `spectral.sample_rate` is overridden by `sample_rate` and
    /// `spectral.rule` by `algorithm`
    pub spectral: SpectralNrConfig,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: NoiseAlgorithm::Gate,
            sample_rate: 48000.0,
            channels: 2,
            gate: NoiseReducerConfig::default(),
            spectral: SpectralNrConfig::default(),
        }
    }
}

impl NoiseConfig {
    pub fn validate(&self) -> DspResult<()> {
        check_sample_rate(self.sample_rate)?;
        if self.channels == 0 || self.channels > MAX_EFFECT_CHANNELS {
            return Err(DspError::InvalidChannelCount(self.channels));
        }
        self.gate.validate()?;
        self.spectral_config().validate()
    }

    fn spectral_config(&self) -> SpectralNrConfig {
        let rule = match self.algorithm {
            NoiseAlgorithm::Wiener => SpectralRule::Wiener,
            _ => SpectralRule::Subtraction,
        };
        SpectralNrConfig {
            sample_rate: self.sample_rate,
            rule,
            ..self.spectral
        }
    }
}

/// Running totals since the last reset, plus levels of the latest block
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseStatistics {
    /// RMS of the last input block (linear)
    pub input_level: f32,
    /// RMS of the last output block (linear)
    pub output_level: f32,
    /// Input minus output level of the last block (dB, positive = reduced)
    pub noise_reduction_db: f32,
    pub processed_frames: u64,
    pub processed_samples: u64,
    pub duration_ms: f64,
}

enum Processors {
    Gate(NoiseReducer),
    Spectral(Vec<SpectralNR>),
}

impl Processors {
    fn build(config: &NoiseConfig) -> DspResult<Self> {
        Ok(match config.algorithm {
            NoiseAlgorithm::Gate => Processors::Gate(NoiseReducer::new(
                config.gate,
                config.sample_rate,
                config.channels,
            )?),
            NoiseAlgorithm::SpectralSubtraction | NoiseAlgorithm::Wiener => Processors::Spectral(
                (0..config.channels)
                    .map(|_| SpectralNR::new(config.spectral_config()))
                    .collect::<DspResult<_>>()?,
            ),
        })
    }

    fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        match self {
            Processors::Gate(gate) => gate.process_channel(channel, samples),
            Processors::Spectral(channels) => {
                if let Some(nr) = channels.get_mut(channel) {
                    nr.process_in_place(samples);
                }
            }
        }
    }

    fn reset(&mut self) {
        match self {
            Processors::Gate(gate) => gate.reset(),
            Processors::Spectral(channels) => channels.iter_mut().for_each(SpectralNR::reset),
        }
    }

    fn latency_samples(&self) -> usize {
        match self {
            Processors::Gate(_) => 0,
            Processors::Spectral(channels) => channels
                .first()
                .filter(|nr| nr.is_enabled())
                .map_or(0, SpectralNR::latency_samples),
        }
    }
}

pub struct NoiseManager {
    state: NoiseState,
    config: Option<NoiseConfig>,
    processors: Option<Processors>,
    statistics: NoiseStatistics,
}

impl Default for NoiseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseManager {
    pub fn new() -> Self {
        Self {
            state: NoiseState::Uninitialized,
            config: None,
            processors: None,
            statistics: NoiseStatistics::default(),
        }
    }

    pub fn state(&self) -> NoiseState {
        self.state
    }

    pub fn config(&self) -> Option<&NoiseConfig> {
        self.config.as_ref()
    }

    pub fn algorithm(&self) -> Option<NoiseAlgorithm> {
        self.config.map(|c| c.algorithm)
    }

    pub fn is_processing(&self) -> bool {
        self.state == NoiseState::Processing
    }

    fn invalid_state(&self, operation: &'static str) -> DspError {
        DspError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    /// Build processors for `config`
    pub fn initialize(&mut self, config: NoiseConfig) -> DspResult<()> {
        if !matches!(self.state, NoiseState::Uninitialized | NoiseState::Error) {
            return Err(self.invalid_state("initialize"));
        }
        config.validate()?;
        self.install(config)?;
        self.state = NoiseState::Initialized;
        info!(algorithm = ?config.algorithm, channels = config.channels, "noise reduction initialized");
        Ok(())
    }

    /// Replace the configuration, keeping the current run state
    ///
    /// A config that fails validation is rejected and the previous one stays
    /// active.
    ///
    /// Note: This allocates. Only call during setup, not in audio callback.
    pub fn set_config(&mut self, config: NoiseConfig) -> DspResult<()> {
        match self.state {
            NoiseState::Uninitialized | NoiseState::Error => return self.initialize(config),
            NoiseState::Initialized | NoiseState::Processing => {}
        }
        config.validate()?;
        self.install(config)?;
        debug!(algorithm = ?config.algorithm, "noise reduction reconfigured");
        Ok(())
    }

    /// Switch algorithms, rebuilding per-channel state
    pub fn set_algorithm(&mut self, algorithm: NoiseAlgorithm) -> DspResult<()> {
        let config = self.config.ok_or_else(|| self.invalid_state("set algorithm"))?;
        self.set_config(NoiseConfig { algorithm, ..config })
    }

    fn install(&mut self, config: NoiseConfig) -> DspResult<()> {
        match Processors::build(&config) {
            Ok(processors) => {
                self.processors = Some(processors);
                self.config = Some(config);
                Ok(())
            }
            Err(error) => {
                warn!(%error, "noise reduction processors could not be built");
                self.processors = None;
                self.state = NoiseState::Error;
                Err(error)
            }
        }
    }

    pub fn start(&mut self) -> DspResult<()> {
        if self.state != NoiseState::Initialized {
            return Err(self.invalid_state("start"));
        }
        self.state = NoiseState::Processing;
        debug!("noise reduction started");
        Ok(())
    }

    pub fn stop(&mut self) -> DspResult<()> {
        if self.state != NoiseState::Processing {
            return Err(self.invalid_state("stop"));
        }
        self.state = NoiseState::Initialized;
        debug!("noise reduction stopped");
        Ok(())
    }

    /// Clear processing history (envelopes, FIFOs, noise estimates)
    pub fn reset(&mut self) {
        if let Some(processors) = &mut self.processors {
            processors.reset();
        }
    }

    pub fn latency_samples(&self) -> usize {
        self.processors.as_ref().map_or(0, Processors::latency_samples)
    }

    pub fn statistics(&self) -> NoiseStatistics {
        self.statistics
    }

    pub fn reset_statistics(&mut self) {
        self.statistics = NoiseStatistics::default();
    }

    fn active(&mut self) -> Option<(&mut Processors, f32)> {
        if self.state != NoiseState::Processing {
            return None;
        }
        let sample_rate = self.config.as_ref()?.sample_rate;
        self.processors.as_mut().map(|p| (p, sample_rate))
    }

    /// Process one mono block in place through channel 0
    ///
    /// # Real-time Safety
    /// No allocations.
    pub fn process_mono(&mut self, samples: &mut [f32]) {
        let input_level = rms(samples);
        let Some((processors, sample_rate)) = self.active() else {
            return;
        };
        processors.process_channel(0, samples);
        self.statistics
            .record(input_level, rms(samples), samples.len(), 1, sample_rate);
    }

    /// Process a stereo pair in place; each side has its own state
    pub fn process_stereo(&mut self, left: &mut [f32], right: &mut [f32]) {
        let input_level = pair_rms(left, right);
        let Some((processors, sample_rate)) = self.active() else {
            return;
        };
        processors.process_channel(0, left);
        processors.process_channel(1, right);
        let frames = left.len().min(right.len());
        self.statistics
            .record(input_level, pair_rms(left, right), frames, 2, sample_rate);
    }

    /// Process every channel of `buffer` in place
    pub fn process_buffer(&mut self, buffer: &mut AudioBuffer) {
        let input_level = buffer.rms_level_all();
        let Some((processors, sample_rate)) = self.active() else {
            return;
        };
        for (channel, samples) in buffer.channels_mut().enumerate() {
            processors.process_channel(channel, samples);
        }
        let output_level = buffer.rms_level_all();
        self.statistics.record(
            input_level,
            output_level,
            buffer.num_samples(),
            buffer.num_channels(),
            sample_rate,
        );
    }
}

impl NoiseStatistics {
    fn record(
        &mut self,
        input_level: f32,
        output_level: f32,
        frames: usize,
        channels: usize,
        sample_rate: f32,
    ) {
        self.input_level = input_level;
        self.output_level = output_level;
        self.noise_reduction_db = linear_to_db(input_level) - linear_to_db(output_level);
        self.processed_frames += frames as u64;
        self.processed_samples += (frames * channels) as u64;
        self.duration_ms = self.processed_frames as f64 * 1000.0 / sample_rate as f64;
    }
}

fn pair_rms(left: &[f32], right: &[f32]) -> f32 {
    let (l, r) = (rms(left), rms(right));
    ((l * l + r * r) * 0.5).sqrt()
}
