//! Stream and Pipeline Configuration
//!
//! Everything here is plain serde data. Nothing is applied until a
//! [`PipelineConfig`] passes [`PipelineConfig::validate`].

use nyth_dsp::{
    default_bands, find_preset, CompressorConfig, DelayConfig, DspError, EqualizerBand,
    NoiseAlgorithm, NoiseConfig, NoiseReducerConfig, SafetyConfig, SpectrumConfig,
    DEFAULT_BAND_COUNT, MAX_BAND_COUNT, MAX_MASTER_GAIN_DB,
};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Largest event queue the engine will allocate
pub const MAX_EVENT_QUEUE_CAPACITY: usize = 4096;

/// Audio stream format
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Sample rate in Hz (8000 to 192000)
    pub sample_rate: u32,

    /// Number of audio channels (1 to 8)
    pub channels: u16,

    /// Frames per processing block (32 to 8192)
    pub block_size: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            block_size: 512,
        }
    }
}

impl StreamConfig {
    /// Latency of one block in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.block_size as f32 / self.sample_rate as f32) * 1000.0
    }

    pub fn sample_rate_hz(&self) -> f32 {
        self.sample_rate as f32
    }

    pub fn num_channels(&self) -> usize {
        self.channels as usize
    }

    pub fn frames(&self) -> usize {
        self.block_size as usize
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(8000..=192_000).contains(&self.sample_rate) {
            return Err(EngineError::ConfigError(format!(
                "Invalid sample rate: {}",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(EngineError::ConfigError(format!(
                "Invalid channel count: {}",
                self.channels
            )));
        }
        if !(32..=8192).contains(&self.block_size) {
            return Err(EngineError::ConfigError(format!(
                "Invalid block size: {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

/// Equalizer layout and levels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerSettings {
    pub bands: Vec<EqualizerBand>,
    pub master_gain_db: f32,
    pub bypass: bool,
    /// Built-in preset applied over the band gains
    pub preset: Option<String>,
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        Self {
            bands: default_bands(DEFAULT_BAND_COUNT),
            master_gain_db: 0.0,
            bypass: false,
            preset: None,
        }
    }
}

impl EqualizerSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if self.bands.is_empty() || self.bands.len() > MAX_BAND_COUNT {
            return Err(DspError::InvalidBandCount(self.bands.len()).into());
        }
        for band in &self.bands {
            band.validate()?;
        }
        let gain = self.master_gain_db;
        if !gain.is_finite() || gain.abs() > MAX_MASTER_GAIN_DB {
            return Err(DspError::InvalidParameter {
                name: "master gain",
                value: gain,
                min: -MAX_MASTER_GAIN_DB,
                max: MAX_MASTER_GAIN_DB,
            }
            .into());
        }
        if let Some(name) = &self.preset {
            if find_preset(name).is_none() {
                return Err(DspError::UnknownPreset(name.clone()).into());
            }
        }
        Ok(())
    }
}

/// Complete description of an [`AudioPipeline`](crate::AudioPipeline)
///
/// The stream format is authoritative: `noise` and `spectrum` get their
/// sample rate (and channel count) from `stream` when the pipeline is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stream: StreamConfig,
    pub safety: SafetyConfig,
    pub equalizer: EqualizerSettings,
    /// Compressor stage, enabled when present
    pub compressor: Option<CompressorConfig>,
    /// Delay stage, enabled when present
    pub delay: Option<DelayConfig>,
    pub noise: NoiseConfig,
    /// Background analysis settings; `None` disables the worker
    pub spectrum: Option<SpectrumConfig>,
    pub event_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            safety: SafetyConfig::default(),
            equalizer: EqualizerSettings::default(),
            compressor: None,
            delay: None,
            noise: NoiseConfig::default(),
            spectrum: Some(SpectrumConfig::default()),
            event_queue_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Small blocks, no stages that add latency or heavy CPU
    pub fn low_latency() -> Self {
        Self {
            stream: StreamConfig {
                block_size: 64,
                ..StreamConfig::default()
            },
            spectrum: None,
            ..Self::default()
        }
    }

    /// Mono speech: rumble filter and gate, gentle levelling, vocal EQ
    pub fn voice() -> Self {
        Self {
            stream: StreamConfig {
                sample_rate: 48000,
                channels: 1,
                block_size: 256,
            },
            equalizer: EqualizerSettings {
                preset: Some("vocal_boost".to_string()),
                ..EqualizerSettings::default()
            },
            compressor: Some(CompressorConfig {
                threshold_db: -24.0,
                ratio: 3.0,
                attack_ms: 5.0,
                release_ms: 80.0,
                knee_db: 6.0,
                makeup_db: 4.0,
            }),
            noise: NoiseConfig {
                enabled: true,
                algorithm: NoiseAlgorithm::Gate,
                gate: NoiseReducerConfig {
                    threshold_db: -45.0,
                    high_pass_hz: 80.0,
                    ..NoiseReducerConfig::default()
                },
                ..NoiseConfig::default()
            },
            ..Self::default()
        }
    }

    /// Stereo playback with a light bus compressor
    pub fn music() -> Self {
        Self {
            stream: StreamConfig {
                block_size: 1024,
                ..StreamConfig::default()
            },
            compressor: Some(CompressorConfig {
                threshold_db: -12.0,
                ratio: 2.0,
                attack_ms: 20.0,
                release_ms: 200.0,
                knee_db: 6.0,
                makeup_db: 0.0,
            }),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Noise settings with the stream format applied
    pub fn noise_config(&self) -> NoiseConfig {
        NoiseConfig {
            sample_rate: self.stream.sample_rate_hz(),
            channels: self.stream.num_channels(),
            ..self.noise
        }
    }

    /// Spectrum settings with the stream sample rate applied
    pub fn spectrum_config(&self) -> Option<SpectrumConfig> {
        self.spectrum.map(|spectrum| SpectrumConfig {
            sample_rate: self.stream.sample_rate_hz(),
            ..spectrum
        })
    }

    /// Check every stage with its own validation
    pub fn validate(&self) -> EngineResult<()> {
        self.stream.validate()?;
        self.safety.validate()?;
        self.equalizer.validate()?;
        if let Some(compressor) = &self.compressor {
            compressor.validate()?;
        }
        if let Some(delay) = &self.delay {
            delay.validate()?;
        }
        self.noise_config().validate()?;
        if let Some(spectrum) = self.spectrum_config() {
            spectrum.validate()?;
        }
        if self.event_queue_capacity == 0 || self.event_queue_capacity > MAX_EVENT_QUEUE_CAPACITY
        {
            return Err(EngineError::ConfigError(format!(
                "Invalid event queue capacity: {}",
                self.event_queue_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.channels, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_latency_calculation() {
        let config = StreamConfig {
            sample_rate: 48000,
            channels: 2,
            block_size: 480,
        };
        assert!((config.latency_ms() - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_invalid_stream_config() {
        let config = StreamConfig {
            sample_rate: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StreamConfig {
            channels: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StreamConfig {
            block_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        for config in [
            PipelineConfig::default(),
            PipelineConfig::low_latency(),
            PipelineConfig::voice(),
            PipelineConfig::music(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
        assert_eq!(PipelineConfig::low_latency().stream.block_size, 64);
        assert_eq!(PipelineConfig::voice().stream.channels, 1);
    }

    #[test]
    fn test_nested_validation() {
        let mut config = PipelineConfig::default();
        config.equalizer.bands[3].gain_db = 40.0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::DspError(DspError::InvalidParameter { .. }))
        ));

        let mut config = PipelineConfig::default();
        config.equalizer.preset = Some("nope".to_string());
        assert!(matches!(
            config.validate(),
            Err(EngineError::DspError(DspError::UnknownPreset(_)))
        ));

        let config = PipelineConfig {
            delay: Some(DelayConfig {
                feedback: 1.5,
                ..Default::default()
            }),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            event_queue_capacity: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn test_stream_format_overrides_stages() {
        let mut config = PipelineConfig::voice();
        config.noise.sample_rate = 1.0;
        config.noise.channels = 0;
        let noise = config.noise_config();
        assert_eq!(noise.sample_rate, 48000.0);
        assert_eq!(noise.channels, 1);
        assert!(config.validate().is_ok());

        config.stream.sample_rate = 44100;
        assert_eq!(config.spectrum_config().map(|s| s.sample_rate), Some(44100.0));
    }

    #[test]
    fn test_json_round_trip() {
        let config = PipelineConfig::voice();
        let json = config.to_json_string().unwrap();
        let parsed = PipelineConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_json_defaults_and_rejection() {
        let config = PipelineConfig::from_json_str(r#"{"stream": {"block_size": 128}}"#).unwrap();
        assert_eq!(config.stream.block_size, 128);
        assert_eq!(config.stream.sample_rate, 48000);
        assert_eq!(config.equalizer.bands.len(), DEFAULT_BAND_COUNT);

        let err = PipelineConfig::from_json_str(r#"{"stream": {"channels": 0}}"#).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(_)));

        let err = PipelineConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, EngineError::SerializationError(_)));
    }
}
