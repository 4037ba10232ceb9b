//! Audio Pipeline
//!
//! Owns every DSP stage and runs them in a fixed order:
//!
//! ```text
//! input ─▶ Safety ─▶ Equalizer ─▶ Effect chain ─▶ Noise reduction ─▶ Extra stages ─▶ meter
//! ```
//!
//! The pipeline itself has no threading; [`AudioEngine`](crate::AudioEngine)
//! puts it behind a mutex and drives it from the audio thread.

use nyth_dsp::convert::{deinterleave, interleave_buffer};
use nyth_dsp::{
    AudioBuffer, AudioEffect, AudioProcessor, Compressor, CompressorConfig, CompressorMetrics,
    Delay, DelayConfig, EffectChain, EffectId, Equalizer, FilterType, NoiseAlgorithm,
    NoiseConfig, NoiseManager, NoiseStatistics, ProcessContext, ProcessorChain, SafetyConfig,
    SafetyControls, SafetyLimiter, SafetyReport, SpectrumConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{EngineError, EngineResult};

/// What one call to [`AudioPipeline::process`] saw and produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockReport {
    pub frames: usize,
    /// Output RMS over all channels
    pub rms: f32,
    /// Output peak over all channels
    pub peak: f32,
    /// Input as seen by the safety limiter
    pub safety: SafetyReport,
}

impl BlockReport {
    /// Fold a later block into this one
    fn merge(&mut self, other: &BlockReport) {
        let total = self.frames + other.frames;
        if total == 0 {
            return;
        }
        let (a, b) = (self.frames as f32, other.frames as f32);
        let weighted_rms = |x: f32, y: f32| ((x * x * a + y * y * b) / (a + b)).sqrt();

        self.rms = weighted_rms(self.rms, other.rms);
        self.peak = self.peak.max(other.peak);
        self.safety.rms = weighted_rms(self.safety.rms, other.safety.rms);
        self.safety.peak = self.safety.peak.max(other.safety.peak);
        self.safety.dc_offset = (self.safety.dc_offset * a + other.safety.dc_offset * b) / (a + b);
        self.safety.clipped_samples += other.safety.clipped_samples;
        self.safety.non_finite_samples += other.safety.non_finite_samples;
        self.safety.overload |= other.safety.overload;
        self.safety.feedback_score = self.safety.feedback_score.max(other.safety.feedback_score);
        self.safety.feedback_likely |= other.safety.feedback_likely;
        self.frames = total;
    }
}

/// The processing stages, split from the scratch buffer so both can be
/// borrowed mutably at once
struct Stages {
    safety: SafetyLimiter,
    equalizer: Equalizer,
    effects: EffectChain,
    noise: NoiseManager,
    extra: ProcessorChain,
}

impl Stages {
    #[inline]
    fn process(&mut self, buffer: &mut AudioBuffer) -> BlockReport {
        let safety = self.safety.process_buffer(buffer);
        self.equalizer.process_buffer(buffer);
        self.effects.process_buffer(buffer);
        self.noise.process_buffer(buffer);
        self.extra.process(buffer);
        BlockReport {
            frames: buffer.num_samples(),
            rms: buffer.rms_level_all(),
            peak: buffer.magnitude_all(),
            safety,
        }
    }
}

/// Complete signal chain for one stream format
pub struct AudioPipeline {
    /// Settings the stages were last configured with
    config: PipelineConfig,
    context: ProcessContext,
    stages: Stages,
    compressor: Option<EffectId>,
    delay: Option<EffectId>,
    /// Planar staging area for interleaved I/O, one block long
    scratch: AudioBuffer,
}

impl AudioPipeline {
    /// Validate `config` and build every stage
    pub fn new(config: PipelineConfig) -> EngineResult<Self> {
        config.validate()?;
        let stream = config.stream;
        let sample_rate = stream.sample_rate_hz();
        let channels = stream.num_channels();
        let context = ProcessContext::new(sample_rate, channels, stream.frames());

        let safety = SafetyLimiter::new(config.safety, channels)?;

        let settings = &config.equalizer;
        let mut equalizer = Equalizer::with_bands(sample_rate, settings.bands.clone(), channels)?;
        if let Some(preset) = &settings.preset {
            equalizer.load_preset(preset)?;
        }
        equalizer.set_master_gain(settings.master_gain_db)?;
        equalizer.set_bypass(settings.bypass);

        let mut effects = EffectChain::new(sample_rate, channels)?;
        let compressor = config
            .compressor
            .map(|c| add_compressor(&mut effects, c))
            .transpose()?;
        let delay = config
            .delay
            .map(|d| add_delay(&mut effects, d))
            .transpose()?;

        let mut noise = NoiseManager::new();
        noise.initialize(config.noise_config())?;
        if config.noise.enabled {
            noise.start()?;
        }

        info!(
            sample_rate,
            channels,
            block_size = stream.block_size,
            latency_ms = stream.latency_ms(),
            "audio pipeline created"
        );

        let mut pipeline = Self {
            context,
            stages: Stages {
                safety,
                equalizer,
                effects,
                noise,
                extra: ProcessorChain::new(context),
            },
            compressor,
            delay,
            scratch: AudioBuffer::new(channels, stream.frames()),
            config,
        };
        // A preset rewrites the band gains
        pipeline.sync_equalizer();
        Ok(pipeline)
    }

    /// Current settings, including changes made through the setters
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig {
            safety: self.stages.safety.config(),
            ..self.config.clone()
        }
    }

    pub fn context(&self) -> ProcessContext {
        self.context
    }

    /// Run one planar block through every stage
    ///
    /// # Real-time Safety
    /// No allocations, no locks. Never fails; non-finite input is scrubbed
    /// by the safety stage before anything else sees it.
    #[inline]
    pub fn process(&mut self, buffer: &mut AudioBuffer) -> BlockReport {
        self.stages.process(buffer)
    }

    /// Run interleaved samples through the pipeline in block-sized pieces
    ///
    /// A trailing partial frame is left untouched.
    pub fn process_interleaved(&mut self, data: &mut [f32]) -> BlockReport {
        let channels = self.context.channels;
        let block = self.context.block_size;
        let whole_frames = data.len() / channels;
        let mut report = BlockReport::default();

        for chunk in data[..whole_frames * channels].chunks_mut(block * channels) {
            let frames = chunk.len() / channels;
            if self.scratch.set_num_samples(frames).is_err() {
                break;
            }
            deinterleave(chunk, channels, &mut self.scratch);
            let block_report = self.stages.process(&mut self.scratch);
            interleave_buffer(&self.scratch, chunk);
            report.merge(&block_report);
        }
        report
    }

    /// Append a custom stage after noise reduction
    ///
    /// Note: This allocates. Only call during setup, not in audio callback.
    pub fn add_processor(&mut self, processor: Box<dyn AudioProcessor>) {
        info!(stage = processor.name(), "pipeline stage added");
        self.stages.extra.add(processor);
    }

    pub fn remove_processor(&mut self, name: &str) -> Option<Box<dyn AudioProcessor>> {
        self.stages.extra.remove(name)
    }

    /// Names of every stage in processing order
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names = vec!["Safety", "Equalizer", "Effect Chain", "Noise Reduction"];
        names.extend(self.stages.extra.names());
        names
    }

    /// Samples of delay the enabled stages add
    pub fn latency_samples(&self) -> usize {
        self.stages.effects.latency_samples()
            + self.stages.noise.latency_samples()
            + self.stages.extra.latency_samples()
    }

    /// Clear all filter, envelope and FIFO history
    pub fn reset(&mut self) {
        self.stages.safety.reset();
        self.stages.equalizer.reset();
        self.stages.effects.reset();
        self.stages.noise.reset();
        self.stages.extra.reset();
        debug!("pipeline reset");
    }

    // --- Safety ---

    /// Lock-free handle for threshold and clip-mode changes
    pub fn safety_controls(&self) -> Arc<SafetyControls> {
        self.stages.safety.controls()
    }

    pub fn set_safety(&mut self, config: SafetyConfig) -> EngineResult<()> {
        self.stages.safety.set_config(config)?;
        self.config.safety = config;
        Ok(())
    }

    // --- Equalizer ---

    pub fn equalizer(&self) -> &Equalizer {
        &self.stages.equalizer
    }

    pub fn set_band_gain(&mut self, band: usize, gain_db: f32) -> EngineResult<()> {
        self.stages.equalizer.set_band_gain(band, gain_db)?;
        self.config.equalizer.preset = None;
        self.sync_equalizer();
        Ok(())
    }

    pub fn set_band_frequency(&mut self, band: usize, frequency: f32) -> EngineResult<()> {
        self.stages.equalizer.set_band_frequency(band, frequency)?;
        self.sync_equalizer();
        Ok(())
    }

    pub fn set_band_q(&mut self, band: usize, q: f32) -> EngineResult<()> {
        self.stages.equalizer.set_band_q(band, q)?;
        self.sync_equalizer();
        Ok(())
    }

    pub fn set_band_type(&mut self, band: usize, filter_type: FilterType) -> EngineResult<()> {
        self.stages.equalizer.set_band_type(band, filter_type)?;
        self.sync_equalizer();
        Ok(())
    }

    pub fn set_band_enabled(&mut self, band: usize, enabled: bool) -> EngineResult<()> {
        self.stages.equalizer.set_band_enabled(band, enabled)?;
        self.sync_equalizer();
        Ok(())
    }

    pub fn set_master_gain(&mut self, gain_db: f32) -> EngineResult<()> {
        self.stages.equalizer.set_master_gain(gain_db)?;
        self.sync_equalizer();
        Ok(())
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.stages.equalizer.set_bypass(bypass);
        self.sync_equalizer();
    }

    pub fn load_preset(&mut self, name: &str) -> EngineResult<()> {
        self.stages.equalizer.load_preset(name)?;
        self.config.equalizer.preset = Some(name.to_string());
        self.sync_equalizer();
        Ok(())
    }

    fn sync_equalizer(&mut self) {
        let eq = &self.stages.equalizer;
        let settings = &mut self.config.equalizer;
        settings.bands = eq.bands().to_vec();
        settings.master_gain_db = eq.master_gain_db();
        settings.bypass = eq.is_bypassed();
    }

    // --- Effects ---

    pub fn effects(&self) -> &EffectChain {
        &self.stages.effects
    }

    pub fn effects_mut(&mut self) -> &mut EffectChain {
        &mut self.stages.effects
    }

    /// Configure, add (`Some` when absent) or remove (`None`) the compressor
    ///
    /// A newly added compressor goes to the end of the effect chain.
    pub fn set_compressor(&mut self, config: Option<CompressorConfig>) -> EngineResult<()> {
        match (config, self.compressor) {
            (Some(config), Some(id)) => self
                .stages
                .effects
                .effect_mut::<Compressor>(id)
                .ok_or(EngineError::MissingStage("compressor"))?
                .set_config(config)?,
            (Some(config), None) => {
                self.compressor = Some(add_compressor(&mut self.stages.effects, config)?);
            }
            (None, Some(id)) => {
                self.stages.effects.remove_effect(id);
                self.compressor = None;
            }
            (None, None) => {}
        }
        self.config.compressor = config;
        Ok(())
    }

    pub fn compressor_metrics(&self) -> Option<CompressorMetrics> {
        let id = self.compressor?;
        self.stages
            .effects
            .effect::<Compressor>(id)
            .map(Compressor::metrics)
    }

    /// Configure, add (`Some` when absent) or remove (`None`) the delay
    pub fn set_delay(&mut self, config: Option<DelayConfig>) -> EngineResult<()> {
        match (config, self.delay) {
            (Some(config), Some(id)) => self
                .stages
                .effects
                .effect_mut::<Delay>(id)
                .ok_or(EngineError::MissingStage("delay"))?
                .set_config(config)?,
            (Some(config), None) => {
                self.delay = Some(add_delay(&mut self.stages.effects, config)?);
            }
            (None, Some(id)) => {
                self.stages.effects.remove_effect(id);
                self.delay = None;
            }
            (None, None) => {}
        }
        self.config.delay = config;
        Ok(())
    }

    /// Store analysis settings for the engine's worker
    pub fn set_spectrum(&mut self, spectrum: Option<SpectrumConfig>) -> EngineResult<()> {
        if let Some(config) = spectrum {
            SpectrumConfig {
                sample_rate: self.context.sample_rate,
                ..config
            }
            .validate()?;
        }
        self.config.spectrum = spectrum;
        Ok(())
    }

    // --- Noise reduction ---

    pub fn noise(&self) -> &NoiseManager {
        &self.stages.noise
    }

    /// Reconfigure noise reduction and start or stop it per `noise.enabled`
    ///
    /// The stream's sample rate and channel count replace the ones in
    /// `noise`. A rejected config leaves the running one in place.
    pub fn set_noise_config(&mut self, noise: NoiseConfig) -> EngineResult<()> {
        let config = NoiseConfig {
            sample_rate: self.context.sample_rate,
            channels: self.context.channels,
            ..noise
        };
        config.validate()?;
        let manager = &mut self.stages.noise;
        manager.set_config(config)?;
        match (config.enabled, manager.is_processing()) {
            (true, false) => manager.start()?,
            (false, true) => manager.stop()?,
            _ => {}
        }
        self.config.noise = config;
        Ok(())
    }

    pub fn set_noise_algorithm(&mut self, algorithm: NoiseAlgorithm) -> EngineResult<()> {
        self.set_noise_config(NoiseConfig {
            algorithm,
            ..self.config.noise
        })
    }

    pub fn noise_statistics(&self) -> NoiseStatistics {
        self.stages.noise.statistics()
    }
}

fn add_compressor(effects: &mut EffectChain, config: CompressorConfig) -> EngineResult<EffectId> {
    let mut compressor = Compressor::with_config(config)?;
    compressor.set_enabled(true);
    Ok(effects.add_effect(compressor)?)
}

fn add_delay(effects: &mut EffectChain, config: DelayConfig) -> EngineResult<EffectId> {
    let mut delay = Delay::with_config(config)?;
    delay.set_enabled(true);
    Ok(effects.add_effect(delay)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nyth_dsp::{DspError, NoiseState};
    use std::f32::consts::PI;

    fn sine_block(pipeline: &AudioPipeline, amplitude: f32, offset: usize) -> AudioBuffer {
        let ctx = pipeline.context();
        let mut buffer = AudioBuffer::new(ctx.channels, ctx.block_size);
        for ch in 0..ctx.channels {
            for (i, s) in buffer.channel_mut(ch).iter_mut().enumerate() {
                let t = (offset + i) as f32 / ctx.sample_rate;
                *s = amplitude * (2.0 * PI * 440.0 * t).sin();
            }
        }
        buffer
    }

    #[test]
    fn test_default_pipeline_is_transparent_below_threshold() {
        let mut pipeline = AudioPipeline::new(PipelineConfig::default()).unwrap();
        let mut buffer = sine_block(&pipeline, 0.25, 0);
        let original = buffer.channel(0).to_vec();
        let report = pipeline.process(&mut buffer);

        assert_eq!(report.frames, 512);
        assert_eq!(report.safety.clipped_samples, 0);
        // Flat EQ is skipped, effects absent, noise reduction idle
        assert_eq!(buffer.channel(0), &original[..]);
        assert!((report.peak - buffer.magnitude_all()).abs() < 1e-6);
    }

    #[test]
    fn test_hostile_input_is_scrubbed() {
        let mut pipeline = AudioPipeline::new(PipelineConfig::music()).unwrap();
        let mut buffer = sine_block(&pipeline, 3.0, 0);
        buffer.channel_mut(0)[5] = f32::NAN;
        buffer.channel_mut(1)[9] = f32::NEG_INFINITY;

        let report = pipeline.process(&mut buffer);
        assert_eq!(report.safety.non_finite_samples, 2);
        assert!(report.safety.clipped_samples > 0);
        assert!(!buffer.has_non_finite());
    }

    #[test]
    fn test_interleaved_matches_planar() {
        let mut planar = AudioPipeline::new(PipelineConfig::music()).unwrap();
        let mut interleaved = AudioPipeline::new(PipelineConfig::music()).unwrap();
        planar.load_preset("rock").unwrap();
        interleaved.load_preset("rock").unwrap();

        let mut buffer = sine_block(&planar, 0.5, 0);
        let mut data = vec![0.0; buffer.num_samples() * 2];
        interleave_buffer(&buffer, &mut data);

        planar.process(&mut buffer);
        let report = interleaved.process_interleaved(&mut data);
        assert_eq!(report.frames, buffer.num_samples());
        for (i, frame) in data.chunks_exact(2).enumerate() {
            assert!((frame[0] - buffer.channel(0)[i]).abs() < 1e-6);
            assert!((frame[1] - buffer.channel(1)[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_interleaved_spans_several_blocks() {
        let mut pipeline = AudioPipeline::new(PipelineConfig::low_latency()).unwrap();
        // 64-frame blocks, stereo; 150 frames plus a dangling sample
        let mut data = vec![2.0; 150 * 2 + 1];
        let report = pipeline.process_interleaved(&mut data);
        assert_eq!(report.frames, 150);
        assert_eq!(report.safety.clipped_samples, 300);
        assert!(data[..300].iter().all(|&s| s <= 1.0));
        assert_eq!(data[300], 2.0);
    }

    #[test]
    fn test_report_merge_weights_by_frames() {
        let mut a = BlockReport {
            frames: 100,
            rms: 1.0,
            peak: 1.0,
            ..Default::default()
        };
        let b = BlockReport {
            frames: 300,
            rms: 0.0,
            peak: 0.5,
            safety: SafetyReport {
                overload: true,
                feedback_score: 0.97,
                feedback_likely: true,
                ..Default::default()
            },
        };
        a.merge(&b);
        assert_eq!(a.frames, 400);
        assert!((a.rms - 0.5).abs() < 1e-6);
        assert_eq!(a.peak, 1.0);
        assert!(a.safety.overload && a.safety.feedback_likely);
        assert_eq!(a.safety.feedback_score, 0.97);
    }

    #[test]
    fn test_control_changes_track_config() {
        let mut pipeline = AudioPipeline::new(PipelineConfig::default()).unwrap();
        pipeline.load_preset("bass_boost").unwrap();
        assert_eq!(pipeline.config().equalizer.preset.as_deref(), Some("bass_boost"));
        assert_eq!(pipeline.config().equalizer.bands[0].gain_db, 6.0);

        pipeline.set_band_gain(9, 3.0).unwrap();
        let config = pipeline.config();
        assert_eq!(config.equalizer.preset, None);
        assert_eq!(config.equalizer.bands[9].gain_db, 3.0);

        // Rejected values leave everything as it was
        assert!(pipeline.set_band_gain(2, 99.0).is_err());
        assert!(matches!(
            pipeline.set_band_gain(42, 1.0),
            Err(EngineError::DspError(DspError::InvalidBandIndex(42)))
        ));
        assert_eq!(pipeline.config(), config);

        pipeline.safety_controls().set_threshold_db(-6.0).unwrap();
        assert!((pipeline.config().safety.threshold_db + 6.0).abs() < 1e-3);
    }

    #[test]
    fn test_compressor_and_delay_lifecycle() {
        let mut pipeline = AudioPipeline::new(PipelineConfig::default()).unwrap();
        assert!(pipeline.effects().is_empty());
        assert!(pipeline.compressor_metrics().is_none());

        pipeline.set_compressor(Some(CompressorConfig::default())).unwrap();
        pipeline.set_delay(Some(DelayConfig::default())).unwrap();
        assert_eq!(pipeline.effects().len(), 2);

        let tighter = CompressorConfig {
            ratio: 10.0,
            ..Default::default()
        };
        pipeline.set_compressor(Some(tighter)).unwrap();
        assert_eq!(pipeline.effects().len(), 2);
        assert_eq!(pipeline.config().compressor, Some(tighter));

        let mut buffer = sine_block(&pipeline, 0.9, 0);
        pipeline.process(&mut buffer);
        assert!(pipeline.compressor_metrics().unwrap().active);

        pipeline.set_compressor(None).unwrap();
        pipeline.set_delay(None).unwrap();
        assert!(pipeline.effects().is_empty());
        assert_eq!(pipeline.config().delay, None);
    }

    #[test]
    fn test_noise_reduction_toggles_and_adds_latency() {
        let mut pipeline = AudioPipeline::new(PipelineConfig::default()).unwrap();
        assert_eq!(pipeline.noise().state(), NoiseState::Initialized);
        assert_eq!(pipeline.latency_samples(), 0);

        let spectral = NoiseConfig {
            enabled: true,
            algorithm: NoiseAlgorithm::SpectralSubtraction,
            ..Default::default()
        };
        pipeline.set_noise_config(spectral).unwrap();
        assert!(pipeline.noise().is_processing());
        assert_eq!(pipeline.latency_samples(), spectral.spectral.fft_size);

        let mut buffer = sine_block(&pipeline, 0.1, 0);
        pipeline.process(&mut buffer);
        assert_eq!(pipeline.noise_statistics().processed_frames, 512);

        pipeline.set_noise_algorithm(NoiseAlgorithm::Gate).unwrap();
        assert_eq!(pipeline.latency_samples(), 0);

        pipeline
            .set_noise_config(NoiseConfig {
                enabled: false,
                ..spectral
            })
            .unwrap();
        assert_eq!(pipeline.noise().state(), NoiseState::Initialized);
    }

    #[test]
    fn test_extra_stage_runs_last() {
        struct Silence;
        impl AudioProcessor for Silence {
            fn process(&mut self, buffer: &mut AudioBuffer, _context: &ProcessContext) {
                buffer.clear();
            }
            fn reset(&mut self) {}
            fn name(&self) -> &'static str {
                "Silence"
            }
        }

        let mut pipeline = AudioPipeline::new(PipelineConfig::default()).unwrap();
        pipeline.add_processor(Box::new(Silence));
        assert_eq!(pipeline.stage_names().last(), Some(&"Silence"));

        let mut buffer = sine_block(&pipeline, 0.5, 0);
        let report = pipeline.process(&mut buffer);
        assert!(report.safety.peak > 0.4);
        assert_eq!(report.peak, 0.0);

        assert!(pipeline.remove_processor("Silence").is_some());
        pipeline.reset();
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = PipelineConfig {
            compressor: Some(CompressorConfig {
                ratio: 0.5,
                ..Default::default()
            }),
            ..PipelineConfig::default()
        };
        assert!(AudioPipeline::new(config).is_err());
    }
}
