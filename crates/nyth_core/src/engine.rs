//! Audio Engine
//!
//! The control surface around an [`AudioPipeline`]. The audio thread calls
//! [`AudioEngine::process_block`]; any other thread adjusts parameters,
//! reads meters and drains events. A background worker turns a mono copy of
//! the processed audio into spectrum snapshots.
//!
//! Locking: the pipeline sits behind one `parking_lot::Mutex`. Setters hold
//! it only long enough to swap coefficients. Meters, events and the safety
//! threshold never touch it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nyth_dsp::{
    AudioBuffer, AudioProcessor, CompressorConfig, CompressorMetrics, DelayConfig, FilterType,
    NoiseAlgorithm, NoiseConfig, NoiseStatistics, OwnedSpectrum, SafetyControls,
    SpectrumAnalyzer, SpectrumConfig, SpectrumStatistics,
};
use parking_lot::{Mutex, RwLock};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{EngineError, EngineResult};
use crate::message::{Event, EventQueue};
use crate::meter::{LevelMeter, Levels};
use crate::pipeline::{AudioPipeline, BlockReport};

/// Level events per second sent to the control thread
const LEVEL_EVENT_RATE: u32 = 30;

/// How long the analysis worker sleeps when the ring is empty
const ANALYSIS_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Analysis ring capacity, in FFT frames
const ANALYSIS_RING_FRAMES: usize = 4;

/// Everything the audio thread touches under the lock
struct Shared {
    pipeline: AudioPipeline,
    /// Feeds the analysis worker while it runs
    tap: Option<Producer<f32>>,
    /// Samples the tap could not fit
    tap_dropped: u64,
}

/// Latest analysis output, for UI polling
#[derive(Default)]
struct SpectrumSnapshot {
    latest: Option<OwnedSpectrum>,
    statistics: SpectrumStatistics,
}

struct AnalysisWorker {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Thread-safe front end for the signal chain
///
/// Share it between threads with an `Arc`; every method takes `&self`.
pub struct AudioEngine {
    shared: Mutex<Shared>,
    safety: Arc<SafetyControls>,
    meter: Arc<LevelMeter>,
    events: Arc<EventQueue>,
    spectrum: Arc<RwLock<SpectrumSnapshot>>,
    worker: Mutex<Option<AnalysisWorker>>,
    /// Blocks between level events
    level_interval: u64,
}

impl AudioEngine {
    /// Build the pipeline described by `config`
    pub fn new(config: PipelineConfig) -> EngineResult<Self> {
        let pipeline = AudioPipeline::new(config.clone())?;
        let stream = config.stream;
        let blocks_per_second = stream.sample_rate / stream.block_size.max(1);
        let level_interval = (blocks_per_second / LEVEL_EVENT_RATE).max(1) as u64;

        info!(
            sample_rate = stream.sample_rate,
            channels = stream.channels,
            block_size = stream.block_size,
            "audio engine created"
        );

        Ok(Self {
            safety: pipeline.safety_controls(),
            shared: Mutex::new(Shared {
                pipeline,
                tap: None,
                tap_dropped: 0,
            }),
            meter: Arc::new(LevelMeter::new()),
            events: Arc::new(EventQueue::new(config.event_queue_capacity)),
            spectrum: Arc::new(RwLock::new(SpectrumSnapshot::default())),
            worker: Mutex::new(None),
            level_interval,
        })
    }

    /// Parse a JSON [`PipelineConfig`] and build the engine from it
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        Self::new(PipelineConfig::from_json_str(json)?)
    }

    // --- Audio thread ---

    /// Process one planar block in place
    ///
    /// # Real-time Safety
    /// Takes the pipeline lock (held only briefly by control calls), no
    /// allocations except when an evicted event is freed.
    pub fn process_block(&self, buffer: &mut AudioBuffer) -> BlockReport {
        let report = {
            let mut shared = self.shared.lock();
            let report = shared.pipeline.process(buffer);
            let Shared {
                tap, tap_dropped, ..
            } = &mut *shared;
            if let Some(producer) = tap.as_mut() {
                let channels = buffer.num_channels().max(1);
                *tap_dropped += push_mono(producer, buffer.num_samples(), |i| {
                    (0..channels).map(|ch| buffer.channel(ch)[i]).sum::<f32>() / channels as f32
                });
            }
            report
        };
        self.publish(&report);
        report
    }

    /// Process interleaved samples in place
    pub fn process_interleaved(&self, data: &mut [f32]) -> BlockReport {
        let report = {
            let mut shared = self.shared.lock();
            let report = shared.pipeline.process_interleaved(data);
            let channels = shared.pipeline.context().channels;
            let Shared {
                tap, tap_dropped, ..
            } = &mut *shared;
            if let Some(producer) = tap.as_mut() {
                *tap_dropped += push_mono(producer, report.frames, |i| {
                    let frame = &data[i * channels..(i + 1) * channels];
                    frame.iter().sum::<f32>() / channels as f32
                });
            }
            report
        };
        self.publish(&report);
        report
    }

    fn publish(&self, report: &BlockReport) {
        self.meter.update(report.rms, report.peak);
        if report.safety.needs_attention() {
            self.events.push(Event::SafetyWarning {
                clipped_samples: report.safety.clipped_samples,
                non_finite_samples: report.safety.non_finite_samples,
                overload: report.safety.overload,
                feedback_score: report.safety.feedback_score,
                feedback_likely: report.safety.feedback_likely,
            });
        }
        if self.meter.levels().blocks % self.level_interval == 0 {
            self.events.push(Event::LevelUpdate {
                rms: report.rms,
                peak: report.peak,
            });
        }
    }

    // --- Metering and events ---

    /// Levels of the last block; never takes the pipeline lock
    pub fn levels(&self) -> Levels {
        self.meter.levels()
    }

    pub fn clear_peak_hold(&self) {
        self.meter.clear_hold();
    }

    pub fn try_recv_event(&self) -> Option<Event> {
        self.events.try_recv()
    }

    pub fn drain_events(&self) -> Vec<Event> {
        self.events.drain()
    }

    /// Events lost to a full queue
    pub fn events_dropped(&self) -> u64 {
        self.events.dropped()
    }

    fn notify(&self, component: &str, state: &str) {
        self.events.push(Event::state_changed(component, state));
    }

    // --- Control ---

    /// Snapshot of the current settings
    pub fn config(&self) -> PipelineConfig {
        self.shared.lock().pipeline.config()
    }

    /// Run `f` with exclusive access to the pipeline
    ///
    /// The audio thread blocks for as long as `f` runs.
    pub fn with_pipeline<R>(&self, f: impl FnOnce(&mut AudioPipeline) -> R) -> R {
        f(&mut self.shared.lock().pipeline)
    }

    pub fn add_processor(&self, processor: Box<dyn AudioProcessor>) {
        self.shared.lock().pipeline.add_processor(processor);
    }

    pub fn latency_samples(&self) -> usize {
        self.shared.lock().pipeline.latency_samples()
    }

    pub fn reset(&self) {
        self.shared.lock().pipeline.reset();
    }

    pub fn set_band_gain(&self, band: usize, gain_db: f32) -> EngineResult<()> {
        self.shared.lock().pipeline.set_band_gain(band, gain_db)
    }

    pub fn set_band_frequency(&self, band: usize, frequency: f32) -> EngineResult<()> {
        self.shared.lock().pipeline.set_band_frequency(band, frequency)
    }

    pub fn set_band_q(&self, band: usize, q: f32) -> EngineResult<()> {
        self.shared.lock().pipeline.set_band_q(band, q)
    }

    pub fn set_band_type(&self, band: usize, filter_type: FilterType) -> EngineResult<()> {
        self.shared.lock().pipeline.set_band_type(band, filter_type)
    }

    pub fn set_band_enabled(&self, band: usize, enabled: bool) -> EngineResult<()> {
        self.shared.lock().pipeline.set_band_enabled(band, enabled)
    }

    pub fn set_master_gain(&self, gain_db: f32) -> EngineResult<()> {
        self.shared.lock().pipeline.set_master_gain(gain_db)
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.shared.lock().pipeline.set_bypass(bypass);
        debug!(bypass, "equalizer bypass changed");
    }

    pub fn load_preset(&self, name: &str) -> EngineResult<()> {
        self.shared.lock().pipeline.load_preset(name)?;
        info!(preset = name, "preset loaded");
        Ok(())
    }

    /// Combined EQ response in dB, for drawing curves
    pub fn frequency_response(&self, frequency: f32) -> f32 {
        self.shared
            .lock()
            .pipeline
            .equalizer()
            .frequency_response(frequency)
    }

    pub fn set_compressor(&self, config: Option<CompressorConfig>) -> EngineResult<()> {
        self.shared.lock().pipeline.set_compressor(config)
    }

    pub fn compressor_metrics(&self) -> Option<CompressorMetrics> {
        self.shared.lock().pipeline.compressor_metrics()
    }

    pub fn set_delay(&self, config: Option<DelayConfig>) -> EngineResult<()> {
        self.shared.lock().pipeline.set_delay(config)
    }

    pub fn set_noise_config(&self, config: NoiseConfig) -> EngineResult<()> {
        let state = {
            let mut shared = self.shared.lock();
            shared.pipeline.set_noise_config(config)?;
            shared.pipeline.noise().state()
        };
        self.notify("noise", state.as_str());
        Ok(())
    }

    pub fn set_noise_algorithm(&self, algorithm: NoiseAlgorithm) -> EngineResult<()> {
        let config = self.config().noise;
        self.set_noise_config(NoiseConfig { algorithm, ..config })
    }

    pub fn noise_statistics(&self) -> NoiseStatistics {
        self.shared.lock().pipeline.noise_statistics()
    }

    /// Change the limiter ceiling without taking the pipeline lock
    pub fn set_safety_threshold(&self, threshold_db: f32) -> EngineResult<()> {
        self.safety.set_threshold_db(threshold_db)?;
        debug!(threshold_db, "safety threshold changed");
        Ok(())
    }

    pub fn set_soft_clip(&self, soft_clip: bool) {
        self.safety.set_soft_clip(soft_clip);
    }

    pub fn set_safety_enabled(&self, enabled: bool) {
        self.safety.set_enabled(enabled);
    }

    pub fn set_feedback_detection(&self, enabled: bool) {
        self.safety.set_feedback_detection(enabled);
    }

    /// Autocorrelation score at which a block is reported as feedback
    pub fn set_feedback_threshold(&self, threshold: f32) -> EngineResult<()> {
        self.safety.set_feedback_threshold(threshold)?;
        debug!(threshold, "feedback threshold changed");
        Ok(())
    }

    // --- Spectrum analysis ---

    /// Replace the analysis settings; takes effect on the next start
    pub fn set_spectrum_config(&self, config: Option<SpectrumConfig>) -> EngineResult<()> {
        self.shared.lock().pipeline.set_spectrum(config)
    }

    pub fn is_analysis_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Spawn the spectrum worker
    pub fn start_analysis(&self) -> EngineResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let config = self
            .config()
            .spectrum_config()
            .ok_or(EngineError::AnalysisNotConfigured)?;

        let mut analyzer = SpectrumAnalyzer::new();
        analyzer.initialize(config)?;
        analyzer.start()?;

        let block_size = self.shared.lock().pipeline.context().block_size;
        let capacity = (config.fft_size * ANALYSIS_RING_FRAMES).max(block_size * 4);
        let (producer, consumer) = RingBuffer::<f32>::new(capacity);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let spectrum = Arc::clone(&self.spectrum);
        let events = Arc::clone(&self.events);

        let handle = thread::Builder::new()
            .name("nyth-analysis".into())
            .spawn(move || run_analysis(analyzer, consumer, shutdown_clone, spectrum, events))
            .map_err(|e| EngineError::ThreadSpawnError {
                name: "analysis",
                reason: e.to_string(),
            })?;

        self.shared.lock().tap = Some(producer);
        *worker = Some(AnalysisWorker { shutdown, handle });
        drop(worker);

        info!(fft_size = config.fft_size, capacity, "spectrum analysis started");
        self.notify("spectrum", "analyzing");
        Ok(())
    }

    /// Signal the worker to exit and wait for it
    pub fn stop_analysis(&self) -> EngineResult<()> {
        let worker = self.worker.lock().take().ok_or(EngineError::NotRunning)?;
        // Detach the audio thread first so nothing is written to a dead ring
        self.shared.lock().tap = None;
        worker.shutdown.store(true, Ordering::SeqCst);
        if worker.handle.join().is_err() {
            warn!("analysis worker panicked");
            self.events.push(Event::error("analysis worker panicked"));
        }
        info!("spectrum analysis stopped");
        self.notify("spectrum", "stopped");
        Ok(())
    }

    /// Most recent analysis frame, if the worker has produced one
    pub fn spectrum(&self) -> Option<OwnedSpectrum> {
        self.spectrum.read().latest.clone()
    }

    pub fn spectrum_statistics(&self) -> SpectrumStatistics {
        self.spectrum.read().statistics
    }

    /// Samples the analysis ring had no room for
    pub fn analysis_dropped_samples(&self) -> u64 {
        self.shared.lock().tap_dropped
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.shutdown.store(true, Ordering::SeqCst);
            let _ = worker.handle.join();
        }
    }
}

/// Write up to `frames` mono samples into the ring; returns how many didn't fit
///
/// Real-time safe: no allocation, never blocks.
fn push_mono(producer: &mut Producer<f32>, frames: usize, sample: impl Fn(usize) -> f32) -> u64 {
    let n = producer.slots().min(frames);
    if n > 0 {
        if let Ok(mut chunk) = producer.write_chunk(n) {
            let (first, second) = chunk.as_mut_slices();
            for (i, slot) in first.iter_mut().chain(second.iter_mut()).enumerate() {
                *slot = sample(i);
            }
            chunk.commit_all();
        }
    }
    (frames - n) as u64
}

/// Analysis thread body
///
/// Keeps a sliding window of the last `fft_size` samples and analyzes it
/// every hop. The shutdown flag is checked between frames.
fn run_analysis(
    mut analyzer: SpectrumAnalyzer,
    mut consumer: Consumer<f32>,
    shutdown: Arc<AtomicBool>,
    snapshot: Arc<RwLock<SpectrumSnapshot>>,
    events: Arc<EventQueue>,
) {
    let Some(config) = analyzer.config().copied() else {
        return;
    };
    let fft_size = config.fft_size;
    let hop = config.hop_size().min(fft_size);
    let mut window = vec![0.0f32; fft_size];
    let mut pending = 0;

    debug!(fft_size, hop, "analysis worker running");

    while !shutdown.load(Ordering::SeqCst) {
        let available = consumer.slots();
        if available == 0 {
            thread::sleep(ANALYSIS_POLL_INTERVAL);
            continue;
        }

        let n = available.min(hop - pending);
        if let Ok(chunk) = consumer.read_chunk(n) {
            let (first, second) = chunk.as_slices();
            window.copy_within(n.., 0);
            let tail = fft_size - n;
            window[tail..tail + first.len()].copy_from_slice(first);
            window[tail + first.len()..].copy_from_slice(second);
            chunk.commit_all();
        }
        pending += n;
        if pending < hop {
            continue;
        }
        pending = 0;

        let spectrum = match analyzer.process_audio_buffer(&window) {
            Ok(data) => data.to_owned_spectrum(),
            Err(error) => {
                warn!(%error, "spectrum analysis failed");
                events.push(Event::error(&error));
                break;
            }
        };
        let statistics = analyzer.statistics();

        events.push(Event::SpectrumUpdate {
            magnitudes: spectrum.magnitudes.clone(),
            frequencies: spectrum.frequencies.clone(),
            centroid: spectrum.centroid,
        });
        let mut guard = snapshot.write();
        guard.latest = Some(spectrum);
        guard.statistics = statistics;
    }

    analyzer.release();
    debug!("analysis worker exiting");
}
