//! FFT Spectrum Analyzer
//!
//! Windowed FFT magnitude analysis for visualization and metrics. This is a
//! read-only consumer of audio: it never touches the processing path.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --initialize--> Initialized --start--> Analyzing
//!                                    ^                    |
//!                                    +-------stop---------+
//! any --release--> Shutdown (terminal)
//! ```
//!
//! `Error` is entered when the analysis engine cannot be built; a fresh
//! `initialize` recovers from it.
//!
//! Each analysis call returns a [`SpectrumData`] that borrows the analyzer's
//! internal arrays, so it is only valid until the next call. Copy it with
//! [`SpectrumData::to_owned_spectrum`] to keep it around.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DspError, DspResult};
use crate::fft::{hann_symmetric, validate_fft_size, FftEngine};

/// Fraction of total magnitude below the rolloff frequency
const ROLLOFF_FRACTION: f32 = 0.95;

/// Most overlap the streaming analysis hop may use
const MAX_OVERLAP: f32 = 0.95;

/// How analysis bands are spread between `min_freq` and `max_freq`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandScale {
    Linear,
    Logarithmic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    /// Power of two, 64 to 8192
    pub fft_size: usize,
    pub sample_rate: f32,
    /// Output bands, 1 to fft_size / 2
    pub num_bands: usize,
    pub min_freq: f32,
    pub max_freq: f32,
    /// Apply a Hann window before the transform
    pub use_windowing: bool,
    pub scale: BandScale,
    /// Frame overlap for streaming analysis (0 to 0.95)
    pub overlap: f32,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            sample_rate: 48000.0,
            num_bands: 32,
            min_freq: 20.0,
            max_freq: 20000.0,
            use_windowing: true,
            scale: BandScale::Logarithmic,
            overlap: 0.5,
        }
    }
}

impl SpectrumConfig {
    pub fn validate(&self) -> DspResult<()> {
        validate_fft_size(self.fft_size)?;
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(DspError::InvalidSampleRate(self.sample_rate));
        }
        let nyquist = self.sample_rate / 2.0;
        if !(self.min_freq > 0.0 && self.min_freq < self.max_freq && self.max_freq <= nyquist) {
            return Err(DspError::InvalidFrequencyRange {
                min: self.min_freq,
                max: self.max_freq,
            });
        }
        if self.num_bands == 0 || self.num_bands > self.fft_size / 2 {
            return Err(DspError::InvalidBandCount(self.num_bands));
        }
        crate::error::check_range("overlap", self.overlap, 0.0, MAX_OVERLAP)
    }

    /// Samples between successive frames when analyzing a stream
    pub fn hop_size(&self) -> usize {
        ((self.fft_size as f32 * (1.0 - self.overlap)).round() as usize).max(1)
    }

    /// Frequency resolution of one FFT bin
    pub fn bin_width(&self) -> f32 {
        self.sample_rate / self.fft_size as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectrumState {
    Uninitialized,
    Initialized,
    Analyzing,
    Error,
    Shutdown,
}

impl SpectrumState {
    pub fn as_str(self) -> &'static str {
        match self {
            SpectrumState::Uninitialized => "uninitialized",
            SpectrumState::Initialized => "initialized",
            SpectrumState::Analyzing => "analyzing",
            SpectrumState::Error => "error",
            SpectrumState::Shutdown => "shutdown",
        }
    }
}

/// Borrowed snapshot of one analysis frame
#[derive(Debug, Clone, Copy)]
pub struct SpectrumData<'a> {
    /// Band magnitudes, normalized so a full-scale sine reads about 1.0
    pub magnitudes: &'a [f32],
    /// Centre frequency of each band (Hz)
    pub frequencies: &'a [f32],
    /// Magnitude-weighted mean frequency of this frame (Hz)
    pub centroid: f32,
    /// Frame counter since the last statistics reset
    pub frame: u64,
}

impl SpectrumData<'_> {
    pub fn to_owned_spectrum(&self) -> OwnedSpectrum {
        OwnedSpectrum {
            magnitudes: self.magnitudes.to_vec(),
            frequencies: self.frequencies.to_vec(),
            centroid: self.centroid,
            frame: self.frame,
        }
    }
}

/// Owned copy of a [`SpectrumData`] that can cross threads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedSpectrum {
    pub magnitudes: Vec<f32>,
    pub frequencies: Vec<f32>,
    pub centroid: f32,
    pub frame: u64,
}

/// Running spectral statistics since the last reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumStatistics {
    pub total_frames: u64,
    /// Mean band magnitude, averaged over frames
    pub average_magnitude: f32,
    /// Largest band magnitude seen
    pub peak_magnitude: f32,
    /// Spectral centroid (Hz), averaged over frames
    pub centroid: f32,
    /// Spread around the centroid (Hz), averaged over frames
    pub spread: f32,
    /// Geometric / arithmetic mean of non-zero bands, averaged over frames
    pub flatness: f32,
    /// Frequency below which 95% of the magnitude lies, averaged over frames
    pub rolloff: f32,
}

impl SpectrumStatistics {
    fn accumulate(&mut self, frame: &FrameFeatures) {
        self.total_frames += 1;
        let n = self.total_frames as f32;
        let mean = |avg: f32, x: f32| avg + (x - avg) / n;
        self.average_magnitude = mean(self.average_magnitude, frame.mean);
        self.peak_magnitude = self.peak_magnitude.max(frame.peak);
        self.centroid = mean(self.centroid, frame.centroid);
        self.spread = mean(self.spread, frame.spread);
        self.flatness = mean(self.flatness, frame.flatness);
        self.rolloff = mean(self.rolloff, frame.rolloff);
    }
}

/// Per-frame features computed from band magnitudes
struct FrameFeatures {
    mean: f32,
    peak: f32,
    centroid: f32,
    spread: f32,
    flatness: f32,
    rolloff: f32,
}

impl FrameFeatures {
    fn compute(magnitudes: &[f32], frequencies: &[f32]) -> Self {
        let total: f32 = magnitudes.iter().sum();
        let peak = magnitudes.iter().fold(0.0_f32, |m, &x| m.max(x));
        let mean = if magnitudes.is_empty() {
            0.0
        } else {
            total / magnitudes.len() as f32
        };
        if total <= 0.0 {
            return Self {
                mean,
                peak,
                centroid: 0.0,
                spread: 0.0,
                flatness: 0.0,
                rolloff: 0.0,
            };
        }

        let centroid = magnitudes
            .iter()
            .zip(frequencies)
            .map(|(m, f)| m * f)
            .sum::<f32>()
            / total;
        let spread = (magnitudes
            .iter()
            .zip(frequencies)
            .map(|(m, f)| m * (f - centroid) * (f - centroid))
            .sum::<f32>()
            / total)
            .sqrt();

        let (log_sum, count, sum) = magnitudes
            .iter()
            .filter(|&&m| m > 0.0)
            .fold((0.0_f64, 0usize, 0.0_f64), |(l, c, s), &m| {
                (l + (m as f64).ln(), c + 1, s + m as f64)
            });
        let flatness = if count > 0 {
            let geometric = (log_sum / count as f64).exp();
            let arithmetic = sum / count as f64;
            (geometric / arithmetic) as f32
        } else {
            0.0
        };

        let target = ROLLOFF_FRACTION * total;
        let mut cumulative = 0.0;
        let mut rolloff = frequencies.last().copied().unwrap_or(0.0);
        for (m, f) in magnitudes.iter().zip(frequencies) {
            cumulative += m;
            if cumulative >= target {
                rolloff = *f;
                break;
            }
        }

        Self {
            mean,
            peak,
            centroid,
            spread,
            flatness,
            rolloff,
        }
    }
}

/// Everything sized by the configuration
struct Analysis {
    config: SpectrumConfig,
    fft: FftEngine,
    window: Vec<f32>,
    window_sum: f32,
    frame: Vec<f32>,
    bins: Vec<f32>,
    /// `[start, end)` FFT bin range of each band
    band_bins: Vec<(usize, usize)>,
    band_frequencies: Vec<f32>,
    band_magnitudes: Vec<f32>,
    last_centroid: f32,
}

impl Analysis {
    fn new(config: SpectrumConfig) -> DspResult<Self> {
        let fft = FftEngine::new(config.fft_size)?;
        let window = if config.use_windowing {
            hann_symmetric(config.fft_size)
        } else {
            vec![1.0; config.fft_size]
        };
        let window_sum = window.iter().sum();
        let (band_bins, band_frequencies) = band_layout(&config);
        Ok(Self {
            fft,
            window_sum,
            window,
            frame: vec![0.0; config.fft_size],
            bins: vec![0.0; config.fft_size / 2 + 1],
            band_magnitudes: vec![0.0; config.num_bands],
            band_bins,
            band_frequencies,
            last_centroid: 0.0,
            config,
        })
    }

    /// Copy the most recent `fft_size` samples of `input` into the frame
    fn load(&mut self, input: &[f32]) -> usize {
        let input = &input[input.len().saturating_sub(self.config.fft_size)..];
        for (dst, &x) in self.frame.iter_mut().zip(input) {
            *dst = sanitize(x);
        }
        input.len()
    }

    /// Mix a stereo pair into the frame as (L + R) / 2
    fn load_stereo(&mut self, left: &[f32], right: &[f32]) -> usize {
        let n = left.len().min(right.len());
        let offset = n.saturating_sub(self.config.fft_size);
        for ((dst, &l), &r) in self.frame.iter_mut().zip(&left[offset..n]).zip(&right[offset..n]) {
            *dst = sanitize(0.5 * (l + r));
        }
        n - offset
    }

    /// Window the first `len` frame samples, zero-pad, transform and reduce to bands
    fn transform(&mut self, len: usize) -> FrameFeatures {
        let size = self.config.fft_size;
        let window_sum = if len == size {
            for (x, &w) in self.frame.iter_mut().zip(&self.window) {
                *x *= w;
            }
            self.window_sum
        } else {
            // Short input: window just the real samples
            let mut sum = 0.0;
            for (n, x) in self.frame[..len].iter_mut().enumerate() {
                let w = if self.config.use_windowing && len > 1 {
                    0.5 * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (len - 1) as f32).cos())
                } else {
                    1.0
                };
                sum += w;
                *x *= w;
            }
            self.frame[len..].fill(0.0);
            sum
        };

        self.fft.forward(&self.frame);
        self.fft.magnitudes(&mut self.bins);

        // Coherent-gain normalization: a bin-centred sine of amplitude A reads A
        let norm = if window_sum > 0.0 { 2.0 / window_sum } else { 0.0 };
        for (out, &(start, end)) in self.band_magnitudes.iter_mut().zip(&self.band_bins) {
            let bins = &self.bins[start..end];
            *out = if bins.is_empty() {
                0.0
            } else {
                bins.iter().sum::<f32>() / bins.len() as f32 * norm
            };
        }

        let features = FrameFeatures::compute(&self.band_magnitudes, &self.band_frequencies);
        self.last_centroid = features.centroid;
        features
    }
}

#[inline]
fn sanitize(x: f32) -> f32 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

/// Bin ranges and centre frequencies for each band
fn band_layout(config: &SpectrumConfig) -> (Vec<(usize, usize)>, Vec<f32>) {
    let bands = config.num_bands;
    let bin_width = config.bin_width();
    let num_bins = config.fft_size / 2 + 1;
    let (min, max) = (config.min_freq, config.max_freq);

    let edge = |i: usize| -> f32 {
        let t = i as f32 / bands as f32;
        match config.scale {
            BandScale::Linear => min + t * (max - min),
            BandScale::Logarithmic => min * (max / min).powf(t),
        }
    };

    (0..bands)
        .map(|i| {
            let (lo, hi) = (edge(i), edge(i + 1));
            let centre = match config.scale {
                BandScale::Linear => 0.5 * (lo + hi),
                BandScale::Logarithmic => (lo * hi).sqrt(),
            };
            let start = ((lo / bin_width).round() as usize).min(num_bins - 1);
            let mut end = ((hi / bin_width).round() as usize).min(num_bins);
            if end <= start {
                // Band narrower than a bin: use the bin nearest its centre
                let nearest = ((centre / bin_width).round() as usize).min(num_bins - 1);
                return ((nearest, nearest + 1), centre);
            }
            end = end.max(start + 1);
            ((start, end), centre)
        })
        .unzip()
}

/// Spectrum analyzer with an explicit lifecycle
pub struct SpectrumAnalyzer {
    state: SpectrumState,
    analysis: Option<Analysis>,
    statistics: SpectrumStatistics,
    last_error: Option<DspError>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        Self {
            state: SpectrumState::Uninitialized,
            analysis: None,
            statistics: SpectrumStatistics::default(),
            last_error: None,
        }
    }

    pub fn state(&self) -> SpectrumState {
        self.state
    }

    pub fn config(&self) -> Option<&SpectrumConfig> {
        self.analysis.as_ref().map(|a| &a.config)
    }

    pub fn last_error(&self) -> Option<&DspError> {
        self.last_error.as_ref()
    }

    fn fail(&mut self, error: DspError) -> DspError {
        warn!(%error, state = self.state.as_str(), "spectrum analyzer rejected call");
        self.last_error = Some(error.clone());
        error
    }

    fn invalid_state(&mut self, operation: &'static str) -> DspError {
        let state = self.state.as_str();
        self.fail(DspError::InvalidState { operation, state })
    }

    /// Validate `config` and allocate every analysis buffer
    pub fn initialize(&mut self, config: SpectrumConfig) -> DspResult<()> {
        if !matches!(
            self.state,
            SpectrumState::Uninitialized | SpectrumState::Error
        ) {
            return Err(self.invalid_state("initialize"));
        }
        if let Err(e) = config.validate() {
            return Err(self.fail(e));
        }
        match Analysis::new(config) {
            Ok(analysis) => {
                self.analysis = Some(analysis);
                self.statistics = SpectrumStatistics::default();
                self.state = SpectrumState::Initialized;
                info!(
                    fft_size = config.fft_size,
                    bands = config.num_bands,
                    "spectrum analyzer initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.state = SpectrumState::Error;
                Err(self.fail(e))
            }
        }
    }

    /// Swap in a new configuration, keeping the current run state
    pub fn set_config(&mut self, config: SpectrumConfig) -> DspResult<()> {
        match self.state {
            SpectrumState::Shutdown => return Err(self.invalid_state("reconfigure")),
            SpectrumState::Uninitialized | SpectrumState::Error => {
                return self.initialize(config)
            }
            SpectrumState::Initialized | SpectrumState::Analyzing => {}
        }
        if let Err(e) = config.validate() {
            return Err(self.fail(e));
        }
        let analysis = Analysis::new(config).map_err(|e| self.fail(e))?;
        self.analysis = Some(analysis);
        self.statistics = SpectrumStatistics::default();
        debug!(fft_size = config.fft_size, "spectrum analyzer reconfigured");
        Ok(())
    }

    pub fn start(&mut self) -> DspResult<()> {
        if self.state != SpectrumState::Initialized {
            return Err(self.invalid_state("start"));
        }
        self.state = SpectrumState::Analyzing;
        debug!("spectrum analysis started");
        Ok(())
    }

    pub fn stop(&mut self) -> DspResult<()> {
        if self.state != SpectrumState::Analyzing {
            return Err(self.invalid_state("stop"));
        }
        self.state = SpectrumState::Initialized;
        debug!("spectrum analysis stopped");
        Ok(())
    }

    /// Free all buffers; the analyzer cannot be used afterwards
    pub fn release(&mut self) {
        self.analysis = None;
        self.state = SpectrumState::Shutdown;
        info!("spectrum analyzer released");
    }

    /// Analyze one mono block
    ///
    /// Shorter inputs are zero-padded, longer ones use their most recent
    /// `fft_size` samples. Fails without side effects unless analyzing.
    ///
    /// # Real-time Safety
    /// No allocations on success.
    pub fn process_audio_buffer(&mut self, input: &[f32]) -> DspResult<SpectrumData<'_>> {
        self.analyze(|analysis| analysis.load(input))
    }

    /// Analyze a stereo block mixed down to (L + R) / 2
    pub fn process_audio_buffer_stereo(
        &mut self,
        left: &[f32],
        right: &[f32],
    ) -> DspResult<SpectrumData<'_>> {
        self.analyze(|analysis| analysis.load_stereo(left, right))
    }

    fn analyze(
        &mut self,
        load: impl FnOnce(&mut Analysis) -> usize,
    ) -> DspResult<SpectrumData<'_>> {
        let analysis = match (self.state, self.analysis.as_mut()) {
            (SpectrumState::Analyzing, Some(analysis)) => analysis,
            (state, _) => {
                return Err(DspError::InvalidState {
                    operation: "process audio",
                    state: state.as_str(),
                });
            }
        };
        let len = load(analysis);
        let features = analysis.transform(len);
        self.statistics.accumulate(&features);
        Ok(SpectrumData {
            magnitudes: &analysis.band_magnitudes,
            frequencies: &analysis.band_frequencies,
            centroid: features.centroid,
            frame: self.statistics.total_frames,
        })
    }

    /// Snapshot of the most recent frame, if any has been analyzed
    pub fn last_spectrum(&self) -> Option<SpectrumData<'_>> {
        let analysis = self.analysis.as_ref()?;
        if self.statistics.total_frames == 0 {
            return None;
        }
        Some(SpectrumData {
            magnitudes: &analysis.band_magnitudes,
            frequencies: &analysis.band_frequencies,
            centroid: analysis.last_centroid,
            frame: self.statistics.total_frames,
        })
    }

    pub fn statistics(&self) -> SpectrumStatistics {
        self.statistics
    }

    pub fn reset_statistics(&mut self) {
        self.statistics = SpectrumStatistics::default();
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
