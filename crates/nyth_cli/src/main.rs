//! Nyth CLI
//!
//! Pushes a synthetic tone (optionally with hiss) through the engine in
//! real-time-sized blocks and reports what the pipeline did. No audio
//! devices or files are involved.

use std::f32::consts::PI;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use nyth_core::{AudioBuffer, AudioEngine, Event, NoiseAlgorithm, PipelineConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Default,
    LowLatency,
    Voice,
    Music,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Noise {
    Off,
    Gate,
    Spectral,
    Wiener,
}

#[derive(Parser)]
#[command(name = "nyth")]
#[command(about = "Run a test signal through the Nyth signal chain", long_about = None)]
struct Cli {
    /// Pipeline starting point
    #[arg(short, long, value_enum, default_value_t = Profile::Default)]
    profile: Profile,

    /// Full pipeline configuration as JSON (overrides --profile)
    #[arg(long)]
    config_json: Option<String>,

    /// Built-in EQ preset
    #[arg(long)]
    preset: Option<String>,

    /// Noise reduction mode
    #[arg(long, value_enum)]
    noise: Option<Noise>,

    /// Seconds of audio to generate
    #[arg(short, long, default_value_t = 2.0)]
    seconds: f32,

    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,

    /// Tone amplitude (linear)
    #[arg(long, default_value_t = 0.5)]
    amplitude: f32,

    /// White noise amplitude mixed into the tone
    #[arg(long, default_value_t = 0.0)]
    hiss: f32,

    /// Run the background spectrum analyzer
    #[arg(long)]
    analysis: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "nyth=debug" } else { "nyth=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = build_config(&cli)?;
    if cli.print_config {
        println!("{}", config.to_json_string()?);
        return Ok(());
    }

    let engine = AudioEngine::new(config.clone()).context("failed to build engine")?;
    if cli.analysis {
        engine.start_analysis()?;
    }

    run(&cli, &config, &engine);

    if cli.analysis {
        engine.stop_analysis()?;
        if let Some(spectrum) = engine.spectrum() {
            let statistics = engine.spectrum_statistics();
            info!(
                frames = statistics.total_frames,
                centroid_hz = spectrum.centroid,
                rolloff_hz = statistics.rolloff,
                flatness = statistics.flatness,
                "spectrum"
            );
        }
    }
    report_events(&engine);
    Ok(())
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config_json {
        Some(json) => PipelineConfig::from_json_str(json)?,
        None => match cli.profile {
            Profile::Default => PipelineConfig::default(),
            Profile::LowLatency => PipelineConfig::low_latency(),
            Profile::Voice => PipelineConfig::voice(),
            Profile::Music => PipelineConfig::music(),
        },
    };
    if let Some(preset) = &cli.preset {
        config.equalizer.preset = Some(preset.clone());
    }
    match cli.noise {
        Some(Noise::Off) => config.noise.enabled = false,
        Some(Noise::Gate) => {
            config.noise.enabled = true;
            config.noise.algorithm = NoiseAlgorithm::Gate;
        }
        Some(Noise::Spectral) => {
            config.noise.enabled = true;
            config.noise.algorithm = NoiseAlgorithm::SpectralSubtraction;
        }
        Some(Noise::Wiener) => {
            config.noise.enabled = true;
            config.noise.algorithm = NoiseAlgorithm::Wiener;
        }
        None => {}
    }
    if !(cli.seconds > 0.0 && cli.seconds <= 600.0) {
        bail!("--seconds must be in (0, 600], got {}", cli.seconds);
    }
    config.validate()?;
    debug!(?config, "effective configuration");
    Ok(config)
}

fn run(cli: &Cli, config: &PipelineConfig, engine: &AudioEngine) {
    let stream = config.stream;
    let sample_rate = stream.sample_rate_hz();
    let frames = stream.frames();
    let total_frames = (cli.seconds * sample_rate) as usize;
    let blocks = (total_frames + frames - 1) / frames;

    let mut rng = StdRng::seed_from_u64(0x6e797468);
    let mut buffer = AudioBuffer::new(stream.num_channels(), frames);
    let mut clipped = 0;
    let mut input_peak = 0.0f32;
    let started = Instant::now();

    info!(
        blocks,
        block_size = frames,
        latency_ms = stream.latency_ms(),
        "processing"
    );

    for block in 0..blocks {
        let offset = block * frames;
        for ch in 0..buffer.num_channels() {
            for (i, s) in buffer.channel_mut(ch).iter_mut().enumerate() {
                let t = (offset + i) as f32 / sample_rate;
                let hiss = if cli.hiss > 0.0 {
                    cli.hiss * rng.gen_range(-1.0f32..1.0)
                } else {
                    0.0
                };
                *s = cli.amplitude * (2.0 * PI * cli.frequency * t).sin() + hiss;
            }
        }
        let report = engine.process_block(&mut buffer);
        clipped += report.safety.clipped_samples;
        input_peak = input_peak.max(report.safety.peak);
    }

    let elapsed = started.elapsed();
    let audio_seconds = (blocks * frames) as f64 / sample_rate as f64;
    let levels = engine.levels();
    info!(
        input_peak,
        output_rms = levels.rms,
        output_peak_hold = levels.peak_hold,
        clipped,
        latency_samples = engine.latency_samples(),
        realtime_factor = audio_seconds / elapsed.as_secs_f64().max(1e-9),
        "done"
    );

    let noise = engine.noise_statistics();
    if noise.processed_frames > 0 {
        info!(
            reduction_db = noise.noise_reduction_db,
            frames = noise.processed_frames,
            "noise reduction"
        );
    }
    if let Some(metrics) = engine.compressor_metrics() {
        info!(
            gain_reduction_db = metrics.gain_reduction_db,
            active = metrics.active,
            "compressor"
        );
    }
}

fn report_events(engine: &AudioEngine) {
    let events = engine.drain_events();
    let warnings = events
        .iter()
        .filter(|e| matches!(e, Event::SafetyWarning { .. }))
        .count();
    let feedback = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                Event::SafetyWarning {
                    feedback_likely: true,
                    ..
                }
            )
        })
        .count();
    for event in &events {
        match event {
            Event::Error { message } => warn!(%message, "engine error"),
            Event::StateChanged { component, state } => debug!(%component, %state, "state"),
            _ => {}
        }
    }
    info!(
        queued = events.len(),
        safety_warnings = warnings,
        feedback_blocks = feedback,
        dropped = engine.events_dropped(),
        "events"
    );
}
