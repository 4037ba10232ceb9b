//! Engine behaviour across threads
//!
//! The audio side runs on its own thread here, the way a device callback
//! would, while the test thread plays the control role.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nyth_core::{AudioBuffer, AudioEngine, EngineError, Event, NoiseAlgorithm, PipelineConfig};

fn fill_sine(buffer: &mut AudioBuffer, frequency: f32, amplitude: f32, offset: usize) {
    let sample_rate = 48000.0;
    for ch in 0..buffer.num_channels() {
        for (i, s) in buffer.channel_mut(ch).iter_mut().enumerate() {
            let t = (offset + i) as f32 / sample_rate;
            *s = amplitude * (2.0 * PI * frequency * t).sin();
        }
    }
}

fn wait_for<T>(timeout: Duration, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Some(value) = poll() {
            return Some(value);
        }
        thread::sleep(Duration::from_millis(5));
    }
    None
}

#[test]
fn control_changes_while_audio_runs() {
    let engine = Arc::new(AudioEngine::new(PipelineConfig::music()).unwrap());
    let running = Arc::new(AtomicBool::new(true));

    let audio = {
        let engine = Arc::clone(&engine);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut buffer = AudioBuffer::new(2, 1024);
            let mut offset = 0;
            let mut blocks = 0;
            while running.load(Ordering::Relaxed) || blocks < 50 {
                fill_sine(&mut buffer, 220.0, 0.8, offset);
                engine.process_block(&mut buffer);
                assert!(!buffer.has_non_finite());
                offset += 1024;
                blocks += 1;
            }
            blocks
        })
    };

    for step in 0..200 {
        let gain = (step % 25) as f32 - 12.0;
        engine.set_band_gain(step % 10, gain).unwrap();
        engine.set_safety_threshold(-((step % 12) as f32)).unwrap();
        if step % 40 == 0 {
            engine.load_preset("loudness").unwrap();
        }
        if step % 50 == 25 {
            engine
                .set_noise_algorithm(NoiseAlgorithm::SpectralSubtraction)
                .unwrap();
        }
        // Rejected values never reach the audio thread
        assert!(engine.set_band_gain(0, 100.0).is_err());
        let _ = engine.levels();
    }
    running.store(false, Ordering::Relaxed);

    let blocks = audio.join().unwrap();
    let levels = engine.levels();
    assert_eq!(levels.blocks, blocks as u64);
    assert!(levels.peak > 0.0);
    assert!(engine
        .drain_events()
        .iter()
        .all(|e| !matches!(e, Event::Error { .. })));
}

#[test]
fn event_queue_drops_oldest_under_backpressure() {
    let config = PipelineConfig {
        event_queue_capacity: 4,
        ..PipelineConfig::default()
    };
    let engine = AudioEngine::new(config).unwrap();
    let mut buffer = AudioBuffer::new(2, 512);

    // Every block clips, so every block raises a warning
    for block in 0..20 {
        buffer.channel_mut(0).fill(2.0);
        buffer.channel_mut(1).fill(0.0);
        buffer.channel_mut(1)[..block + 1].fill(2.0);
        engine.process_block(&mut buffer);
    }

    assert!(engine.events_dropped() > 0);
    let events = engine.drain_events();
    assert_eq!(events.len(), 4);
    // The newest warning survives
    assert!(events.iter().any(|e| matches!(
        e,
        Event::SafetyWarning {
            clipped_samples: 532,
            non_finite_samples: 0,
            overload: true,
            ..
        }
    )));
}

#[test]
fn analysis_worker_finds_the_tone() {
    let engine = Arc::new(AudioEngine::new(PipelineConfig::default()).unwrap());
    engine.start_analysis().unwrap();

    let mut buffer = AudioBuffer::new(2, 512);
    let spectrum = wait_for(Duration::from_secs(5), || {
        for _ in 0..4 {
            let offset = engine.levels().blocks as usize * 512;
            fill_sine(&mut buffer, 1000.0, 0.5, offset);
            engine.process_block(&mut buffer);
        }
        engine.spectrum()
    })
    .expect("no spectrum produced");

    let loudest = spectrum
        .magnitudes
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| spectrum.frequencies[i])
        .unwrap();
    assert!(loudest > 700.0 && loudest < 1400.0, "peak band at {loudest} Hz");
    assert!(engine.spectrum_statistics().total_frames >= 1);

    engine.stop_analysis().unwrap();
    assert!(matches!(engine.stop_analysis(), Err(EngineError::NotRunning)));
    assert!(engine
        .drain_events()
        .iter()
        .any(|e| matches!(e, Event::SpectrumUpdate { .. })));
}

#[test]
fn dropping_engine_stops_worker() {
    let engine = AudioEngine::new(PipelineConfig::voice()).unwrap();
    engine.start_analysis().unwrap();
    let mut buffer = AudioBuffer::new(1, 256);
    fill_sine(&mut buffer, 300.0, 0.3, 0);
    engine.process_block(&mut buffer);
    drop(engine);
}

#[test]
fn engine_from_json() {
    let json = r#"{
        "stream": { "sample_rate": 44100, "channels": 1, "block_size": 256 },
        "equalizer": { "preset": "bass_boost" },
        "delay": { "delay_ms": 10.0, "feedback": 0.2, "mix": 0.3 },
        "spectrum": null
    }"#;
    let engine = AudioEngine::from_json_str(json).unwrap();
    let config = engine.config();
    assert_eq!(config.stream.sample_rate, 44100);
    assert_eq!(config.equalizer.bands[0].gain_db, 6.0);
    assert!(config.delay.is_some());
    assert!(matches!(
        engine.start_analysis(),
        Err(EngineError::AnalysisNotConfigured)
    ));

    let mut buffer = AudioBuffer::new(1, 256);
    fill_sine(&mut buffer, 100.0, 0.2, 0);
    let report = engine.process_block(&mut buffer);
    assert_eq!(report.frames, 256);

    assert!(AudioEngine::from_json_str(r#"{"stream": {"block_size": 1}}"#).is_err());
}
