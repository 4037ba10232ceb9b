//! Lock-free level metering shared between the audio and control threads

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Output levels of the most recent block
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Levels {
    pub rms: f32,
    pub peak: f32,
    /// Highest peak since the meter was last cleared
    pub peak_hold: f32,
    pub blocks: u64,
}

/// Meter written by the audio thread, read from anywhere
///
/// AtomicF32 doesn't exist, so levels are stored as f32 bits.
#[derive(Debug)]
pub struct LevelMeter {
    rms_bits: AtomicU32,
    peak_bits: AtomicU32,
    peak_hold_bits: AtomicU32,
    blocks: AtomicU64,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            rms_bits: AtomicU32::new(0.0_f32.to_bits()),
            peak_bits: AtomicU32::new(0.0_f32.to_bits()),
            peak_hold_bits: AtomicU32::new(0.0_f32.to_bits()),
            blocks: AtomicU64::new(0),
        }
    }

    /// Publish one block's levels
    ///
    /// Only the audio thread writes, so the hold update needs no CAS loop.
    pub fn update(&self, rms: f32, peak: f32) {
        self.rms_bits.store(rms.to_bits(), Ordering::Relaxed);
        self.peak_bits.store(peak.to_bits(), Ordering::Relaxed);
        let hold = f32::from_bits(self.peak_hold_bits.load(Ordering::Relaxed));
        if peak > hold {
            self.peak_hold_bits.store(peak.to_bits(), Ordering::Relaxed);
        }
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn levels(&self) -> Levels {
        Levels {
            rms: f32::from_bits(self.rms_bits.load(Ordering::Relaxed)),
            peak: f32::from_bits(self.peak_bits.load(Ordering::Relaxed)),
            peak_hold: f32::from_bits(self.peak_hold_bits.load(Ordering::Relaxed)),
            blocks: self.blocks.load(Ordering::Relaxed),
        }
    }

    /// Reset the peak hold
    pub fn clear_hold(&self) {
        self.peak_hold_bits.store(0.0_f32.to_bits(), Ordering::Relaxed);
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_starts_silent() {
        let meter = LevelMeter::new();
        assert_eq!(meter.levels(), Levels::default());
    }

    #[test]
    fn test_peak_hold() {
        let meter = LevelMeter::new();
        meter.update(0.2, 0.8);
        meter.update(0.1, 0.3);
        let levels = meter.levels();
        assert_eq!(levels.rms, 0.1);
        assert_eq!(levels.peak, 0.3);
        assert_eq!(levels.peak_hold, 0.8);
        assert_eq!(levels.blocks, 2);

        meter.clear_hold();
        assert_eq!(meter.levels().peak_hold, 0.0);
    }
}
