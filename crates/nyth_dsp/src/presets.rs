//! Built-in EQ Presets
//!
//! Gains are given for the standard 10-band layout. Equalizers with a
//! different band count pick the nearest preset band for each of theirs.

/// Named EQ preset with 10 band gains (dB)
pub type Preset = (&'static str, [f32; 10]);

/// List of built-in presets
pub const PRESETS: &[Preset] = &[
    ("flat", [0.0; 10]),
    ("rock", [4.0, 3.0, -1.0, -2.0, -1.0, 2.0, 3.0, 4.0, 3.0, 2.0]),
    ("pop", [-1.0, 2.0, 4.0, 3.0, 0.0, -1.0, -1.0, 0.0, 2.0, 3.0]),
    ("jazz", [0.0, 2.0, 1.0, 2.0, -2.0, -2.0, 0.0, 1.0, 2.0, 3.0]),
    ("classical", [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -2.0, -2.0, -2.0, -3.0]),
    ("electronic", [4.0, 3.0, 1.0, 0.0, -2.0, 2.0, 1.0, 1.0, 3.0, 4.0]),
    ("vocal_boost", [-2.0, -1.0, 0.0, 2.0, 4.0, 4.0, 3.0, 2.0, 0.0, -1.0]),
    ("bass_boost", [6.0, 5.0, 4.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
    ("treble_boost", [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 4.0, 5.0, 6.0]),
    ("loudness", [5.0, 3.0, 0.0, -1.0, -2.0, -2.0, -1.0, 0.0, 3.0, 5.0]),
];

/// Look up a preset by name, ignoring case and treating `-`/space as `_`
pub fn find_preset(name: &str) -> Option<&'static Preset> {
    let wanted: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    PRESETS.iter().find(|(preset, _)| *preset == wanted)
}

/// Names of all built-in presets, in display order
pub fn preset_names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|(name, _)| *name)
}

/// Gain for `band` of an EQ with `num_bands` bands
pub fn preset_gain(preset: &Preset, band: usize, num_bands: usize) -> f32 {
    let gains = &preset.1;
    if num_bands <= 1 {
        return gains[0];
    }
    let last = gains.len() - 1;
    let index = ((band as f32 * last as f32) / (num_bands - 1) as f32).round() as usize;
    gains[index.min(last)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_preset_normalizes_name() {
        assert_eq!(find_preset("Vocal-Boost").map(|p| p.0), Some("vocal_boost"));
        assert_eq!(find_preset("BASS BOOST").map(|p| p.0), Some("bass_boost"));
        assert!(find_preset("nonexistent").is_none());
    }

    #[test]
    fn test_all_presets_within_gain_range() {
        for (name, gains) in PRESETS {
            for gain in gains {
                assert!(gain.abs() <= 24.0, "{name} out of range");
            }
        }
        assert_eq!(preset_names().count(), 10);
    }

    #[test]
    fn test_preset_gain_resampling() {
        let rock = find_preset("rock").unwrap();
        // Identity for 10 bands
        for band in 0..10 {
            assert_eq!(preset_gain(rock, band, 10), rock.1[band]);
        }
        // Endpoints preserved for other counts
        assert_eq!(preset_gain(rock, 0, 5), rock.1[0]);
        assert_eq!(preset_gain(rock, 4, 5), rock.1[9]);
    }
}
