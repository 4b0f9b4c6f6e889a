use serde::{Deserialize, Serialize};

use crate::{engine::EngineError, model::BEATS_PER_BAR};

/// Relates musical time (beats) to wall time (seconds) and sample frames.
///
/// The map carries a single mutable tempo. When the tempo changes
/// mid-playback, future scheduling uses the new tempo from the next block;
/// events already emitted in absolute-sample terms for the current block
/// are not rewritten.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TempoMap {
    bpm: f64,
}

impl Default for TempoMap {
    fn default() -> Self {
        Self {
            bpm: crate::model::DEFAULT_BPM,
        }
    }
}

impl TempoMap {
    /// Builds a tempo map, rejecting a non-positive or non-finite tempo.
    pub fn new(bpm: f64) -> Result<Self, EngineError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(EngineError::InvalidTempo(bpm));
        }
        Ok(Self { bpm })
    }

    #[must_use]
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Updates the tempo; an invalid tempo is rejected and the previous
    /// value retained.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<(), EngineError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(EngineError::InvalidTempo(bpm));
        }
        self.bpm = bpm;
        Ok(())
    }

    #[must_use]
    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.bpm
    }

    #[must_use]
    pub fn beats_to_seconds(&self, beats: f64) -> f64 {
        beats * self.seconds_per_beat()
    }

    #[must_use]
    pub fn seconds_to_beats(&self, seconds: f64) -> f64 {
        seconds / self.seconds_per_beat()
    }

    #[must_use]
    pub fn beats_to_samples(&self, beats: f64, sample_rate: u32) -> f64 {
        self.beats_to_seconds(beats) * f64::from(sample_rate)
    }

    #[must_use]
    pub fn samples_to_beats(&self, samples: f64, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.seconds_to_beats(samples / f64::from(sample_rate))
    }
}

/// Formats a beat position as a 1-indexed `bar.beat.ticks` display string
/// for UI consumption, assuming 4 beats per bar.
#[must_use]
pub fn musical_time_string(beat: f64) -> String {
    let beat = beat.max(0.0);
    let bar = (beat / BEATS_PER_BAR).floor();
    let beat_in_bar = beat - bar * BEATS_PER_BAR;
    let ticks = (beat_in_bar.fract() * 480.0).floor();
    format!(
        "{}.{}.{:03}",
        bar as u64 + 1,
        beat_in_bar.floor() as u64 + 1,
        ticks as u64
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_second_round_trip_is_stable() {
        let tempo = TempoMap::new(128.0).expect("valid tempo should build");
        let beats = 17.25;
        let seconds = tempo.beats_to_seconds(beats);
        let restored = tempo.seconds_to_beats(seconds);
        assert!((beats - restored).abs() < 1e-9);
    }

    #[test]
    fn sample_conversion_matches_tempo() {
        let tempo = TempoMap::new(120.0).expect("valid tempo should build");
        // 120 bpm: one beat is half a second.
        assert!((tempo.beats_to_samples(2.0, 48_000) - 48_000.0).abs() < 1e-6);
        assert!((tempo.samples_to_beats(24_000.0, 48_000) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_tempo_is_rejected_and_previous_value_retained() {
        let mut tempo = TempoMap::new(90.0).expect("valid tempo should build");
        tempo
            .set_bpm(0.0)
            .expect_err("zero tempo should be rejected");
        tempo
            .set_bpm(-4.0)
            .expect_err("negative tempo should be rejected");
        tempo
            .set_bpm(f64::NAN)
            .expect_err("nan tempo should be rejected");
        assert!((tempo.bpm() - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn musical_time_is_one_indexed() {
        assert_eq!(musical_time_string(0.0), "1.1.000");
        assert_eq!(musical_time_string(4.0), "2.1.000");
        assert_eq!(musical_time_string(5.5), "2.2.240");
    }
}
