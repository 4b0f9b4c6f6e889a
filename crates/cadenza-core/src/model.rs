use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_BPM: f64 = 120.0;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const DEFAULT_COUNT_IN_BARS: u32 = 1;
pub const DEFAULT_TRACK_VOLUME: f32 = 0.8;
pub const DEFAULT_MASTER_VOLUME: f32 = 1.0;
pub const DEFAULT_TRACK_PAN: f32 = 0.5;
pub const BEATS_PER_BAR: f64 = 4.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: Uuid,
    pub title: String,
    pub bpm: f64,
    pub sample_rate: u32,
    pub block_size: usize,
    pub count_in_bars: u32,
    pub metronome_enabled: bool,
    pub master: MasterSettings,
    pub tracks: Vec<Track>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    #[must_use]
    pub fn new(title: impl Into<String>, bpm: f64, sample_rate: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            bpm,
            sample_rate,
            block_size: DEFAULT_BLOCK_SIZE,
            count_in_bars: DEFAULT_COUNT_IN_BARS,
            metronome_enabled: true,
            master: MasterSettings::default(),
            tracks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.tracks.iter().map(|track| track.regions.len()).sum()
    }

    #[must_use]
    pub fn note_count(&self) -> usize {
        self.tracks
            .iter()
            .flat_map(|track| track.regions.iter())
            .map(Region::note_count)
            .sum()
    }

    /// Beat position of the last region end, 0.0 for an empty project.
    #[must_use]
    pub fn end_beat(&self) -> f64 {
        self.tracks
            .iter()
            .flat_map(|track| track.regions.iter())
            .map(Region::end_beat)
            .fold(0.0_f64, f64::max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    pub id: Uuid,
    pub name: String,
    pub kind: TrackKind,
    pub mixer: MixerSettings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<Region>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub automation: Vec<AutomationLane>,
}

impl Track {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            mixer: MixerSettings::default(),
            regions: Vec::new(),
            automation: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Midi,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixerSettings {
    /// Linear gain in [0, 1].
    pub volume: f32,
    /// 0 = full left, 0.5 = center, 1 = full right.
    pub pan: f32,
    pub eq: EqSettings,
    pub muted: bool,
    pub solo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_bus: Option<Uuid>,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            volume: DEFAULT_TRACK_VOLUME,
            pan: DEFAULT_TRACK_PAN,
            eq: EqSettings::default(),
            muted: false,
            solo: false,
            output_bus: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EqSettings {
    pub low_gain_db: f32,
    pub mid_gain_db: f32,
    pub high_gain_db: f32,
}

impl EqSettings {
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.low_gain_db.abs() <= f32::EPSILON
            && self.mid_gain_db.abs() <= f32::EPSILON
            && self.high_gain_db.abs() <= f32::EPSILON
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MasterSettings {
    pub volume: f32,
    pub eq: EqSettings,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            volume: DEFAULT_MASTER_VOLUME,
            eq: EqSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub id: Uuid,
    pub name: String,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub payload: RegionPayload,
}

impl Region {
    #[must_use]
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats.max(0.0)
    }

    #[must_use]
    pub fn note_count(&self) -> usize {
        match &self.payload {
            RegionPayload::Midi(midi) => midi.notes.len(),
            RegionPayload::Audio(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RegionPayload {
    Midi(MidiRegion),
    Audio(AudioRegion),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MidiRegion {
    /// Sorted by start beat; overlapping notes of the same pitch are legal
    /// and each produces an independent on/off pair.
    pub notes: Vec<MidiNote>,
}

impl MidiRegion {
    pub fn sort_notes(&mut self) {
        self.notes
            .sort_by(|left, right| left.start_beat.total_cmp(&right.start_beat));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MidiNote {
    pub pitch: u8,
    pub velocity: u8,
    /// Start beat relative to the owning region.
    pub start_beat: f64,
    pub duration_beats: f64,
}

impl MidiNote {
    #[must_use]
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioRegion {
    pub source_path: String,
    pub source_sample_rate: u32,
    pub source_channels: u16,
    pub source_duration_seconds: f64,
    pub trim_start_seconds: f64,
    pub gain_db: f32,
}

impl Default for AudioRegion {
    fn default() -> Self {
        Self {
            source_path: String::new(),
            source_sample_rate: DEFAULT_SAMPLE_RATE,
            source_channels: 2,
            source_duration_seconds: 0.0,
            trim_start_seconds: 0.0,
            gain_db: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationLane {
    pub parameter: AutomationParameter,
    /// Sorted ascending by beat; value between points is linearly
    /// interpolated, held flat before the first and after the last point.
    pub points: Vec<AutomationPoint>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutomationParameter {
    Volume,
    Pan,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AutomationPoint {
    pub beat: f64,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CycleRegion {
    pub start_beat: f64,
    pub end_beat: f64,
}

impl CycleRegion {
    #[must_use]
    pub fn length_beats(&self) -> f64 {
        (self.end_beat - self.start_beat).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_flat_and_unity() {
        assert!(EqSettings::default().is_flat());

        let master = MasterSettings::default();
        assert_eq!(master.volume, DEFAULT_MASTER_VOLUME);
        assert!(master.eq.is_flat());

        let mixer = MixerSettings::default();
        assert_eq!(mixer.volume, DEFAULT_TRACK_VOLUME);
        assert_eq!(mixer.pan, DEFAULT_TRACK_PAN);
    }
}
