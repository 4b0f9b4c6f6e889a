use std::{collections::HashMap, path::Path, sync::Arc};

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    assets::{self, DecodedAudio},
    automation,
    mixer::db_to_linear,
    model::{
        AutomationLane, EqSettings, MasterSettings, Project, Region, RegionPayload, Track,
        TrackKind,
    },
};

/// A note flattened to absolute project beats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteSpan {
    pub pitch: u8,
    pub velocity: u8,
    pub start_beat: f64,
    pub end_beat: f64,
}

/// An audio region resolved against its decoded source.
#[derive(Debug, Clone)]
pub struct AudioSpan {
    pub start_beat: f64,
    pub end_beat: f64,
    pub trim_start_seconds: f64,
    /// Linear gain from the region's `gain_db`.
    pub gain: f32,
    pub source: Arc<DecodedAudio>,
}

#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    pub name: String,
    pub kind: TrackKind,
    pub volume: f32,
    pub pan: f32,
    pub muted: bool,
    pub solo: bool,
    pub eq: EqSettings,
    /// Sorted by absolute start beat; scheduling relies on the order.
    pub notes: Vec<NoteSpan>,
    pub clips: Vec<AudioSpan>,
    pub automation: Vec<AutomationLane>,
}

impl TrackSnapshot {
    #[cfg(test)]
    #[must_use]
    pub fn midi_for_test(notes: Vec<NoteSpan>) -> Self {
        Self {
            name: "test".to_string(),
            kind: TrackKind::Midi,
            volume: 0.8,
            pan: 0.5,
            muted: false,
            solo: false,
            eq: EqSettings::default(),
            notes,
            clips: Vec::new(),
            automation: Vec::new(),
        }
    }
}

/// Immutable, read-only view of a project for one or more render passes.
///
/// Built on the control thread and shared as `Arc`; the render pipeline
/// never mutates project data. The live driver swaps snapshots only at
/// block boundaries, and an offline render keeps the `Arc` it started
/// with, so concurrent edits never affect an in-flight pass.
#[derive(Debug, Clone)]
pub struct RenderSnapshot {
    pub project_id: Uuid,
    pub bpm: f64,
    pub sample_rate: u32,
    pub end_beat: f64,
    pub metronome_enabled: bool,
    pub count_in_bars: u32,
    pub master: MasterSettings,
    pub tracks: Vec<TrackSnapshot>,
}

impl RenderSnapshot {
    #[must_use]
    pub fn empty(bpm: f64, sample_rate: u32) -> Self {
        Self {
            project_id: Uuid::nil(),
            bpm,
            sample_rate,
            end_beat: 0.0,
            metronome_enabled: true,
            count_in_bars: 1,
            master: MasterSettings::default(),
            tracks: Vec::new(),
        }
    }

    #[instrument(skip(project), fields(project_id = %project.id))]
    #[must_use]
    pub fn build(project: &Project) -> Arc<Self> {
        let mut source_cache: HashMap<String, Arc<DecodedAudio>> = HashMap::new();
        let tracks = project
            .tracks
            .iter()
            .map(|track| build_track(project, track, &mut source_cache))
            .collect();

        let snapshot = Self {
            project_id: project.id,
            bpm: project.bpm,
            sample_rate: project.sample_rate,
            end_beat: project.end_beat(),
            metronome_enabled: project.metronome_enabled,
            count_in_bars: project.count_in_bars,
            master: project.master.clone(),
            tracks,
        };
        debug!(
            tracks = snapshot.tracks.len(),
            end_beat = snapshot.end_beat,
            "render snapshot built"
        );
        Arc::new(snapshot)
    }

    #[must_use]
    pub fn any_solo(&self) -> bool {
        self.tracks.iter().any(|track| track.solo)
    }
}

fn build_track(
    project: &Project,
    track: &Track,
    source_cache: &mut HashMap<String, Arc<DecodedAudio>>,
) -> TrackSnapshot {
    // A track routed to a missing bus falls back to the master bus; every
    // track here sums into master, so the fallback is purely a warning.
    if let Some(bus_id) = track.mixer.output_bus
        && !project.tracks.iter().any(|other| other.id == bus_id)
    {
        warn!(
            track = %track.name,
            bus = %bus_id,
            "output bus not found, falling back to master"
        );
    }

    let mut notes = Vec::new();
    let mut clips = Vec::new();
    for region in &track.regions {
        match &region.payload {
            RegionPayload::Midi(midi) => collect_notes(track, region, &midi.notes, &mut notes),
            RegionPayload::Audio(audio) => {
                let source = match source_cache.entry(audio.source_path.clone()) {
                    std::collections::hash_map::Entry::Occupied(entry) => {
                        Some(Arc::clone(entry.get()))
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        match assets::decode_region_source(Path::new(&audio.source_path)) {
                            Ok(decoded) => Some(Arc::clone(entry.insert(Arc::new(decoded)))),
                            Err(error) => {
                                warn!(
                                    track = %track.name,
                                    source = %audio.source_path,
                                    %error,
                                    "audio source unavailable, region renders silent"
                                );
                                None
                            }
                        }
                    }
                };
                if let Some(source) = source {
                    clips.push(AudioSpan {
                        start_beat: region.start_beat,
                        end_beat: region.end_beat(),
                        trim_start_seconds: audio.trim_start_seconds.max(0.0),
                        gain: db_to_linear(audio.gain_db),
                        source,
                    });
                }
            }
        }
    }
    notes.sort_by(|left, right| left.start_beat.total_cmp(&right.start_beat));

    TrackSnapshot {
        name: track.name.clone(),
        kind: track.kind,
        volume: track.mixer.volume.clamp(0.0, 1.0),
        pan: track.mixer.pan.clamp(0.0, 1.0),
        muted: track.mixer.muted,
        solo: track.mixer.solo,
        eq: track.mixer.eq,
        notes,
        clips,
        automation: track
            .automation
            .iter()
            .map(|lane| AutomationLane {
                parameter: lane.parameter,
                points: automation::sanitize_points(lane.points.clone()),
            })
            .collect(),
    }
}

fn collect_notes(
    track: &Track,
    region: &Region,
    notes: &[crate::model::MidiNote],
    out: &mut Vec<NoteSpan>,
) {
    for note in notes {
        let start_beat = region.start_beat + note.start_beat;
        let end_beat = (start_beat + note.duration_beats).min(region.end_beat());
        if end_beat <= start_beat || note.start_beat >= region.duration_beats {
            warn!(
                track = %track.name,
                pitch = note.pitch,
                "skipping zero-length or out-of-region note"
            );
            continue;
        }
        out.push(NoteSpan {
            pitch: note.pitch.min(127),
            velocity: note.velocity.min(127),
            start_beat,
            end_beat,
        });
    }
}
