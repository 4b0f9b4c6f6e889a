use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    AutomationLane, AutomationParameter, AutomationPoint, DEFAULT_SAMPLE_RATE, MidiNote,
    MidiRegion, Project, Region, RegionPayload, Track, TrackKind,
};

fn fixed_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z")
        .expect("fixture timestamp should be valid")
        .with_timezone(&Utc)
}

/// Eight ascending C-major scale notes at 120 bpm, two beats apart, with
/// varied velocities. Renders to a bit more than eight seconds of
/// non-silent stereo output; the parity baseline is built from it.
#[must_use]
pub fn scale_project() -> Project {
    let mut project = Project::new("Cadenza Scale Demo", 120.0, DEFAULT_SAMPLE_RATE);
    project.id = Uuid::parse_str("4c2f75a9-8e6b-41d3-9a44-0f1c52b7ad6e")
        .expect("fixture project id should be valid");
    project.created_at = fixed_timestamp();
    project.updated_at = fixed_timestamp();

    let mut track = Track::new("Scale", TrackKind::Midi);
    track.id = Uuid::parse_str("7d9e1c40-23aa-49f2-8b31-6d5c04e9f815")
        .expect("fixture track id should be valid");

    let pitches: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];
    let velocities: [u8; 8] = [80, 85, 90, 95, 100, 105, 110, 115];
    let notes = pitches
        .iter()
        .zip(velocities.iter())
        .enumerate()
        .map(|(index, (&pitch, &velocity))| MidiNote {
            pitch,
            velocity,
            start_beat: index as f64 * 2.0,
            duration_beats: 1.5,
        })
        .collect();

    track.regions.push(Region {
        id: Uuid::parse_str("f3b8d2e1-57c6-4a0f-9e72-81a4c6d0b392")
            .expect("fixture region id should be valid"),
        name: "C major ascent".to_string(),
        start_beat: 0.0,
        duration_beats: 16.0,
        payload: RegionPayload::Midi(MidiRegion { notes }),
    });

    project.tracks.push(track);
    project
}

/// A sustained note under a 0 → 1 volume automation ramp; the rendered
/// RMS rises monotonically across the ramp.
#[must_use]
pub fn fade_project() -> Project {
    let mut project = Project::new("Cadenza Fade Demo", 120.0, DEFAULT_SAMPLE_RATE);
    project.id = Uuid::parse_str("b61a0e37-94d5-4c88-a2f0-3e7d16c85b49")
        .expect("fixture project id should be valid");
    project.created_at = fixed_timestamp();
    project.updated_at = fixed_timestamp();

    let mut track = Track::new("Pad", TrackKind::Midi);
    track.id = Uuid::parse_str("0a84f6d2-c1e9-4b57-8d30-52b9e71fa4c3")
        .expect("fixture track id should be valid");
    track.regions.push(Region {
        id: Uuid::parse_str("9c57e3a8-6f02-4d1b-b8e4-17d0a92c65f8")
            .expect("fixture region id should be valid"),
        name: "Drone".to_string(),
        start_beat: 0.0,
        duration_beats: 8.0,
        payload: RegionPayload::Midi(MidiRegion {
            notes: vec![MidiNote {
                pitch: 57,
                velocity: 110,
                start_beat: 0.0,
                duration_beats: 8.0,
            }],
        }),
    });
    track.automation.push(AutomationLane {
        parameter: AutomationParameter::Volume,
        points: vec![
            AutomationPoint {
                beat: 0.0,
                value: 0.0,
            },
            AutomationPoint {
                beat: 8.0,
                value: 1.0,
            },
        ],
    });

    project.tracks.push(track);
    project
}
