use std::{
    path::Path,
    sync::{Arc, atomic::AtomicBool},
};

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    automation, export,
    live::{self, LiveHandle, LiveRenderer},
    meters::MeterBank,
    model::{
        AudioRegion, AutomationLane, CycleRegion, DEFAULT_BPM, DEFAULT_SAMPLE_RATE, EqSettings,
        MidiNote, MidiRegion, MixerSettings, Project, Region, RegionPayload, Track, TrackKind,
    },
    snapshot::RenderSnapshot,
    time::TempoMap,
    transport::{Transport, TransportCommand, TransportEvent},
};

const MIN_SAMPLE_RATE: u32 = 8_000;
const MAX_SAMPLE_RATE: u32 = 192_000;
const MAX_BLOCK_SIZE: usize = 8_192;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid tempo: {0}")]
    InvalidTempo(f64),
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
    #[error("invalid block size: {0}")]
    InvalidBlockSize(usize),
    #[error("invalid cycle region: start {start} must precede end {end}")]
    InvalidCycleRegion { start: f64, end: f64 },
    #[error("track not found: {0}")]
    TrackNotFound(Uuid),
    #[error("region not found: {0}")]
    RegionNotFound(Uuid),
    #[error("audio source missing: {0}")]
    MissingAudioFile(String),
    #[error("command queue full")]
    CommandQueueFull,
    #[error("no live session running")]
    SessionNotRunning,
    #[error("render cancelled")]
    RenderCancelled,
    #[error("render failed: {0}")]
    Render(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        // Cancellation travels through anyhow from the export path; keep
        // it distinguishable from a real I/O failure.
        match value.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => Self::Render(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTrackRequest {
    pub name: String,
    pub kind: TrackKind,
}

impl Default for AddTrackRequest {
    fn default() -> Self {
        Self {
            name: "Track".to_string(),
            kind: TrackKind::Midi,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMidiRegionRequest {
    pub track_id: Uuid,
    pub name: String,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub notes: Vec<MidiNote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddAudioRegionRequest {
    pub track_id: Uuid,
    pub name: String,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub audio: AudioRegion,
}

/// Partial mixer update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MixerPatch {
    pub volume: Option<f32>,
    pub pan: Option<f32>,
    pub muted: Option<bool>,
    pub solo: Option<bool>,
    pub eq: Option<EqSettings>,
    pub output_bus: Option<Option<Uuid>>,
}

struct LiveSession {
    handle: LiveHandle,
    events: Receiver<TransportEvent>,
}

/// Control-thread façade. Owns the project, validates every mutation, and
/// bridges edits to the audio thread through snapshot publication. The
/// application owns one `Engine` per open project; there is no global
/// instance.
pub struct Engine {
    project: Project,
    cycle: Option<CycleRegion>,
    session: Option<LiveSession>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Project::new("Untitled", DEFAULT_BPM, DEFAULT_SAMPLE_RATE))
    }
}

impl Engine {
    #[must_use]
    pub fn new(project: Project) -> Self {
        Self {
            project,
            cycle: None,
            session: None,
        }
    }

    #[must_use]
    pub fn project(&self) -> &Project {
        &self.project
    }

    #[must_use]
    pub fn cycle_region(&self) -> Option<CycleRegion> {
        self.cycle
    }

    /// Builds a fresh immutable render view of the current project.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RenderSnapshot> {
        RenderSnapshot::build(&self.project)
    }

    #[instrument(skip(self), fields(project_id = %self.project.id, bpm))]
    pub fn set_tempo(&mut self, bpm: f64) -> Result<(), EngineError> {
        TempoMap::new(bpm)?;
        self.project.bpm = bpm;
        self.project.touch();
        if let Some(session) = &mut self.session {
            session.handle.send_command(TransportCommand::SetTempo(bpm))?;
        }
        info!("tempo updated");
        Ok(())
    }

    /// Takes effect when the next render session starts; an active session
    /// keeps the block size it was created with.
    #[instrument(skip(self), fields(project_id = %self.project.id, block_size))]
    pub fn set_block_size(&mut self, block_size: usize) -> Result<(), EngineError> {
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(EngineError::InvalidBlockSize(block_size));
        }
        self.project.block_size = block_size;
        self.project.touch();
        info!("block size updated");
        Ok(())
    }

    #[instrument(skip(self), fields(project_id = %self.project.id, sample_rate))]
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), EngineError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(EngineError::InvalidSampleRate(sample_rate));
        }
        self.project.sample_rate = sample_rate;
        self.project.touch();
        if let Some(session) = &mut self.session {
            session
                .handle
                .send_command(TransportCommand::DeviceChange { sample_rate })?;
        }
        info!("sample rate updated");
        Ok(())
    }

    #[instrument(skip(self), fields(project_id = %self.project.id, bars))]
    pub fn set_count_in_bars(&mut self, bars: u32) {
        self.project.count_in_bars = bars;
        self.project.touch();
    }

    #[instrument(skip(self), fields(project_id = %self.project.id, enabled))]
    pub fn set_metronome_enabled(&mut self, enabled: bool) {
        self.project.metronome_enabled = enabled;
        self.project.touch();
    }

    #[instrument(skip(self), fields(project_id = %self.project.id, track_name = %request.name, track_kind = ?request.kind))]
    pub fn add_track(&mut self, request: AddTrackRequest) -> Track {
        let track = Track::new(request.name, request.kind);
        self.project.tracks.push(track.clone());
        self.project.touch();
        info!(track_id = %track.id, "track added");
        track
    }

    #[instrument(skip(self), fields(project_id = %self.project.id, track_id = %track_id))]
    pub fn remove_track(&mut self, track_id: Uuid) -> Result<(), EngineError> {
        let before = self.project.tracks.len();
        self.project.tracks.retain(|track| track.id != track_id);
        if self.project.tracks.len() == before {
            return Err(EngineError::TrackNotFound(track_id));
        }
        self.project.touch();
        info!("track removed");
        Ok(())
    }

    #[instrument(skip(self, request), fields(project_id = %self.project.id, track_id = %request.track_id, region_name = %request.name))]
    pub fn add_midi_region(&mut self, request: AddMidiRegionRequest) -> Result<Region, EngineError> {
        let track = self.track_mut(request.track_id)?;
        let mut midi = MidiRegion {
            notes: request.notes,
        };
        midi.sort_notes();
        let region = Region {
            id: Uuid::new_v4(),
            name: request.name,
            start_beat: request.start_beat.max(0.0),
            duration_beats: request.duration_beats.max(0.0),
            payload: RegionPayload::Midi(midi),
        };
        track.regions.push(region.clone());
        self.project.touch();
        info!(region_id = %region.id, notes = region.note_count(), "midi region added");
        Ok(region)
    }

    #[instrument(skip(self, request), fields(project_id = %self.project.id, track_id = %request.track_id, source = %request.audio.source_path))]
    pub fn add_audio_region(
        &mut self,
        request: AddAudioRegionRequest,
    ) -> Result<Region, EngineError> {
        if !Path::new(&request.audio.source_path).exists() {
            return Err(EngineError::MissingAudioFile(request.audio.source_path));
        }
        let track = self.track_mut(request.track_id)?;
        let region = Region {
            id: Uuid::new_v4(),
            name: request.name,
            start_beat: request.start_beat.max(0.0),
            duration_beats: request.duration_beats.max(0.0),
            payload: RegionPayload::Audio(request.audio),
        };
        track.regions.push(region.clone());
        self.project.touch();
        info!(region_id = %region.id, "audio region added");
        Ok(region)
    }

    #[instrument(skip(self), fields(project_id = %self.project.id, track_id = %track_id, region_id = %region_id))]
    pub fn remove_region(&mut self, track_id: Uuid, region_id: Uuid) -> Result<(), EngineError> {
        let track = self.track_mut(track_id)?;
        let before = track.regions.len();
        track.regions.retain(|region| region.id != region_id);
        if track.regions.len() == before {
            return Err(EngineError::RegionNotFound(region_id));
        }
        self.project.touch();
        info!("region removed");
        Ok(())
    }

    #[instrument(skip(self, lane), fields(project_id = %self.project.id, track_id = %track_id, parameter = ?lane.parameter))]
    pub fn add_automation_lane(
        &mut self,
        track_id: Uuid,
        lane: AutomationLane,
    ) -> Result<(), EngineError> {
        let track = self.track_mut(track_id)?;
        let points = automation::sanitize_points(lane.points);
        // One lane per parameter; a new lane for the same parameter
        // replaces the old one.
        track
            .automation
            .retain(|existing| existing.parameter != lane.parameter);
        track.automation.push(AutomationLane {
            parameter: lane.parameter,
            points,
        });
        self.project.touch();
        info!("automation lane set");
        Ok(())
    }

    #[instrument(skip(self, patch), fields(project_id = %self.project.id, track_id = %track_id))]
    pub fn patch_mixer(
        &mut self,
        track_id: Uuid,
        patch: MixerPatch,
    ) -> Result<MixerSettings, EngineError> {
        let track = self.track_mut(track_id)?;
        if let Some(volume) = patch.volume {
            track.mixer.volume = volume.clamp(0.0, 1.0);
        }
        if let Some(pan) = patch.pan {
            track.mixer.pan = pan.clamp(0.0, 1.0);
        }
        if let Some(muted) = patch.muted {
            track.mixer.muted = muted;
        }
        if let Some(solo) = patch.solo {
            track.mixer.solo = solo;
        }
        if let Some(eq) = patch.eq {
            track.mixer.eq = eq;
        }
        if let Some(output_bus) = patch.output_bus {
            track.mixer.output_bus = output_bus;
        }
        let mixer = track.mixer.clone();
        self.project.touch();
        info!(
            volume = mixer.volume,
            pan = mixer.pan,
            muted = mixer.muted,
            solo = mixer.solo,
            "mixer patched"
        );
        Ok(mixer)
    }

    #[instrument(skip(self), fields(project_id = %self.project.id))]
    pub fn set_cycle_region(&mut self, region: Option<CycleRegion>) -> Result<(), EngineError> {
        if let Some(cycle) = region
            && cycle.end_beat <= cycle.start_beat
        {
            return Err(EngineError::InvalidCycleRegion {
                start: cycle.start_beat,
                end: cycle.end_beat,
            });
        }
        self.cycle = region;
        if let Some(session) = &mut self.session {
            session
                .handle
                .send_command(TransportCommand::SetCycle(region))?;
        }
        info!("cycle region updated");
        Ok(())
    }

    /// Starts a live render session and returns the audio-thread half for
    /// the host's device callback. The engine keeps the control half.
    #[instrument(skip(self), fields(project_id = %self.project.id))]
    pub fn start_live_session(&mut self) -> Result<LiveRenderer, EngineError> {
        let tempo = TempoMap::new(self.project.bpm)?;
        let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY);
        let transport = Transport::new(
            tempo,
            self.project.sample_rate,
            self.project.count_in_bars,
            Some(event_tx),
        );
        let snapshot = self.snapshot();
        let (mut handle, renderer) =
            live::live_session(snapshot, transport, self.project.block_size);
        if let Some(cycle) = self.cycle {
            handle.send_command(TransportCommand::SetCycle(Some(cycle)))?;
        }
        self.session = Some(LiveSession {
            handle,
            events: event_rx,
        });
        info!(block_size = self.project.block_size, "live session started");
        Ok(renderer)
    }

    pub fn stop_live_session(&mut self) {
        if self.session.take().is_some() {
            debug!("live session released");
        }
    }

    /// Queues a transport command for the running session.
    pub fn send_transport(&mut self, command: TransportCommand) -> Result<(), EngineError> {
        let session = self
            .session
            .as_mut()
            .ok_or(EngineError::SessionNotRunning)?;
        session.handle.send_command(command)
    }

    /// Publishes the current project state to the running session. Edits
    /// become audible at the audio thread's next block boundary; retired
    /// snapshots are reclaimed here on the control thread.
    #[instrument(skip(self), fields(project_id = %self.project.id))]
    pub fn commit(&mut self) -> Result<(), EngineError> {
        let snapshot = RenderSnapshot::build(&self.project);
        let session = self
            .session
            .as_mut()
            .ok_or(EngineError::SessionNotRunning)?;
        session.handle.publish_snapshot(snapshot)?;
        let reclaimed = session.handle.reclaim_retired();
        if reclaimed > 0 {
            debug!(reclaimed, "retired snapshots reclaimed");
        }
        Ok(())
    }

    #[must_use]
    pub fn transport_events(&self) -> Option<&Receiver<TransportEvent>> {
        self.session.as_ref().map(|session| &session.events)
    }

    #[must_use]
    pub fn meters(&self) -> Option<&Arc<MeterBank>> {
        self.session.as_ref().map(|session| session.handle.meters())
    }

    /// Offline WAV mixdown with copy-on-start semantics: the export works
    /// from a snapshot taken here, so edits made while it runs do not
    /// affect the output. The running transport is untouched either way.
    #[instrument(skip(self, cancel), fields(project_id = %self.project.id, path = %path.display()))]
    pub fn export_wav(
        &self,
        path: &Path,
        cancel: Option<&AtomicBool>,
    ) -> Result<export::ExportReport, EngineError> {
        let snapshot = self.snapshot();
        let report = export::export_wav(&snapshot, self.project.block_size, path, cancel)?;
        Ok(report)
    }

    fn track_mut(&mut self, track_id: Uuid) -> Result<&mut Track, EngineError> {
        self.project
            .tracks
            .iter_mut()
            .find(|track| track.id == track_id)
            .ok_or(EngineError::TrackNotFound(track_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AutomationPoint;

    fn engine_with_track() -> (Engine, Uuid) {
        let mut engine = Engine::default();
        let track = engine.add_track(AddTrackRequest::default());
        (engine, track.id)
    }

    #[test]
    fn invalid_tempo_is_rejected_and_project_untouched() {
        let mut engine = Engine::default();
        engine
            .set_tempo(0.0)
            .expect_err("zero tempo should be rejected");
        engine
            .set_tempo(f64::INFINITY)
            .expect_err("infinite tempo should be rejected");
        assert!((engine.project().bpm - DEFAULT_BPM).abs() < f64::EPSILON);

        engine.set_tempo(90.0).expect("valid tempo should apply");
        assert!((engine.project().bpm - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sample_rate_and_block_size_are_validated() {
        let mut engine = Engine::default();
        engine
            .set_sample_rate(100)
            .expect_err("tiny sample rate should be rejected");
        engine
            .set_block_size(0)
            .expect_err("zero block size should be rejected");
        engine
            .set_block_size(1_000_000)
            .expect_err("oversized block should be rejected");
        engine.set_block_size(256).expect("valid block should apply");
        assert_eq!(engine.project().block_size, 256);
    }

    #[test]
    fn mixer_patch_requires_an_existing_track() {
        let (mut engine, track_id) = engine_with_track();
        let mixer = engine
            .patch_mixer(
                track_id,
                MixerPatch {
                    volume: Some(2.0),
                    pan: Some(1.0),
                    ..MixerPatch::default()
                },
            )
            .expect("patch should apply");
        assert_eq!(mixer.volume, 1.0, "volume clamps to unity");
        assert_eq!(mixer.pan, 1.0);

        let missing = Uuid::new_v4();
        assert!(matches!(
            engine.patch_mixer(missing, MixerPatch::default()),
            Err(EngineError::TrackNotFound(id)) if id == missing
        ));
    }

    #[test]
    fn invalid_cycle_region_is_rejected() {
        let mut engine = Engine::default();
        let result = engine.set_cycle_region(Some(CycleRegion {
            start_beat: 8.0,
            end_beat: 4.0,
        }));
        assert!(matches!(
            result,
            Err(EngineError::InvalidCycleRegion { .. })
        ));
        assert!(engine.cycle_region().is_none());
    }

    #[test]
    fn audio_region_requires_an_existing_source() {
        let (mut engine, track_id) = engine_with_track();
        let result = engine.add_audio_region(AddAudioRegionRequest {
            track_id,
            name: "missing".to_string(),
            start_beat: 0.0,
            duration_beats: 4.0,
            audio: AudioRegion {
                source_path: "/definitely/not/here.wav".to_string(),
                ..AudioRegion::default()
            },
        });
        assert!(matches!(result, Err(EngineError::MissingAudioFile(_))));
    }

    #[test]
    fn automation_lane_replaces_same_parameter() {
        let (mut engine, track_id) = engine_with_track();
        let lane = |value: f32| AutomationLane {
            parameter: crate::model::AutomationParameter::Volume,
            points: vec![AutomationPoint { beat: 0.0, value }],
        };
        engine
            .add_automation_lane(track_id, lane(0.2))
            .expect("lane should apply");
        engine
            .add_automation_lane(track_id, lane(0.9))
            .expect("replacement should apply");
        let track = &engine.project().tracks[0];
        assert_eq!(track.automation.len(), 1);
        assert_eq!(track.automation[0].points[0].value, 0.9);
    }

    #[test]
    fn transport_commands_require_a_session() {
        let mut engine = Engine::default();
        assert!(matches!(
            engine.send_transport(TransportCommand::Play),
            Err(EngineError::SessionNotRunning)
        ));

        let _renderer = engine
            .start_live_session()
            .expect("session should start");
        engine
            .send_transport(TransportCommand::Play)
            .expect("command should queue");
        engine.commit().expect("commit should publish");
    }
}
