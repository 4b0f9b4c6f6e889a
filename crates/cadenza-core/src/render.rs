use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    automation,
    engine::EngineError,
    meters::LevelFrame,
    mixer::{Eq3Band, MasterChain, resolve_track_gain},
    model::{BEATS_PER_BAR, EqSettings},
    scheduler::{MAX_BLOCK_EVENTS, MidiEvent, MidiEventKind, MidiScheduler},
    snapshot::RenderSnapshot,
    time::TempoMap,
    transport::{BlockAdvance, Transport, TransportCommand, TransportState},
};

/// Upper bound on simultaneously rendered tracks; buffers and meter slots
/// are sized once so the audio thread never allocates.
pub const MAX_RENDER_TRACKS: usize = 64;
const MAX_VOICES: usize = 64;
/// Velocity-full-scale note amplitude, shared by both drivers.
const NOTE_AMPLITUDE: f32 = 0.18;
/// Silence appended after the last region so releases ring out.
pub const RELEASE_TAIL_SECONDS: f64 = 1.0;

const CLICK_SECONDS: f32 = 0.05;
const CLICK_ACCENT_HZ: f32 = 880.0;
const CLICK_TICK_HZ: f32 = 660.0;
const CLICK_ACCENT_AMP: f32 = 0.5;
const CLICK_TICK_AMP: f32 = 0.35;

#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    active: bool,
    track_index: u32,
    pitch: u8,
    phase: u32,
    phase_inc: u32,
    amplitude: f32,
    /// Render window within the current block.
    start_offset: u32,
    end_offset: u32,
    /// Closed by a NoteOff this block; retired after rendering.
    closing: bool,
    started_seq: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClickVoice {
    remaining: u32,
    phase: f32,
    phase_inc: f32,
    amplitude: f32,
}

/// Per-block levels and fault counts produced by the renderer; the live
/// driver copies these into atomics, the offline driver aggregates them.
#[derive(Debug, Clone)]
pub struct RenderStats {
    pub master: LevelFrame,
    pub tracks: Vec<LevelFrame>,
    pub voices_starved: u32,
}

impl RenderStats {
    fn new() -> Self {
        Self {
            master: LevelFrame::default(),
            tracks: vec![LevelFrame::default(); MAX_RENDER_TRACKS],
            voices_starved: 0,
        }
    }

    fn clear(&mut self) {
        self.master = LevelFrame::default();
        for track in &mut self.tracks {
            *track = LevelFrame::default();
        }
        self.voices_starved = 0;
    }
}

/// The single "render one block" operation both drivers share. The live
/// callback and the offline loop drive the same state through the same
/// code so identical input yields identical logical output.
///
/// All buffers are sized at construction; `process_block` performs no heap
/// allocation, locking, or logging.
pub struct BlockRenderer {
    block_size: usize,
    sample_rate: u32,
    rate_changed: bool,
    scratch: Vec<f32>,
    mix: Vec<f32>,
    events: Vec<MidiEvent>,
    flush_events: Vec<MidiEvent>,
    scheduler: MidiScheduler,
    voices: Vec<Voice>,
    voice_seq: u64,
    track_eq: Vec<Eq3Band>,
    master: MasterChain,
    click: ClickVoice,
    stats: RenderStats,
}

impl BlockRenderer {
    #[must_use]
    pub fn new(snapshot: &RenderSnapshot, block_size: usize) -> Self {
        let sample_rate = snapshot.sample_rate;
        let mut renderer = Self {
            block_size,
            sample_rate,
            rate_changed: false,
            scratch: vec![0.0; block_size],
            mix: vec![0.0; block_size * 2],
            events: Vec::with_capacity(MAX_BLOCK_EVENTS),
            flush_events: Vec::with_capacity(MAX_BLOCK_EVENTS),
            scheduler: MidiScheduler::new(),
            voices: vec![Voice::default(); MAX_VOICES],
            voice_seq: 0,
            track_eq: vec![
                Eq3Band::new(EqSettings::default(), sample_rate);
                MAX_RENDER_TRACKS
            ],
            master: MasterChain::new(1.0, EqSettings::default(), sample_rate),
            click: ClickVoice::default(),
            stats: RenderStats::new(),
        };
        renderer.bind_snapshot(snapshot);
        renderer
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    #[must_use]
    pub fn active_note_count(&self) -> usize {
        self.scheduler.active_note_count()
    }

    /// Rebinds snapshot-derived filter state in place (no allocation);
    /// called at block boundaries when the live driver swaps snapshots.
    pub fn bind_snapshot(&mut self, snapshot: &RenderSnapshot) {
        for (slot, track) in self.track_eq.iter_mut().zip(snapshot.tracks.iter()) {
            *slot = Eq3Band::new(track.eq, self.sample_rate);
        }
        self.master = MasterChain::new(snapshot.master.volume, snapshot.master.eq, self.sample_rate);
    }

    /// Silences every sounding note immediately: the scheduler's active
    /// set is flushed and the voice pool cleared. Invoked before state
    /// changes (pause/stop/seek/device change) and at the loop seam.
    pub fn flush_voices(&mut self) {
        self.scheduler.flush(&mut self.flush_events);
        for voice in &mut self.voices {
            voice.active = false;
        }
        self.click = ClickVoice::default();
    }

    /// Applies a transport command at a block boundary, flushing sounding
    /// notes first where the command demands it.
    pub fn apply_command(&mut self, transport: &mut Transport, command: TransportCommand) {
        if transport.requires_flush(&command) {
            self.flush_voices();
        }
        if let TransportCommand::DeviceChange { sample_rate } = command
            && sample_rate != self.sample_rate
        {
            // Filter coefficients and oscillator increments depend on the
            // rate; the pipeline re-initializes at the next block.
            self.sample_rate = sample_rate;
            self.rate_changed = true;
        }
        transport.apply(command);
    }

    /// Renders one block of interleaved stereo into `out`
    /// (`out.len() / 2` frames, at most `block_size`), then advances the
    /// transport. Returns the transport advance outcome.
    pub fn process_block(
        &mut self,
        snapshot: &RenderSnapshot,
        transport: &mut Transport,
        out: &mut [f32],
    ) -> BlockAdvance {
        let frames = (out.len() / 2).min(self.block_size);
        let out = &mut out[..frames * 2];
        out.fill(0.0);
        self.stats.clear();

        if self.rate_changed {
            self.bind_snapshot(snapshot);
            self.rate_changed = false;
        }

        if frames == 0 {
            return BlockAdvance::default();
        }

        match transport.state() {
            TransportState::Idle | TransportState::Paused => BlockAdvance::default(),
            TransportState::CountingIn => {
                self.render_count_in(snapshot, transport, out, frames);
                transport.advance_block(frames)
            }
            TransportState::Playing | TransportState::Recording => {
                self.render_playback(snapshot, transport, out, frames);
                let advance = transport.advance_block(frames);
                if advance.wrapped {
                    // The wrap is an implicit seek: no note may sound
                    // across the loop seam.
                    self.flush_voices();
                }
                advance
            }
        }
    }

    fn render_playback(
        &mut self,
        snapshot: &RenderSnapshot,
        transport: &Transport,
        out: &mut [f32],
        frames: usize,
    ) {
        let start_beat = transport.position_beats();
        let tempo = transport.tempo();
        self.mix[..frames * 2].fill(0.0);

        self.scheduler.schedule_block(
            snapshot,
            tempo,
            self.sample_rate,
            start_beat,
            frames,
            &mut self.events,
        );
        self.dispatch_events(frames);

        let any_solo = snapshot.any_solo();
        let track_count = snapshot.tracks.len().min(MAX_RENDER_TRACKS);
        for track_index in 0..track_count {
            let track = &snapshot.tracks[track_index];
            self.scratch[..frames].fill(0.0);

            self.render_voices(track_index as u32, frames);
            render_clips(
                track,
                tempo,
                self.sample_rate,
                start_beat,
                &mut self.scratch[..frames],
            );

            let block_automation = automation::evaluate_block(&track.automation, start_beat);
            let volume = block_automation.volume.unwrap_or(track.volume);
            let pan = block_automation.pan.unwrap_or(track.pan);
            let gain = resolve_track_gain(volume, pan, track.muted, track.solo, any_solo);

            let eq = &mut self.track_eq[track_index];
            let mut peak = 0.0_f32;
            let mut sum_squares = 0.0_f64;
            for (frame_index, frame) in self.mix[..frames * 2].chunks_exact_mut(2).enumerate() {
                let shaped = eq.process_sample(self.scratch[frame_index]) * gain.gain;
                let left = shaped * gain.left;
                let right = shaped * gain.right;
                frame[0] += left;
                frame[1] += right;
                peak = peak.max(left.abs()).max(right.abs());
                sum_squares += f64::from(left) * f64::from(left);
                sum_squares += f64::from(right) * f64::from(right);
            }
            self.stats.tracks[track_index] = LevelFrame {
                peak,
                rms: (sum_squares / (frames * 2) as f64).sqrt() as f32,
            };
        }

        self.retire_closed_voices();

        self.master.process(&mut self.mix[..frames * 2]);
        self.stats.master = LevelFrame::measure(&self.mix[..frames * 2]);
        out.copy_from_slice(&self.mix[..frames * 2]);
    }

    fn render_count_in(
        &mut self,
        snapshot: &RenderSnapshot,
        transport: &Transport,
        out: &mut [f32],
        frames: usize,
    ) {
        self.mix[..frames * 2].fill(0.0);

        if snapshot.metronome_enabled {
            let tempo = transport.tempo();
            let clock_start = transport.count_in_beats();
            let block_beats = tempo.samples_to_beats(frames as f64, self.sample_rate);
            let clock_end = clock_start + block_beats;

            // Finish a click still ringing from the previous block before
            // new ticks start.
            if self.click.remaining > 0 {
                self.render_click(0, frames);
            }

            // Tick on every integer count-in beat inside this block,
            // accented at bar starts.
            let mut beat = clock_start.ceil();
            while beat < clock_end {
                let offset = tempo.beats_to_samples(beat - clock_start, self.sample_rate) as usize;
                let accented = (beat as u64) % (BEATS_PER_BAR as u64) == 0;
                self.start_click(accented);
                self.render_click(offset.min(frames - 1), frames);
                beat += 1.0;
            }
        }

        self.master.process(&mut self.mix[..frames * 2]);
        self.stats.master = LevelFrame::measure(&self.mix[..frames * 2]);
        out.copy_from_slice(&self.mix[..frames * 2]);
    }

    fn start_click(&mut self, accented: bool) {
        let (freq, amp) = if accented {
            (CLICK_ACCENT_HZ, CLICK_ACCENT_AMP)
        } else {
            (CLICK_TICK_HZ, CLICK_TICK_AMP)
        };
        self.click = ClickVoice {
            remaining: (CLICK_SECONDS * self.sample_rate as f32) as u32,
            phase: 0.0,
            phase_inc: std::f32::consts::TAU * freq / self.sample_rate as f32,
            amplitude: amp,
        };
    }

    fn render_click(&mut self, from: usize, frames: usize) {
        let total = (CLICK_SECONDS * self.sample_rate as f32).max(1.0);
        for frame in self.mix[from * 2..frames * 2].chunks_exact_mut(2) {
            if self.click.remaining == 0 {
                break;
            }
            let envelope = self.click.remaining as f32 / total;
            let sample = self.click.phase.sin() * self.click.amplitude * envelope;
            frame[0] += sample;
            frame[1] += sample;
            self.click.phase += self.click.phase_inc;
            self.click.remaining -= 1;
        }
    }

    fn dispatch_events(&mut self, frames: usize) {
        let frames = frames as u32;
        for voice in &mut self.voices {
            if voice.active {
                voice.start_offset = 0;
                voice.end_offset = frames;
                voice.closing = false;
            }
        }

        // Events arrive sorted with NoteOff before NoteOn on ties, so a
        // retriggered pitch closes the old voice before opening a new one.
        for event_index in 0..self.events.len() {
            let event = self.events[event_index];
            match event.kind {
                MidiEventKind::NoteOn { velocity } => {
                    self.start_voice(event, velocity, frames);
                }
                MidiEventKind::NoteOff => {
                    self.close_voice(event);
                }
            }
        }
    }

    fn start_voice(&mut self, event: MidiEvent, velocity: u8, frames: u32) {
        let Some(slot) = self.voices.iter_mut().find(|voice| !voice.active) else {
            self.stats.voices_starved += 1;
            return;
        };
        self.voice_seq += 1;
        *slot = Voice {
            active: true,
            track_index: event.track_index,
            pitch: event.pitch,
            phase: 0,
            phase_inc: frequency_to_phase_increment(note_frequency_hz(event.pitch), self.sample_rate),
            amplitude: f32::from(velocity.min(127)) / 127.0 * NOTE_AMPLITUDE,
            start_offset: event.sample_offset,
            end_offset: frames,
            closing: false,
            started_seq: self.voice_seq,
        };
    }

    fn close_voice(&mut self, event: MidiEvent) {
        // Oldest open voice on this (track, pitch) pair takes the off.
        let mut chosen: Option<usize> = None;
        for (index, voice) in self.voices.iter().enumerate() {
            if voice.active
                && !voice.closing
                && voice.track_index == event.track_index
                && voice.pitch == event.pitch
                && chosen.is_none_or(|current| voice.started_seq < self.voices[current].started_seq)
            {
                chosen = Some(index);
            }
        }
        if let Some(index) = chosen {
            let voice = &mut self.voices[index];
            voice.end_offset = event.sample_offset.max(voice.start_offset);
            voice.closing = true;
        }
    }

    fn render_voices(&mut self, track_index: u32, frames: usize) {
        for voice in &mut self.voices {
            if !voice.active || voice.track_index != track_index {
                continue;
            }
            let start = voice.start_offset as usize;
            let end = (voice.end_offset as usize).min(frames);
            for sample in &mut self.scratch[start..end] {
                *sample += triangle_osc(voice.phase) * voice.amplitude;
                voice.phase = voice.phase.wrapping_add(voice.phase_inc);
            }
        }
    }

    fn retire_closed_voices(&mut self) {
        for voice in &mut self.voices {
            if voice.active && voice.closing {
                voice.active = false;
            }
        }
    }
}

fn render_clips(
    track: &crate::snapshot::TrackSnapshot,
    tempo: &TempoMap,
    sample_rate: u32,
    start_beat: f64,
    scratch: &mut [f32],
) {
    let frames = scratch.len();
    let block_beats = tempo.samples_to_beats(frames as f64, sample_rate);
    let block_end = start_beat + block_beats;

    for clip in &track.clips {
        if clip.end_beat <= start_beat || clip.start_beat >= block_end {
            continue;
        }

        // First block frame at which the clip is active.
        let first_frame = if clip.start_beat > start_beat {
            tempo.beats_to_samples(clip.start_beat - start_beat, sample_rate) as usize
        } else {
            0
        };
        let last_frame = if clip.end_beat < block_end {
            (tempo.beats_to_samples(clip.end_beat - start_beat, sample_rate) as usize).min(frames)
        } else {
            frames
        };
        if first_frame >= last_frame {
            continue;
        }

        // Seconds into the clip at the first active frame; the source is
        // read at its native rate through linear interpolation.
        let clip_seconds_at_first = tempo.beats_to_seconds(
            (start_beat + tempo.samples_to_beats(first_frame as f64, sample_rate))
                - clip.start_beat,
        );
        let source_rate = f64::from(clip.source.sample_rate.max(1));
        let source = &clip.source.samples;

        for (index, sample) in scratch[first_frame..last_frame].iter_mut().enumerate() {
            let seconds = clip_seconds_at_first + index as f64 / f64::from(sample_rate);
            let position = (clip.trim_start_seconds + seconds) * source_rate;
            if position < 0.0 {
                continue;
            }
            let base = position.floor() as usize;
            if base + 1 >= source.len() {
                break;
            }
            let fraction = (position - base as f64) as f32;
            let interpolated = source[base] + (source[base + 1] - source[base]) * fraction;
            *sample += interpolated * clip.gain;
        }
    }
}

fn frequency_to_phase_increment(frequency_hz: f64, sample_rate: u32) -> u32 {
    let normalized = frequency_hz / f64::from(sample_rate.max(1));
    (normalized * f64::from(u32::MAX)).clamp(1.0, f64::from(u32::MAX)) as u32
}

fn note_frequency_hz(pitch: u8) -> f64 {
    let semitone_offset = f64::from(i16::from(pitch) - 69);
    440.0 * 2_f64.powf(semitone_offset / 12.0)
}

fn triangle_osc(phase: u32) -> f32 {
    let phase_unit = phase as f32 / u32::MAX as f32;
    if phase_unit < 0.5 {
        (phase_unit * 4.0) - 1.0
    } else {
        3.0 - (phase_unit * 4.0)
    }
}

/// A finished offline pass: interleaved stereo at the snapshot's rate.
#[derive(Debug, Clone)]
pub struct OfflineRender {
    pub samples: Vec<f32>,
    pub frames: usize,
    pub sample_rate: u32,
    pub master: LevelFrame,
}

impl OfflineRender {
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames as f64 / f64::from(self.sample_rate)
    }
}

/// Renders a snapshot from beat 0 to the last region end plus a release
/// tail, in fixed-size blocks, with no time pressure. Given an unchanged
/// snapshot and block size the output is identical across runs.
///
/// Cancellation is cooperative and checked between blocks; a cancelled
/// render discards the partial buffer and leaves no other state.
pub fn render_offline(
    snapshot: &RenderSnapshot,
    block_size: usize,
    cancel: Option<&AtomicBool>,
) -> Result<OfflineRender, EngineError> {
    let sample_rate = snapshot.sample_rate;
    let tempo = TempoMap::new(snapshot.bpm).unwrap_or_default();
    let body_frames = tempo.beats_to_samples(snapshot.end_beat, sample_rate).ceil() as usize;
    let tail_frames = (RELEASE_TAIL_SECONDS * f64::from(sample_rate)).round() as usize;
    let total_frames = (body_frames + tail_frames).max(sample_rate as usize);

    let mut transport = Transport::new(tempo, sample_rate, 0, None);
    let mut renderer = BlockRenderer::new(snapshot, block_size);
    renderer.apply_command(&mut transport, TransportCommand::Play);

    let mut samples = vec![0.0_f32; total_frames * 2];
    for chunk in samples.chunks_mut(block_size * 2) {
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(EngineError::RenderCancelled);
        }
        renderer.process_block(snapshot, &mut transport, chunk);
    }

    let master = LevelFrame::measure(&samples);
    Ok(OfflineRender {
        samples,
        frames: total_frames,
        sample_rate,
        master,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{NoteSpan, TrackSnapshot};

    fn snapshot_with_note() -> RenderSnapshot {
        let mut snapshot = RenderSnapshot::empty(120.0, 48_000);
        snapshot.end_beat = 1.0;
        snapshot.tracks.push(TrackSnapshot::midi_for_test(vec![NoteSpan {
            pitch: 69,
            velocity: 100,
            start_beat: 0.0,
            end_beat: 1.0,
        }]));
        snapshot
    }

    #[test]
    fn empty_snapshot_renders_at_least_one_second_of_silence() {
        let snapshot = RenderSnapshot::empty(120.0, 48_000);
        let render =
            render_offline(&snapshot, 512, None).expect("offline render should succeed");
        assert_eq!(render.frames, 48_000);
        assert_eq!(render.master.peak, 0.0);
    }

    #[test]
    fn note_sounds_inside_its_window_and_not_in_the_tail() {
        let snapshot = snapshot_with_note();
        let render =
            render_offline(&snapshot, 512, None).expect("offline render should succeed");

        // One beat at 120 bpm is half a second: 24000 frames of body.
        let body = &render.samples[..24_000 * 2];
        assert!(LevelFrame::measure(body).peak > 0.01, "note is audible");

        let tail = &render.samples[25_000 * 2..];
        assert_eq!(LevelFrame::measure(tail).peak, 0.0, "tail is silent");
    }

    #[test]
    fn offline_render_is_deterministic() {
        let snapshot = snapshot_with_note();
        let first =
            render_offline(&snapshot, 256, None).expect("offline render should succeed");
        let second =
            render_offline(&snapshot, 256, None).expect("offline render should succeed");
        assert_eq!(first.samples, second.samples, "bit-exact across runs");
    }

    #[test]
    fn cancellation_aborts_between_blocks() {
        let snapshot = snapshot_with_note();
        let cancel = AtomicBool::new(true);
        let result = render_offline(&snapshot, 512, Some(&cancel));
        assert!(matches!(result, Err(EngineError::RenderCancelled)));
    }

    #[test]
    fn voice_pool_exhaustion_is_counted_not_fatal() {
        let mut snapshot = RenderSnapshot::empty(120.0, 48_000);
        snapshot.end_beat = 1.0;
        let notes: Vec<NoteSpan> = (0..=96)
            .map(|pitch| NoteSpan {
                pitch: pitch as u8 + 20,
                velocity: 80,
                start_beat: 0.0,
                end_beat: 1.0,
            })
            .collect();
        snapshot.tracks.push(TrackSnapshot::midi_for_test(notes));

        let mut transport = Transport::new(
            TempoMap::new(120.0).expect("tempo should build"),
            48_000,
            0,
            None,
        );
        let mut renderer = BlockRenderer::new(&snapshot, 512);
        renderer.apply_command(&mut transport, TransportCommand::Play);

        let mut out = vec![0.0_f32; 512 * 2];
        renderer.process_block(&snapshot, &mut transport, &mut out);
        assert_eq!(renderer.stats().voices_starved, 97 - MAX_VOICES as u32);
    }
}
