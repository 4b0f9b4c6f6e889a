use crate::{snapshot::RenderSnapshot, time::TempoMap};

/// Event capacity reserved up front so steady-state scheduling never
/// allocates on the audio thread.
pub const MAX_BLOCK_EVENTS: usize = 1024;
pub const MAX_ACTIVE_NOTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEventKind {
    NoteOn { velocity: u8 },
    NoteOff,
}

impl MidiEventKind {
    /// Tie-break rank: NoteOff sorts before NoteOn at the same offset so a
    /// re-triggered pitch never sounds as a double-on.
    #[must_use]
    fn order(self) -> u8 {
        match self {
            Self::NoteOff => 0,
            Self::NoteOn { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub sample_offset: u32,
    pub track_index: u32,
    pub pitch: u8,
    pub kind: MidiEventKind,
}

#[derive(Debug, Clone, Copy)]
struct ActiveNote {
    track_index: u32,
    pitch: u8,
    /// Overlapping notes of the same pitch each hold one count.
    count: u16,
}

/// Flattens MIDI regions into a sample-accurate event stream, one render
/// block at a time, recomputing from beat position every block so tempo
/// changes take effect cleanly at the next block boundary.
///
/// The active-note table exists so that a seek, stop, pause, or loop wrap
/// can force a NoteOff for every sounding note before transport state
/// changes. A dropped NoteOff (stuck note) and a doubled NoteOn are the
/// two regression classes the tests target.
#[derive(Debug)]
pub struct MidiScheduler {
    active: Vec<ActiveNote>,
}

impl Default for MidiScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Vec::with_capacity(MAX_ACTIVE_NOTES),
        }
    }

    /// Total sounding notes, counting overlaps.
    #[must_use]
    pub fn active_note_count(&self) -> usize {
        self.active.iter().map(|note| usize::from(note.count)).sum()
    }

    /// Emits the events for the window `[start_beat, start_beat + block)`
    /// into `events`, sorted by `(sample_offset, NoteOff-before-NoteOn)`.
    pub fn schedule_block(
        &mut self,
        snapshot: &RenderSnapshot,
        tempo: &TempoMap,
        sample_rate: u32,
        start_beat: f64,
        frames: usize,
        events: &mut Vec<MidiEvent>,
    ) {
        events.clear();
        if frames == 0 {
            return;
        }
        let block_beats = tempo.samples_to_beats(frames as f64, sample_rate);
        let end_beat = start_beat + block_beats;
        let max_offset = (frames - 1) as u32;

        for (track_index, track) in snapshot.tracks.iter().enumerate() {
            let track_index = track_index as u32;
            for note in &track.notes {
                if note.start_beat >= end_beat {
                    // Notes are sorted by absolute start beat.
                    break;
                }

                if note.start_beat >= start_beat {
                    let offset = tempo
                        .beats_to_samples(note.start_beat - start_beat, sample_rate)
                        .floor() as u32;
                    events.push(MidiEvent {
                        sample_offset: offset.min(max_offset),
                        track_index,
                        pitch: note.pitch,
                        kind: MidiEventKind::NoteOn {
                            velocity: note.velocity,
                        },
                    });
                    self.note_on(track_index, note.pitch);
                }

                if note.end_beat >= start_beat && note.end_beat < end_beat {
                    // A NoteOff whose NoteOn was jumped over (seek, wrap)
                    // finds no active entry and is skipped: the flush that
                    // accompanied the jump already silenced it.
                    if self.note_off(track_index, note.pitch) {
                        let offset = tempo
                            .beats_to_samples(note.end_beat - start_beat, sample_rate)
                            .floor() as u32;
                        events.push(MidiEvent {
                            sample_offset: offset.min(max_offset),
                            track_index,
                            pitch: note.pitch,
                            kind: MidiEventKind::NoteOff,
                        });
                    }
                }
            }
        }

        events.sort_unstable_by_key(|event| {
            (
                event.sample_offset,
                event.kind.order(),
                event.track_index,
                event.pitch,
            )
        });
    }

    /// Emits an immediate NoteOff (offset 0) for every active note and
    /// clears the table. Invoked on pause, stop, seek, loop wrap, and
    /// device change, before the transport state changes.
    pub fn flush(&mut self, events: &mut Vec<MidiEvent>) {
        events.clear();
        for note in &self.active {
            for _ in 0..note.count {
                events.push(MidiEvent {
                    sample_offset: 0,
                    track_index: note.track_index,
                    pitch: note.pitch,
                    kind: MidiEventKind::NoteOff,
                });
            }
        }
        self.active.clear();
    }

    fn note_on(&mut self, track_index: u32, pitch: u8) {
        if let Some(entry) = self
            .active
            .iter_mut()
            .find(|entry| entry.track_index == track_index && entry.pitch == pitch)
        {
            entry.count = entry.count.saturating_add(1);
            return;
        }
        if self.active.len() < MAX_ACTIVE_NOTES {
            self.active.push(ActiveNote {
                track_index,
                pitch,
                count: 1,
            });
        }
    }

    /// Returns true when a matching active note was retired.
    fn note_off(&mut self, track_index: u32, pitch: u8) -> bool {
        let Some(index) = self
            .active
            .iter()
            .position(|entry| entry.track_index == track_index && entry.pitch == pitch)
        else {
            return false;
        };
        let entry = &mut self.active[index];
        entry.count -= 1;
        if entry.count == 0 {
            self.active.swap_remove(index);
        }
        true
    }
}
