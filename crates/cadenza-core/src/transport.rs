use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::{
    model::{BEATS_PER_BAR, CycleRegion},
    time::TempoMap,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Idle,
    Playing,
    Paused,
    Recording,
    CountingIn,
}

impl TransportState {
    #[must_use]
    pub fn is_advancing(self) -> bool {
        matches!(self, Self::Playing | Self::Recording)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportCommand {
    Play,
    Pause,
    Stop,
    Seek(f64),
    Record,
    ToggleCycle,
    SetCycle(Option<CycleRegion>),
    SetTempo(f64),
    DeviceChange { sample_rate: u32 },
}

/// Notifications for UI collaborators; the transport pushes, subscribers
/// pull. Sent with `try_send` on a bounded channel so the audio thread
/// never blocks on a slow listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        from: TransportState,
        to: TransportState,
    },
    PositionJumped {
        beat: f64,
    },
    CycleWrapped {
        to_beat: f64,
    },
    CountInFinished,
    TempoChanged {
        bpm: f64,
    },
    DeviceReset {
        sample_rate: u32,
    },
}

/// Result of advancing the transport by one block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockAdvance {
    /// The cycle wrapped at this block boundary; the scheduler must treat
    /// the wrap as an implicit seek and flush active notes.
    pub wrapped: bool,
    /// Count-in completed and recording began.
    pub started_recording: bool,
}

/// Owns playback position, cycle, count-in, and record arming. Created
/// once per render session; mutated only through [`Transport::apply`] and
/// [`Transport::advance_block`], read by the scheduler each render block.
#[derive(Debug, Clone)]
pub struct Transport {
    state: TransportState,
    position_beats: f64,
    cycle: Option<CycleRegion>,
    cycle_enabled: bool,
    tempo: TempoMap,
    sample_rate: u32,
    count_in_bars: u32,
    count_in_beats: f64,
    events: Option<Sender<TransportEvent>>,
}

impl Transport {
    #[must_use]
    pub fn new(
        tempo: TempoMap,
        sample_rate: u32,
        count_in_bars: u32,
        events: Option<Sender<TransportEvent>>,
    ) -> Self {
        Self {
            state: TransportState::Idle,
            position_beats: 0.0,
            cycle: None,
            cycle_enabled: false,
            tempo,
            sample_rate,
            count_in_bars,
            count_in_beats: 0.0,
            events,
        }
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        self.state
    }

    #[must_use]
    pub fn position_beats(&self) -> f64 {
        self.position_beats
    }

    #[must_use]
    pub fn tempo(&self) -> &TempoMap {
        &self.tempo
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn cycle(&self) -> Option<CycleRegion> {
        self.cycle.filter(|_| self.cycle_enabled)
    }

    /// Beats elapsed on the count-in clock; the project position does not
    /// advance while counting in.
    #[must_use]
    pub fn count_in_beats(&self) -> f64 {
        self.count_in_beats
    }

    /// Whether `command` must flush active notes *before* it is applied.
    /// Pause, stop, seek, and a real device change all silence sounding
    /// notes first so no NoteOff is ever lost across the state change.
    #[must_use]
    pub fn requires_flush(&self, command: &TransportCommand) -> bool {
        match command {
            TransportCommand::Pause => self.state == TransportState::Playing,
            TransportCommand::Stop | TransportCommand::Seek(_) => {
                self.state != TransportState::Idle
            }
            TransportCommand::DeviceChange { sample_rate } => {
                !self.device_change_is_noop(*sample_rate)
            }
            _ => false,
        }
    }

    pub fn apply(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Play => {
                if matches!(self.state, TransportState::Idle | TransportState::Paused) {
                    self.set_state(TransportState::Playing);
                }
            }
            TransportCommand::Pause => {
                if self.state == TransportState::Playing {
                    self.set_state(TransportState::Paused);
                }
            }
            TransportCommand::Stop => {
                // Cancels pending recording, including an unfinished
                // count-in.
                self.count_in_beats = 0.0;
                self.position_beats = 0.0;
                self.set_state(TransportState::Idle);
            }
            TransportCommand::Seek(beat) => {
                self.position_beats = beat.max(0.0);
                self.emit(TransportEvent::PositionJumped {
                    beat: self.position_beats,
                });
            }
            TransportCommand::Record => {
                if self.state == TransportState::Idle {
                    self.count_in_beats = 0.0;
                    if self.count_in_bars > 0 {
                        self.set_state(TransportState::CountingIn);
                    } else {
                        self.set_state(TransportState::Recording);
                    }
                }
            }
            TransportCommand::ToggleCycle => {
                if self.cycle.is_some() {
                    self.cycle_enabled = !self.cycle_enabled;
                }
            }
            TransportCommand::SetCycle(region) => {
                self.cycle = region.filter(|cycle| cycle.end_beat > cycle.start_beat);
                if self.cycle.is_none() {
                    self.cycle_enabled = false;
                }
            }
            TransportCommand::SetTempo(bpm) => {
                // Validated on the control thread; a bad value that slips
                // through is rejected here without touching the map.
                if self.tempo.set_bpm(bpm).is_ok() {
                    self.emit(TransportEvent::TempoChanged { bpm });
                }
            }
            TransportCommand::DeviceChange { sample_rate } => {
                if self.device_change_is_noop(sample_rate) {
                    return;
                }
                self.sample_rate = sample_rate;
                self.count_in_beats = 0.0;
                self.position_beats = 0.0;
                self.set_state(TransportState::Idle);
                self.emit(TransportEvent::DeviceReset { sample_rate });
            }
        }
    }

    /// Advances musical position by `frames` at the current tempo. Cycle
    /// wrap happens exactly at the block boundary that crosses the cycle
    /// end, folding the overshoot back so the loop length is preserved.
    pub fn advance_block(&mut self, frames: usize) -> BlockAdvance {
        let mut advance = BlockAdvance::default();
        let block_beats = self.tempo.samples_to_beats(frames as f64, self.sample_rate);

        match self.state {
            TransportState::Playing | TransportState::Recording => {
                self.position_beats += block_beats;
                if let Some(cycle) = self.cycle()
                    && self.position_beats >= cycle.end_beat
                    && cycle.length_beats() > 0.0
                {
                    let overshoot =
                        (self.position_beats - cycle.end_beat) % cycle.length_beats();
                    self.position_beats = cycle.start_beat + overshoot;
                    advance.wrapped = true;
                    self.emit(TransportEvent::CycleWrapped {
                        to_beat: self.position_beats,
                    });
                }
            }
            TransportState::CountingIn => {
                self.count_in_beats += block_beats;
                if self.count_in_beats >= f64::from(self.count_in_bars) * BEATS_PER_BAR {
                    advance.started_recording = true;
                    self.set_state(TransportState::Recording);
                    self.emit(TransportEvent::CountInFinished);
                }
            }
            TransportState::Idle | TransportState::Paused => {}
        }

        advance
    }

    fn device_change_is_noop(&self, sample_rate: u32) -> bool {
        sample_rate == self.sample_rate
            && self.state == TransportState::Idle
            && self.position_beats == 0.0
    }

    fn set_state(&mut self, to: TransportState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.emit(TransportEvent::StateChanged { from, to });
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            // Never block the render path on a slow subscriber.
            let _ = events.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        Transport::new(
            TempoMap::new(120.0).expect("tempo should build"),
            48_000,
            1,
            None,
        )
    }

    #[test]
    fn play_pause_stop_transitions() {
        let mut transport = transport();
        transport.apply(TransportCommand::Play);
        assert_eq!(transport.state(), TransportState::Playing);

        transport.advance_block(24_000);
        assert!((transport.position_beats() - 1.0).abs() < 1e-9);

        transport.apply(TransportCommand::Pause);
        assert_eq!(transport.state(), TransportState::Paused);
        transport.advance_block(24_000);
        assert!(
            (transport.position_beats() - 1.0).abs() < 1e-9,
            "pause freezes position"
        );

        transport.apply(TransportCommand::Stop);
        assert_eq!(transport.state(), TransportState::Idle);
        assert_eq!(transport.position_beats(), 0.0);
    }

    #[test]
    fn seek_is_legal_in_any_state() {
        let mut transport = transport();
        transport.apply(TransportCommand::Seek(7.5));
        assert_eq!(transport.position_beats(), 7.5);
        assert_eq!(transport.state(), TransportState::Idle);

        transport.apply(TransportCommand::Play);
        transport.apply(TransportCommand::Seek(2.0));
        assert_eq!(transport.position_beats(), 2.0);
        assert_eq!(transport.state(), TransportState::Playing);

        transport.apply(TransportCommand::Seek(-3.0));
        assert_eq!(transport.position_beats(), 0.0, "seek clamps to zero");
    }

    #[test]
    fn record_counts_in_then_records_without_advancing_playback() {
        let mut transport = transport();
        transport.apply(TransportCommand::Record);
        assert_eq!(transport.state(), TransportState::CountingIn);

        // One bar at 120 bpm is 2 seconds: 96000 frames.
        let advance = transport.advance_block(48_000);
        assert!(!advance.started_recording);
        assert_eq!(transport.position_beats(), 0.0);

        let advance = transport.advance_block(48_000);
        assert!(advance.started_recording);
        assert_eq!(transport.state(), TransportState::Recording);
        assert_eq!(transport.position_beats(), 0.0);

        transport.advance_block(24_000);
        assert!((transport.position_beats() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stop_cancels_count_in() {
        let mut transport = transport();
        transport.apply(TransportCommand::Record);
        transport.advance_block(48_000);
        transport.apply(TransportCommand::Stop);
        assert_eq!(transport.state(), TransportState::Idle);
        assert_eq!(transport.count_in_beats(), 0.0);
    }

    #[test]
    fn cycle_wraps_at_block_boundary_with_fold() {
        let mut transport = transport();
        transport.apply(TransportCommand::SetCycle(Some(CycleRegion {
            start_beat: 0.0,
            end_beat: 4.0,
        })));
        transport.apply(TransportCommand::ToggleCycle);
        transport.apply(TransportCommand::Play);

        // 4.5 beats worth of frames crosses the cycle end by half a beat.
        let advance = transport.advance_block(108_000);
        assert!(advance.wrapped);
        assert!((transport.position_beats() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn toggle_cycle_without_region_is_inert() {
        let mut transport = transport();
        transport.apply(TransportCommand::ToggleCycle);
        assert!(transport.cycle().is_none());
    }

    #[test]
    fn invalid_cycle_region_is_discarded() {
        let mut transport = transport();
        transport.apply(TransportCommand::SetCycle(Some(CycleRegion {
            start_beat: 4.0,
            end_beat: 4.0,
        })));
        transport.apply(TransportCommand::ToggleCycle);
        assert!(transport.cycle().is_none());
    }

    #[test]
    fn device_change_is_forced_stop_and_idempotent() {
        let mut transport = transport();
        transport.apply(TransportCommand::Play);
        transport.advance_block(24_000);

        let change = TransportCommand::DeviceChange {
            sample_rate: 44_100,
        };
        assert!(transport.requires_flush(&change));
        transport.apply(change);
        assert_eq!(transport.state(), TransportState::Idle);
        assert_eq!(transport.position_beats(), 0.0);
        assert_eq!(transport.sample_rate(), 44_100);

        // Repeating the identical notification produces no side effects.
        assert!(!transport.requires_flush(&change));
        transport.apply(change);
        assert_eq!(transport.state(), TransportState::Idle);
    }

    #[test]
    fn tempo_change_applies_to_future_blocks() {
        let mut transport = transport();
        transport.apply(TransportCommand::Play);
        transport.advance_block(24_000);
        transport.apply(TransportCommand::SetTempo(60.0));
        transport.advance_block(24_000);
        // Half a second at 60 bpm is half a beat.
        assert!((transport.position_beats() - 1.5).abs() < 1e-9);

        transport.apply(TransportCommand::SetTempo(0.0));
        assert!((transport.tempo().bpm() - 60.0).abs() < f64::EPSILON);
    }
}
