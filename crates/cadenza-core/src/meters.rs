use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::transport::TransportState;

/// Peak and RMS level over one render block (stereo combined).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelFrame {
    pub peak: f32,
    pub rms: f32,
}

impl LevelFrame {
    #[must_use]
    pub fn measure(interleaved: &[f32]) -> Self {
        if interleaved.is_empty() {
            return Self::default();
        }
        let mut peak = 0.0_f32;
        let mut sum_squares = 0.0_f64;
        for &sample in interleaved {
            peak = peak.max(sample.abs());
            sum_squares += f64::from(sample) * f64::from(sample);
        }
        Self {
            peak,
            rms: (sum_squares / interleaved.len() as f64).sqrt() as f32,
        }
    }
}

/// One meter readable without locks: floats are bit-stored in atomics so
/// the audio thread publishes and the UI polls with relaxed loads.
#[derive(Debug, Default)]
pub struct AtomicLevel {
    peak: AtomicU32,
    rms: AtomicU32,
}

impl AtomicLevel {
    pub fn store(&self, level: LevelFrame) {
        self.peak.store(level.peak.to_bits(), Ordering::Relaxed);
        self.rms.store(level.rms.to_bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn load(&self) -> LevelFrame {
        LevelFrame {
            peak: f32::from_bits(self.peak.load(Ordering::Relaxed)),
            rms: f32::from_bits(self.rms.load(Ordering::Relaxed)),
        }
    }
}

/// Master and per-track meters, transport position/state, and the
/// real-time fault counters. The audio thread publishes once per block;
/// faults there are counted here, never thrown or logged.
#[derive(Debug)]
pub struct MeterBank {
    pub master: AtomicLevel,
    tracks: Vec<AtomicLevel>,
    position_beats: AtomicU64,
    transport_state: AtomicU32,
    xruns: AtomicU64,
    voices_starved: AtomicU64,
}

impl MeterBank {
    #[must_use]
    pub fn new(track_slots: usize) -> Self {
        Self {
            master: AtomicLevel::default(),
            tracks: (0..track_slots).map(|_| AtomicLevel::default()).collect(),
            position_beats: AtomicU64::new(0),
            transport_state: AtomicU32::new(0),
            xruns: AtomicU64::new(0),
            voices_starved: AtomicU64::new(0),
        }
    }

    pub fn store_transport(&self, beat: f64, state: TransportState) {
        self.position_beats.store(beat.to_bits(), Ordering::Relaxed);
        self.transport_state
            .store(state_code(state), Ordering::Relaxed);
    }

    #[must_use]
    pub fn position_beats(&self) -> f64 {
        f64::from_bits(self.position_beats.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn transport_state(&self) -> TransportState {
        state_from_code(self.transport_state.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn track(&self, index: usize) -> Option<&AtomicLevel> {
        self.tracks.get(index)
    }

    #[must_use]
    pub fn track_slots(&self) -> usize {
        self.tracks.len()
    }

    pub fn record_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    pub fn record_voice_starved(&self) {
        self.voices_starved.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn voices_starved_count(&self) -> u64 {
        self.voices_starved.load(Ordering::Relaxed)
    }
}

fn state_code(state: TransportState) -> u32 {
    match state {
        TransportState::Idle => 0,
        TransportState::Playing => 1,
        TransportState::Paused => 2,
        TransportState::Recording => 3,
        TransportState::CountingIn => 4,
    }
}

fn state_from_code(code: u32) -> TransportState {
    match code {
        1 => TransportState::Playing,
        2 => TransportState::Paused,
        3 => TransportState::Recording,
        4 => TransportState::CountingIn,
        _ => TransportState::Idle,
    }
}
