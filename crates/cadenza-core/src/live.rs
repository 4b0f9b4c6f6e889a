use std::sync::Arc;

use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};

use crate::{
    engine::EngineError,
    meters::MeterBank,
    render::{BlockRenderer, MAX_RENDER_TRACKS},
    snapshot::RenderSnapshot,
    time::musical_time_string,
    transport::{Transport, TransportCommand, TransportState},
};

const COMMAND_CAPACITY: usize = 64;
const SNAPSHOT_CAPACITY: usize = 8;
const RETIRE_CAPACITY: usize = 16;

/// Control-thread half of the live session. Commands and snapshots cross
/// to the audio thread over wait-free SPSC rings; retired snapshots come
/// back the same way so the audio thread never runs a destructor.
pub struct LiveHandle {
    commands: HeapProd<TransportCommand>,
    snapshots: HeapProd<Arc<RenderSnapshot>>,
    retired: HeapCons<Arc<RenderSnapshot>>,
    meters: Arc<MeterBank>,
}

impl LiveHandle {
    /// Queues a transport command for the next block boundary. A full
    /// queue is a configuration-sized burst the UI should back off from.
    pub fn send_command(&mut self, command: TransportCommand) -> Result<(), EngineError> {
        self.commands
            .try_push(command)
            .map_err(|_| EngineError::CommandQueueFull)
    }

    /// Publishes a freshly built snapshot; the audio thread picks it up at
    /// its next block boundary.
    pub fn publish_snapshot(&mut self, snapshot: Arc<RenderSnapshot>) -> Result<(), EngineError> {
        self.snapshots
            .try_push(snapshot)
            .map_err(|_| EngineError::CommandQueueFull)
    }

    /// Drops snapshots the audio thread has retired. Called periodically
    /// from the control thread; this is where their memory is freed.
    pub fn reclaim_retired(&mut self) -> usize {
        let mut reclaimed = 0;
        while self.retired.try_pop().is_some() {
            reclaimed += 1;
        }
        reclaimed
    }

    #[must_use]
    pub fn meters(&self) -> &Arc<MeterBank> {
        &self.meters
    }

    /// Playback position as of the audio thread's last rendered block.
    #[must_use]
    pub fn position_beats(&self) -> f64 {
        self.meters.position_beats()
    }

    #[must_use]
    pub fn transport_state(&self) -> TransportState {
        self.meters.transport_state()
    }

    /// `bar.beat.ticks` display string for the published position.
    #[must_use]
    pub fn position_display(&self) -> String {
        musical_time_string(self.meters.position_beats())
    }
}

/// Audio-thread half: owns the renderer and transport, consumes commands
/// and snapshots at block boundaries, and publishes meters. `process` is
/// the device callback body; it allocates nothing, takes no locks, and
/// never logs.
pub struct LiveRenderer {
    renderer: BlockRenderer,
    transport: Transport,
    snapshot: Arc<RenderSnapshot>,
    commands: HeapCons<TransportCommand>,
    snapshots: HeapCons<Arc<RenderSnapshot>>,
    retired: HeapProd<Arc<RenderSnapshot>>,
    pending_retire: Vec<Arc<RenderSnapshot>>,
    meters: Arc<MeterBank>,
}

/// Builds a connected control/audio pair around an initial snapshot.
#[must_use]
pub fn live_session(
    snapshot: Arc<RenderSnapshot>,
    transport: Transport,
    block_size: usize,
) -> (LiveHandle, LiveRenderer) {
    let (command_prod, command_cons) = HeapRb::new(COMMAND_CAPACITY).split();
    let (snapshot_prod, snapshot_cons) = HeapRb::new(SNAPSHOT_CAPACITY).split();
    let (retire_prod, retire_cons) = HeapRb::new(RETIRE_CAPACITY).split();
    let meters = Arc::new(MeterBank::new(MAX_RENDER_TRACKS));

    let renderer = BlockRenderer::new(&snapshot, block_size);
    let handle = LiveHandle {
        commands: command_prod,
        snapshots: snapshot_prod,
        retired: retire_cons,
        meters: Arc::clone(&meters),
    };
    let live = LiveRenderer {
        renderer,
        transport,
        snapshot,
        commands: command_cons,
        snapshots: snapshot_cons,
        retired: retire_prod,
        pending_retire: Vec::with_capacity(RETIRE_CAPACITY),
        meters,
    };
    (handle, live)
}

impl LiveRenderer {
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Sounding notes, counting overlaps; zero after any flush.
    #[must_use]
    pub fn active_note_count(&self) -> usize {
        self.renderer.active_note_count()
    }

    /// Fills `out` (interleaved stereo, any length) by rendering in block
    /// sized chunks. Commands and snapshot swaps apply only at chunk
    /// boundaries, so every block sees one consistent project view.
    pub fn process(&mut self, out: &mut [f32]) {
        let chunk_len = self.renderer.block_size() * 2;
        for chunk in out.chunks_mut(chunk_len) {
            self.drain_control();
            self.renderer
                .process_block(&self.snapshot, &mut self.transport, chunk);
            self.publish_meters();
        }
    }

    /// The host device reported a missed deadline.
    pub fn note_xrun(&self) {
        self.meters.record_xrun();
    }

    fn drain_control(&mut self) {
        self.flush_retired();

        let mut swapped = false;
        while let Some(next) = self.snapshots.try_pop() {
            let old = std::mem::replace(&mut self.snapshot, next);
            self.retire(old);
            swapped = true;
        }
        if swapped {
            self.renderer.bind_snapshot(&self.snapshot);
        }

        while let Some(command) = self.commands.try_pop() {
            self.renderer.apply_command(&mut self.transport, command);
        }
    }

    fn retire(&mut self, snapshot: Arc<RenderSnapshot>) {
        if let Err(snapshot) = self.retired.try_push(snapshot) {
            if self.pending_retire.len() < self.pending_retire.capacity() {
                self.pending_retire.push(snapshot);
            }
            // A full pending list means the control thread stopped
            // reclaiming; dropping here is the only remaining option.
        }
    }

    fn flush_retired(&mut self) {
        while let Some(snapshot) = self.pending_retire.pop() {
            if let Err(snapshot) = self.retired.try_push(snapshot) {
                self.pending_retire.push(snapshot);
                break;
            }
        }
    }

    fn publish_meters(&self) {
        self.meters
            .store_transport(self.transport.position_beats(), self.transport.state());
        let stats = self.renderer.stats();
        self.meters.master.store(stats.master);
        let slots = self.meters.track_slots().min(stats.tracks.len());
        for index in 0..slots {
            if let Some(meter) = self.meters.track(index) {
                meter.store(stats.tracks[index]);
            }
        }
        for _ in 0..stats.voices_starved {
            self.meters.record_voice_starved();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TempoMap;

    fn session() -> (LiveHandle, LiveRenderer) {
        let snapshot = Arc::new(RenderSnapshot::empty(120.0, 48_000));
        let transport = Transport::new(
            TempoMap::new(120.0).expect("tempo should build"),
            48_000,
            0,
            None,
        );
        live_session(snapshot, transport, 256)
    }

    #[test]
    fn commands_apply_at_the_next_block_boundary() {
        let (mut handle, mut live) = session();
        handle
            .send_command(TransportCommand::Play)
            .expect("queue should accept");

        let mut out = vec![0.0_f32; 256 * 2];
        live.process(&mut out);
        assert_eq!(live.transport().state(), TransportState::Playing);
        assert!(live.transport().position_beats() > 0.0);
    }

    #[test]
    fn position_and_state_are_readable_from_the_control_half() {
        let (mut handle, mut live) = session();
        assert_eq!(handle.transport_state(), TransportState::Idle);
        assert_eq!(handle.position_display(), "1.1.000");

        handle
            .send_command(TransportCommand::Play)
            .expect("queue should accept");
        let mut out = vec![0.0_f32; 256 * 2];
        live.process(&mut out);

        assert_eq!(handle.transport_state(), TransportState::Playing);
        let expected_beats = 256.0 / 48_000.0 * 2.0;
        assert!((handle.position_beats() - expected_beats).abs() < 1e-9);
        assert_eq!(handle.position_display(), "1.1.005");
    }

    #[test]
    fn snapshot_swap_retires_the_previous_arc() {
        let (mut handle, mut live) = session();
        let replacement = Arc::new(RenderSnapshot::empty(120.0, 48_000));
        handle
            .publish_snapshot(replacement)
            .expect("queue should accept");

        let mut out = vec![0.0_f32; 256 * 2];
        live.process(&mut out);
        assert_eq!(handle.reclaim_retired(), 1);
    }

    #[test]
    fn command_queue_overflow_is_reported() {
        let (mut handle, _live) = session();
        let mut overflowed = false;
        for _ in 0..COMMAND_CAPACITY + 1 {
            if handle.send_command(TransportCommand::Play).is_err() {
                overflowed = true;
            }
        }
        assert!(overflowed);
    }

    #[test]
    fn uneven_callback_lengths_render_in_block_chunks() {
        let (mut handle, mut live) = session();
        handle
            .send_command(TransportCommand::Play)
            .expect("queue should accept");

        // 600 frames with a 256-frame block: 256 + 256 + 88.
        let mut out = vec![0.0_f32; 600 * 2];
        live.process(&mut out);
        let expected_beats = 600.0 / 48_000.0 * 2.0;
        assert!((live.transport().position_beats() - expected_beats).abs() < 1e-9);
    }
}
