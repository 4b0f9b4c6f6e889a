pub mod assets;
pub mod automation;
pub mod diagnostics;
pub mod engine;
pub mod export;
pub mod fixtures;
pub mod live;
pub mod meters;
pub mod mixer;
pub mod model;
pub mod parity;
pub mod render;
pub mod scheduler;
pub mod snapshot;
pub mod time;
pub mod transport;

pub use assets::DecodedAudio;
pub use diagnostics::{TelemetryGuard, init_tracing, init_tracing_with_options};
pub use engine::{
    AddAudioRegionRequest, AddMidiRegionRequest, AddTrackRequest, Engine, EngineError, MixerPatch,
};
pub use export::{ExportReport, export_wav};
pub use live::{LiveHandle, LiveRenderer};
pub use meters::{LevelFrame, MeterBank};
pub use model::{
    AudioRegion, AutomationLane, AutomationParameter, AutomationPoint, CycleRegion, MidiNote,
    MidiRegion, MixerSettings, Project, Region, RegionPayload, Track, TrackKind,
};
pub use parity::{ParityReport, generate_parity_report};
pub use render::{BlockRenderer, OfflineRender, render_offline};
pub use snapshot::RenderSnapshot;
pub use time::{TempoMap, musical_time_string};
pub use transport::{Transport, TransportCommand, TransportEvent, TransportState};
