use cadenza_core::{
    RenderSnapshot, TempoMap, Transport, TransportCommand, TransportState,
    fixtures::scale_project,
    live::live_session,
};
use proptest::prelude::*;

const BLOCK: usize = 512;

#[derive(Debug, Clone, Copy)]
enum Step {
    Play,
    Pause,
    Stop,
    Seek(f64),
    Record,
    SetTempo(f64),
    Blocks(u8),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Play),
        Just(Step::Pause),
        Just(Step::Stop),
        Just(Step::Record),
        (0.0_f64..24.0).prop_map(Step::Seek),
        (40.0_f64..220.0).prop_map(Step::SetTempo),
        (1..24_u8).prop_map(Step::Blocks),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever the command timeline, stopping always leaves zero active
    /// notes and silent output. Stuck notes and doubled triggers are the
    /// two regressions this guards against.
    #[test]
    fn any_command_sequence_ends_clean_after_stop(
        steps in prop::collection::vec(step_strategy(), 1..24)
    ) {
        let snapshot = RenderSnapshot::build(&scale_project());
        let transport = Transport::new(
            TempoMap::new(snapshot.bpm).expect("fixture tempo should build"),
            snapshot.sample_rate,
            1,
            None,
        );
        let (mut handle, mut live) = live_session(snapshot, transport, BLOCK);
        let mut buffer = vec![0.0_f32; BLOCK * 2];

        for step in steps {
            let command = match step {
                Step::Play => Some(TransportCommand::Play),
                Step::Pause => Some(TransportCommand::Pause),
                Step::Stop => Some(TransportCommand::Stop),
                Step::Record => Some(TransportCommand::Record),
                Step::Seek(beat) => Some(TransportCommand::Seek(beat)),
                Step::SetTempo(bpm) => Some(TransportCommand::SetTempo(bpm)),
                Step::Blocks(count) => {
                    for _ in 0..count {
                        live.process(&mut buffer);
                    }
                    None
                }
            };
            if let Some(command) = command {
                // Queue overflow is legal under a command burst; dropped
                // commands must not corrupt note state either.
                let _ = handle.send_command(command);
            }
        }

        handle
            .send_command(TransportCommand::Stop)
            .expect("final stop should queue");
        live.process(&mut buffer);
        prop_assert_eq!(live.transport().state(), TransportState::Idle);
        prop_assert_eq!(live.active_note_count(), 0);

        live.process(&mut buffer);
        let peak = buffer.iter().fold(0.0_f32, |max, s| max.max(s.abs()));
        prop_assert!(peak == 0.0, "idle output must be silent, peak {}", peak);
    }
}
