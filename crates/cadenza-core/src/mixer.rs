use std::f32::consts::FRAC_PI_2;

use crate::model::EqSettings;

/// Per-track effective gain stage for one render block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackGain {
    /// Linear gain after mute/solo resolution and automation.
    pub gain: f32,
    pub left: f32,
    pub right: f32,
}

impl TrackGain {
    #[must_use]
    pub fn is_audible(&self) -> bool {
        self.gain > 1e-6
    }
}

/// Equal-power pan: 0 = full left, 0.5 = center, 1 = full right. The same
/// law is used by the live and offline paths so their output matches.
#[must_use]
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let angle = pan.clamp(0.0, 1.0) * FRAC_PI_2;
    (angle.cos(), angle.sin())
}

/// Resolves one track's gain stage. Solo overrides everything: when any
/// track in the project is soloed, every non-solo track is silenced
/// regardless of its own mute flag. Otherwise mute silences the track.
#[must_use]
pub fn resolve_track_gain(volume: f32, pan: f32, muted: bool, solo: bool, any_solo: bool) -> TrackGain {
    let silenced = if any_solo { !solo } else { muted };
    let gain = if silenced {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    };
    let (left, right) = pan_gains(pan);
    TrackGain { gain, left, right }
}

#[must_use]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// First-order three-band split (low below ~200 Hz, high above ~2 kHz)
/// with a per-band linear gain. The band curve shape is deliberately
/// simple; only the gain plumbing matters to the render contract.
#[derive(Debug, Clone, Copy)]
pub struct Eq3Band {
    low_coeff: f32,
    high_coeff: f32,
    low_gain: f32,
    mid_gain: f32,
    high_gain: f32,
    low_state: f32,
    high_state: f32,
    flat: bool,
}

const LOW_CROSSOVER_HZ: f32 = 200.0;
const HIGH_CROSSOVER_HZ: f32 = 2_000.0;

impl Eq3Band {
    #[must_use]
    pub fn new(settings: EqSettings, sample_rate: u32) -> Self {
        Self {
            low_coeff: one_pole_coeff(LOW_CROSSOVER_HZ, sample_rate),
            high_coeff: one_pole_coeff(HIGH_CROSSOVER_HZ, sample_rate),
            low_gain: db_to_linear(settings.low_gain_db),
            mid_gain: db_to_linear(settings.mid_gain_db),
            high_gain: db_to_linear(settings.high_gain_db),
            low_state: 0.0,
            high_state: 0.0,
            flat: settings.is_flat(),
        }
    }

    pub fn reset(&mut self) {
        self.low_state = 0.0;
        self.high_state = 0.0;
    }

    #[inline]
    pub fn process_sample(&mut self, input: f32) -> f32 {
        if self.flat {
            return input;
        }
        self.low_state += self.low_coeff * (input - self.low_state);
        self.high_state += self.high_coeff * (input - self.high_state);
        let low = self.low_state;
        let mid = self.high_state - self.low_state;
        let high = input - self.high_state;
        low * self.low_gain + mid * self.mid_gain + high * self.high_gain
    }
}

fn one_pole_coeff(cutoff_hz: f32, sample_rate: u32) -> f32 {
    let sample_rate = sample_rate.max(1) as f32;
    let x = (-2.0 * std::f32::consts::PI * cutoff_hz / sample_rate).exp();
    1.0 - x
}

/// Stereo pair of band filters for an interleaved buffer.
#[derive(Debug, Clone, Copy)]
pub struct StereoEq {
    left: Eq3Band,
    right: Eq3Band,
}

impl StereoEq {
    #[must_use]
    pub fn new(settings: EqSettings, sample_rate: u32) -> Self {
        let band = Eq3Band::new(settings, sample_rate);
        Self {
            left: band,
            right: band,
        }
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }

    pub fn process(&mut self, interleaved: &mut [f32]) {
        for frame in interleaved.chunks_exact_mut(2) {
            frame[0] = self.left.process_sample(frame[0]);
            frame[1] = self.right.process_sample(frame[1]);
        }
    }
}

/// Master bus: sums post-gain/pan track output, applies master volume and
/// EQ, clamps to [-1, 1]. This is the canonical export signal.
#[derive(Debug, Clone, Copy)]
pub struct MasterChain {
    volume: f32,
    eq: StereoEq,
}

impl MasterChain {
    #[must_use]
    pub fn new(volume: f32, eq: EqSettings, sample_rate: u32) -> Self {
        Self {
            volume: volume.clamp(0.0, 1.0),
            eq: StereoEq::new(eq, sample_rate),
        }
    }

    pub fn reset(&mut self) {
        self.eq.reset();
    }

    pub fn process(&mut self, interleaved: &mut [f32]) {
        self.eq.process(interleaved);
        for sample in interleaved.iter_mut() {
            *sample = (*sample * self.volume).clamp(-1.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_overrides_mute_everywhere() {
        // A muted track that is also soloed still sounds while solo is
        // active somewhere in the project.
        let soloed = resolve_track_gain(0.8, 0.5, true, true, true);
        assert!(soloed.is_audible());

        let bystander = resolve_track_gain(0.8, 0.5, false, false, true);
        assert!(!bystander.is_audible());

        let muted = resolve_track_gain(0.8, 0.5, true, false, false);
        assert!(!muted.is_audible());
    }

    #[test]
    fn pan_law_is_equal_power() {
        let (left, right) = pan_gains(0.0);
        assert!((left - 1.0).abs() < 1e-6);
        assert!(right.abs() < 1e-6);

        let (left, right) = pan_gains(1.0);
        assert!(left.abs() < 1e-6);
        assert!((right - 1.0).abs() < 1e-6);

        let (left, right) = pan_gains(0.5);
        let power = left * left + right * right;
        assert!((power - 1.0).abs() < 1e-5, "center preserves power");
    }

    #[test]
    fn flat_eq_is_identity() {
        let mut eq = Eq3Band::new(EqSettings::default(), 48_000);
        for sample in [-0.5_f32, 0.1, 0.9, -1.0] {
            assert_eq!(eq.process_sample(sample), sample);
        }
    }

    #[test]
    fn master_chain_clamps_output() {
        let mut master = MasterChain::new(1.0, EqSettings::default(), 48_000);
        let mut buffer = [2.0_f32, -3.0, 0.25, 0.0];
        master.process(&mut buffer);
        assert_eq!(buffer[0], 1.0);
        assert_eq!(buffer[1], -1.0);
        assert_eq!(buffer[2], 0.25);
    }
}
