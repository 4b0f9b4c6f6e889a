use crate::model::{AutomationLane, AutomationParameter, AutomationPoint};

/// Drops non-finite points and sorts the remainder ascending by beat,
/// restoring the lane invariant after arbitrary edits.
#[must_use]
pub fn sanitize_points(points: Vec<AutomationPoint>) -> Vec<AutomationPoint> {
    let mut points: Vec<AutomationPoint> = points
        .into_iter()
        .filter(|point| point.beat.is_finite() && point.value.is_finite())
        .collect();
    points.sort_by(|left, right| left.beat.total_cmp(&right.beat));
    points
}

/// Linearly interpolated lane value at `beat`. The first point's value is
/// held before the range, the last point's after it. An empty lane has no
/// opinion and returns `None`.
#[must_use]
pub fn value_at(points: &[AutomationPoint], beat: f64) -> Option<f32> {
    let first = points.first()?;
    if beat <= first.beat {
        return Some(first.value);
    }
    let last = points.last()?;
    if beat >= last.beat {
        return Some(last.value);
    }

    let upper = points.partition_point(|point| point.beat <= beat);
    let right = points[upper];
    let left = points[upper - 1];
    let span = right.beat - left.beat;
    if span <= f64::EPSILON {
        return Some(right.value);
    }
    let t = ((beat - left.beat) / span) as f32;
    Some(left.value + (right.value - left.value) * t)
}

/// Block-rate mixer overrides for one track: automation is evaluated once
/// per render block, before the mixer reads gain and pan for that block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockAutomation {
    pub volume: Option<f32>,
    pub pan: Option<f32>,
}

#[must_use]
pub fn evaluate_block(lanes: &[AutomationLane], beat: f64) -> BlockAutomation {
    let mut out = BlockAutomation::default();
    for lane in lanes {
        let value = value_at(&lane.points, beat);
        match lane.parameter {
            AutomationParameter::Volume => out.volume = value.map(|v| v.clamp(0.0, 1.0)),
            AutomationParameter::Pan => out.pan = value.map(|v| v.clamp(0.0, 1.0)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(beat: f64, value: f32) -> AutomationPoint {
        AutomationPoint { beat, value }
    }

    #[test]
    fn sanitize_sorts_and_drops_non_finite() {
        let points = sanitize_points(vec![
            point(2.0, 0.5),
            point(1.0, f32::NAN),
            point(0.0, 1.0),
        ]);
        assert_eq!(points.len(), 2);
        assert!((points[0].beat - 0.0).abs() < f64::EPSILON);
        assert!((points[1].beat - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn interpolation_holds_ends_and_ramps_between() {
        let points = vec![point(4.0, 0.0), point(8.0, 1.0)];
        assert_eq!(value_at(&points, 0.0), Some(0.0));
        assert_eq!(value_at(&points, 10.0), Some(1.0));
        let mid = value_at(&points, 6.0).expect("mid value should exist");
        assert!((mid - 0.5).abs() < 1e-6);
    }

    #[test]
    fn empty_lane_has_no_value() {
        assert_eq!(value_at(&[], 3.0), None);
    }

    #[test]
    fn block_evaluation_targets_parameters() {
        let lanes = vec![
            AutomationLane {
                parameter: AutomationParameter::Volume,
                points: vec![point(0.0, 0.25)],
            },
            AutomationLane {
                parameter: AutomationParameter::Pan,
                points: vec![point(0.0, 1.0)],
            },
        ];
        let block = evaluate_block(&lanes, 2.0);
        assert_eq!(block.volume, Some(0.25));
        assert_eq!(block.pan, Some(1.0));
    }
}
