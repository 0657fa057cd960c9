//! Built-in choreography library.
//!
//! Each preset is an ordered list of steps; a step moves several channels at
//! once in logical percent coordinates (0 = calibrated min, 100 = max) and
//! pauses afterwards. Channel layout: 0 center lift, 1/2 drive mains,
//! 3..=5 port arm (shoulder, elbow, hand), 6..=8 starboard arm.

/// One step of a preset, in logical coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetStep {
    pub targets: Vec<(u8, f32)>,
    pub speed: f32,
    pub delay_after_s: f64,
}

impl PresetStep {
    fn new(targets: &[(u8, f32)], speed: f32, delay_after_s: f64) -> Self {
        Self {
            targets: targets.to_vec(),
            speed,
            delay_after_s,
        }
    }
}

const NEUTRAL: f32 = 50.0;

/// All channels to neutral, one step.
fn all_neutral(speed: f32, delay_after_s: f64) -> PresetStep {
    PresetStep::new(
        &[
            (0, NEUTRAL),
            (1, NEUTRAL),
            (2, NEUTRAL),
            (3, NEUTRAL),
            (4, NEUTRAL),
            (5, NEUTRAL),
            (6, NEUTRAL),
            (7, NEUTRAL),
            (8, NEUTRAL),
        ],
        speed,
        delay_after_s,
    )
}

/// Names of every built-in preset, in a stable order.
pub const PRESET_NAMES: &[&str] = &[
    "reset_positions",
    "step_forward",
    "step_backward",
    "turn_right",
    "turn_left",
    "right_hi",
    "laugh",
    "swing_legs",
    "balance",
    "mic_drop",
    "monster",
    "pose",
    "bow",
];

/// The steps for a named preset, or `None` for an unknown name.
pub fn preset(name: &str) -> Option<Vec<PresetStep>> {
    let steps = match name {
        "reset_positions" => vec![all_neutral(0.5, 0.3)],
        "step_forward" => vec![
            // Lift the torso, swing both mains forward, set down, recentre.
            PresetStep::new(&[(0, 85.0)], 0.8, 0.1),
            PresetStep::new(&[(1, 75.0), (2, 75.0)], 0.6, 0.1),
            PresetStep::new(&[(0, 30.0)], 0.8, 0.1),
            PresetStep::new(&[(1, NEUTRAL), (2, NEUTRAL), (0, NEUTRAL)], 0.5, 0.2),
        ],
        "step_backward" => vec![
            PresetStep::new(&[(0, 85.0)], 0.8, 0.1),
            PresetStep::new(&[(1, 25.0), (2, 25.0)], 0.6, 0.1),
            PresetStep::new(&[(0, 30.0)], 0.8, 0.1),
            PresetStep::new(&[(1, NEUTRAL), (2, NEUTRAL), (0, NEUTRAL)], 0.5, 0.2),
        ],
        "turn_right" => vec![
            PresetStep::new(&[(0, 85.0)], 0.8, 0.1),
            PresetStep::new(&[(1, 75.0), (2, 25.0)], 0.6, 0.1),
            PresetStep::new(&[(0, 30.0)], 0.8, 0.1),
            PresetStep::new(&[(1, NEUTRAL), (2, NEUTRAL), (0, NEUTRAL)], 0.5, 0.2),
        ],
        "turn_left" => vec![
            PresetStep::new(&[(0, 85.0)], 0.8, 0.1),
            PresetStep::new(&[(1, 25.0), (2, 75.0)], 0.6, 0.1),
            PresetStep::new(&[(0, 30.0)], 0.8, 0.1),
            PresetStep::new(&[(1, NEUTRAL), (2, NEUTRAL), (0, NEUTRAL)], 0.5, 0.2),
        ],
        "right_hi" => vec![
            // Raise the starboard arm and wave the hand twice.
            PresetStep::new(&[(6, 90.0), (7, 70.0)], 0.7, 0.2),
            PresetStep::new(&[(8, 80.0)], 0.9, 0.15),
            PresetStep::new(&[(8, 20.0)], 0.9, 0.15),
            PresetStep::new(&[(8, 80.0)], 0.9, 0.15),
            PresetStep::new(&[(6, NEUTRAL), (7, NEUTRAL), (8, NEUTRAL)], 0.5, 0.2),
        ],
        "laugh" => vec![
            PresetStep::new(&[(0, 65.0)], 1.0, 0.08),
            PresetStep::new(&[(0, 40.0)], 1.0, 0.08),
            PresetStep::new(&[(0, 65.0)], 1.0, 0.08),
            PresetStep::new(&[(0, 40.0)], 1.0, 0.08),
            PresetStep::new(&[(0, NEUTRAL)], 0.6, 0.1),
        ],
        "swing_legs" => vec![
            PresetStep::new(&[(0, 80.0)], 0.7, 0.1),
            PresetStep::new(&[(1, 70.0), (2, 30.0)], 0.5, 0.2),
            PresetStep::new(&[(1, 30.0), (2, 70.0)], 0.5, 0.2),
            PresetStep::new(&[(1, 70.0), (2, 30.0)], 0.5, 0.2),
            PresetStep::new(&[(1, NEUTRAL), (2, NEUTRAL), (0, NEUTRAL)], 0.5, 0.2),
        ],
        "balance" => vec![
            PresetStep::new(&[(1, 58.0), (2, 42.0)], 0.3, 0.3),
            PresetStep::new(&[(1, 42.0), (2, 58.0)], 0.3, 0.3),
            PresetStep::new(&[(1, NEUTRAL), (2, NEUTRAL)], 0.3, 0.2),
        ],
        "mic_drop" => vec![
            PresetStep::new(&[(6, 95.0), (7, 80.0), (8, 10.0)], 0.6, 0.5),
            PresetStep::new(&[(8, 90.0)], 1.0, 0.3),
            PresetStep::new(&[(6, 30.0), (7, 40.0)], 0.8, 0.2),
            PresetStep::new(&[(6, NEUTRAL), (7, NEUTRAL), (8, NEUTRAL)], 0.5, 0.2),
        ],
        "monster" => vec![
            PresetStep::new(
                &[(3, 85.0), (4, 70.0), (6, 85.0), (7, 70.0)],
                0.7,
                0.2,
            ),
            PresetStep::new(&[(5, 90.0), (8, 90.0)], 0.9, 0.6),
            PresetStep::new(
                &[
                    (3, NEUTRAL),
                    (4, NEUTRAL),
                    (5, NEUTRAL),
                    (6, NEUTRAL),
                    (7, NEUTRAL),
                    (8, NEUTRAL),
                ],
                0.5,
                0.2,
            ),
        ],
        "pose" => vec![
            PresetStep::new(&[(0, 70.0), (3, 80.0), (4, 60.0)], 0.6, 0.8),
            PresetStep::new(&[(0, NEUTRAL), (3, NEUTRAL), (4, NEUTRAL)], 0.5, 0.2),
        ],
        "bow" => vec![
            PresetStep::new(&[(0, 90.0)], 0.6, 0.2),
            PresetStep::new(&[(1, 65.0), (2, 65.0)], 0.4, 1.0),
            PresetStep::new(&[(1, NEUTRAL), (2, NEUTRAL)], 0.4, 0.2),
            PresetStep::new(&[(0, NEUTRAL)], 0.6, 0.2),
        ],
        _ => return None,
    };
    Some(steps)
}
