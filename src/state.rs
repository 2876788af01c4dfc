//! Actuation state: the drive direction currently applied to the motors, the
//! label flags derived from it and the speed level.
//!
//! The state is owned by whichever control loop is running and handed to the
//! command router (`&mut`) and the frame labeler (`&`). There are no globals.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest accepted duty-cycle value.
pub const SPEED_MIN: u8 = 0;
/// Highest accepted duty-cycle value.
pub const SPEED_MAX: u8 = 255;
/// Duty cycle applied at boot.
pub const DEFAULT_SPEED: u8 = 200;

/// One of the nine drive symbols.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    Idle,
    Forward,
    Backward,
    Left,
    Right,
    ForwardLeft,
    ForwardRight,
    BackwardLeft,
    BackwardRight,
}

impl Direction {
    pub const ALL: [Direction; 9] = [
        Direction::Idle,
        Direction::Forward,
        Direction::Backward,
        Direction::Left,
        Direction::Right,
        Direction::ForwardLeft,
        Direction::ForwardRight,
        Direction::BackwardLeft,
        Direction::BackwardRight,
    ];

    /// Parses a `dir=` token. Only the eight movement tokens and `s` are
    /// recognised; callers decide what an unknown token means.
    pub fn from_token(token: &str) -> Option<Self> {
        let dir = match token {
            "s" => Direction::Idle,
            "f" => Direction::Forward,
            "b" => Direction::Backward,
            "l" => Direction::Left,
            "r" => Direction::Right,
            "fl" => Direction::ForwardLeft,
            "fr" => Direction::ForwardRight,
            "bl" => Direction::BackwardLeft,
            "br" => Direction::BackwardRight,
            _ => return None,
        };
        Some(dir)
    }

    pub fn token(self) -> &'static str {
        match self {
            Direction::Idle => "s",
            Direction::Forward => "f",
            Direction::Backward => "b",
            Direction::Left => "l",
            Direction::Right => "r",
            Direction::ForwardLeft => "fl",
            Direction::ForwardRight => "fr",
            Direction::BackwardLeft => "bl",
            Direction::BackwardRight => "br",
        }
    }

    /// Label flags for this direction. Composite directions set exactly the
    /// two flags of their axes.
    pub fn labels(self) -> LabelFlags {
        let (forward, left, right, back) = match self {
            Direction::Idle => (false, false, false, false),
            Direction::Forward => (true, false, false, false),
            Direction::Backward => (false, false, false, true),
            Direction::Left => (false, true, false, false),
            Direction::Right => (false, false, true, false),
            Direction::ForwardLeft => (true, true, false, false),
            Direction::ForwardRight => (true, false, true, false),
            Direction::BackwardLeft => (false, true, false, true),
            Direction::BackwardRight => (false, false, true, true),
        };
        LabelFlags {
            forward,
            left,
            right,
            back,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// The four per-frame training labels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFlags {
    pub forward: bool,
    pub left: bool,
    pub right: bool,
    pub back: bool,
}

impl LabelFlags {
    pub const ZERO: LabelFlags = LabelFlags {
        forward: false,
        left: false,
        right: false,
        back: false,
    };

    /// Flags as `0`/`1` in wire order: forward, left, right, back.
    pub fn digits(self) -> [u8; 4] {
        [
            self.forward as u8,
            self.left as u8,
            self.right as u8,
            self.back as u8,
        ]
    }

    pub fn is_zero(self) -> bool {
        self == LabelFlags::ZERO
    }
}

/// Clamps any integer into the duty-cycle range. Never fails.
pub fn clamp_speed(value: i64) -> u8 {
    value.clamp(SPEED_MIN as i64, SPEED_MAX as i64) as u8
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActuationState {
    direction: Direction,
    speed: u8,
    generation: u64,
}

impl Default for ActuationState {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED)
    }
}

impl ActuationState {
    pub fn new(speed: u8) -> Self {
        Self {
            direction: Direction::Idle,
            speed,
            generation: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn labels(&self) -> LabelFlags {
        self.direction.labels()
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    /// Counts direction commands applied so far, including repeats.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn set_speed(&mut self, speed: u8) {
        self.speed = speed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn composite_directions_set_both_axis_flags() {
        let fl = Direction::ForwardLeft.labels();
        assert_eq!(fl.digits(), [1, 1, 0, 0]);
        assert_eq!(Direction::ForwardRight.labels().digits(), [1, 0, 1, 0]);
        assert_eq!(Direction::BackwardLeft.labels().digits(), [0, 1, 0, 1]);
        assert_eq!(Direction::BackwardRight.labels().digits(), [0, 0, 1, 1]);
    }

    #[test]
    fn cardinal_directions_set_one_flag() {
        for dir in [
            Direction::Forward,
            Direction::Backward,
            Direction::Left,
            Direction::Right,
        ] {
            let set = dir.labels().digits().iter().filter(|d| **d == 1).count();
            assert_eq!(set, 1, "{dir}");
        }
        assert!(Direction::Idle.labels().is_zero());
    }

    #[test]
    fn tokens_round_trip() {
        for dir in Direction::ALL {
            assert_eq!(Direction::from_token(dir.token()), Some(dir));
        }
        assert_eq!(Direction::from_token("x"), None);
        assert_eq!(Direction::from_token("F"), None);
    }

    #[test]
    fn state_starts_idle_at_default_speed() {
        let state = ActuationState::default();
        assert_eq!(state.direction(), Direction::Idle);
        assert_eq!(state.speed(), DEFAULT_SPEED);
        assert_eq!(state.generation(), 0);
    }

    #[test]
    fn repeated_direction_still_bumps_generation() {
        let mut state = ActuationState::default();
        state.set_direction(Direction::Forward);
        state.set_direction(Direction::Forward);
        assert_eq!(state.generation(), 2);
        assert_eq!(state.labels(), Direction::Forward.labels());
    }

    proptest! {
        #[test]
        fn clamp_is_total_and_idempotent(value in any::<i64>()) {
            let once = clamp_speed(value);
            prop_assert_eq!(clamp_speed(once as i64), once);
            if value < 0 {
                prop_assert_eq!(once, 0);
            } else if value > 255 {
                prop_assert_eq!(once, 255);
            } else {
                prop_assert_eq!(once as i64, value);
            }
        }
    }
}
