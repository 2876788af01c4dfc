//! Command router: turns `/cmd` and `/speed` arguments into state updates and
//! motor calls. Bad input is normalised, never rejected.

use crate::motor::MotorDriver;
use crate::state::{clamp_speed, ActuationState, Direction};
use tracing::{debug, info};

pub struct CommandRouter<M> {
    motor: M,
}

impl<M: MotorDriver> CommandRouter<M> {
    /// Wraps a motor driver, coasting it and applying the state's duty cycle.
    pub fn new(mut motor: M, state: &ActuationState) -> Self {
        motor.set_duty(state.speed());
        motor.drive(state.direction());
        Self { motor }
    }

    /// Applies a direction token. Unknown tokens stop the car.
    pub fn apply_direction(&mut self, state: &mut ActuationState, token: &str) -> Direction {
        let direction = Direction::from_token(token).unwrap_or_else(|| {
            debug!(token, "unrecognised direction token, stopping");
            Direction::Idle
        });
        state.set_direction(direction);
        self.motor.drive(direction);
        debug!(%direction, "direction applied");
        direction
    }

    /// Clamps and applies a speed value.
    pub fn apply_speed(&mut self, state: &mut ActuationState, value: i64) -> u8 {
        let speed = clamp_speed(value);
        state.set_speed(speed);
        self.motor.set_duty(speed);
        info!(speed, "speed applied");
        speed
    }

    pub fn motor(&self) -> &M {
        &self.motor
    }
}

/// Reads a leading signed decimal integer. Surrounding whitespace is ignored,
/// parsing stops at the first non-digit and no digits yields 0. Overflow
/// saturates so clamping still sees the sign.
pub fn parse_speed_arg(raw: &str) -> i64 {
    let s = raw.trim();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for b in digits.bytes() {
        if !b.is_ascii_digit() {
            break;
        }
        value = value
            .saturating_mul(10)
            .saturating_add(i64::from(b - b'0'));
    }
    if negative {
        -value
    } else {
        value
    }
}
