//! Motor driver interface.
//!
//! The car has two H-bridge channels: a steering axis (left/right) and a
//! drive axis (forward/reverse). Each direction symbol maps to one line state
//! per axis; composites are the two single-axis states side by side.

use crate::state::Direction;
use serde::Serialize;
use tracing::{debug, trace};

/// State of one H-bridge channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum LineState {
    Forward,
    Reverse,
    #[default]
    Coast,
}

impl LineState {
    /// Logic levels of the channel's two input lines.
    pub fn levels(self) -> (bool, bool) {
        match self {
            LineState::Forward => (true, false),
            LineState::Reverse => (false, true),
            LineState::Coast => (false, false),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MotorCommand {
    pub steering: LineState,
    pub drive: LineState,
}

impl MotorCommand {
    pub const COAST: MotorCommand = MotorCommand {
        steering: LineState::Coast,
        drive: LineState::Coast,
    };

    pub fn is_coast(self) -> bool {
        self == MotorCommand::COAST
    }
}

fn steering_axis(direction: Direction) -> LineState {
    match direction {
        Direction::Left | Direction::ForwardLeft | Direction::BackwardLeft => LineState::Forward,
        Direction::Right | Direction::ForwardRight | Direction::BackwardRight => {
            LineState::Reverse
        }
        Direction::Idle | Direction::Forward | Direction::Backward => LineState::Coast,
    }
}

fn drive_axis(direction: Direction) -> LineState {
    match direction {
        Direction::Forward | Direction::ForwardLeft | Direction::ForwardRight => LineState::Forward,
        Direction::Backward | Direction::BackwardLeft | Direction::BackwardRight => {
            LineState::Reverse
        }
        Direction::Idle | Direction::Left | Direction::Right => LineState::Coast,
    }
}

/// Line assignment for a direction.
pub fn command_for(direction: Direction) -> MotorCommand {
    MotorCommand {
        steering: steering_axis(direction),
        drive: drive_axis(direction),
    }
}

/// Physical output stage. Line writes cannot fail on the target hardware, so
/// neither can these calls.
pub trait MotorDriver {
    fn apply(&mut self, command: MotorCommand);

    /// Duty cycle shared by both channels.
    fn set_duty(&mut self, duty: u8);

    fn drive(&mut self, direction: Direction) {
        self.apply(command_for(direction));
    }
}

impl<M: MotorDriver + ?Sized> MotorDriver for &mut M {
    fn apply(&mut self, command: MotorCommand) {
        (**self).apply(command)
    }

    fn set_duty(&mut self, duty: u8) {
        (**self).set_duty(duty)
    }
}

/// Host-side driver: keeps the current outputs and logs every change.
#[derive(Debug, Default)]
pub struct LoggingMotor {
    command: MotorCommand,
    duty: u8,
}

impl LoggingMotor {
    pub fn new(duty: u8) -> Self {
        Self {
            command: MotorCommand::COAST,
            duty,
        }
    }

    pub fn command(&self) -> MotorCommand {
        self.command
    }

    pub fn duty(&self) -> u8 {
        self.duty
    }
}

impl MotorDriver for LoggingMotor {
    fn apply(&mut self, command: MotorCommand) {
        if command == self.command {
            trace!(?command, "motor lines re-asserted");
        } else {
            let (in1, in2) = command.steering.levels();
            let (in3, in4) = command.drive.levels();
            debug!(in1, in2, in3, in4, "motor lines changed");
        }
        self.command = command;
    }

    fn set_duty(&mut self, duty: u8) {
        debug!(duty, "motor duty cycle");
        self.duty = duty;
    }
}

/// Keeps every call it receives; used by diagnostics and tests.
#[derive(Debug, Default)]
pub struct RecordingMotor {
    pub commands: Vec<MotorCommand>,
    pub duties: Vec<u8>,
}

impl RecordingMotor {
    pub fn last_command(&self) -> Option<MotorCommand> {
        self.commands.last().copied()
    }

    pub fn last_duty(&self) -> Option<u8> {
        self.duties.last().copied()
    }
}

impl MotorDriver for RecordingMotor {
    fn apply(&mut self, command: MotorCommand) {
        self.commands.push(command);
    }

    fn set_duty(&mut self, duty: u8) {
        self.duties.push(duty);
    }
}
