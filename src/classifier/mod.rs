//! On-device drive classifier.
//!
//! [`QuantizedGraph`] executes a [`CompiledModel`] entirely inside an
//! [`Arena`] reserved at startup: the input tensor, the weights and every
//! activation get a fixed span when the graph is built, and a forward pass
//! touches nothing else.
//!
//! Dense biases are the one exception: they are 32-bit, so the plan keeps
//! them in its own boxed slices, copied once at build time. The arena only
//! holds int8 data and its size is what [`CompiledModel::arena_requirement`]
//! reports.

mod arena;
mod model;
pub mod onnx;

pub use arena::{Arena, Span};
pub use model::{
    CompiledModel, Layer, TensorShape, MAGIC, MAX_DENSE_INPUTS, MAX_POOL_SIZE, NUM_CLASSES,
    SCHEMA_VERSION,
};

use crate::error::{InferenceError, StartupError};
use crate::state::Direction;
use std::fmt;
use tracing::debug;

/// A model that maps one quantized tensor to per-class scores.
pub trait Classifier {
    fn input_shape(&self) -> TensorShape;

    /// Destination for the next input tensor.
    fn input_mut(&mut self) -> &mut [i8];

    /// Runs one forward pass over the current input. Blocks until done.
    fn invoke(&mut self) -> Result<(), InferenceError>;

    /// Scores from the last successful pass, one per drive class.
    fn scores(&self) -> &[i8];
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn input_shape(&self) -> TensorShape {
        (**self).input_shape()
    }

    fn input_mut(&mut self) -> &mut [i8] {
        (**self).input_mut()
    }

    fn invoke(&mut self) -> Result<(), InferenceError> {
        (**self).invoke()
    }

    fn scores(&self) -> &[i8] {
        (**self).scores()
    }
}

/// What the car does for each class index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveClass {
    Left,
    Forward,
    Right,
}

impl DriveClass {
    pub const ALL: [DriveClass; NUM_CLASSES] =
        [DriveClass::Left, DriveClass::Forward, DriveClass::Right];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn direction(self) -> Direction {
        match self {
            DriveClass::Left => Direction::ForwardLeft,
            DriveClass::Forward => Direction::Forward,
            DriveClass::Right => Direction::ForwardRight,
        }
    }
}

impl fmt::Display for DriveClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriveClass::Left => "left",
            DriveClass::Forward => "forward",
            DriveClass::Right => "right",
        };
        f.write_str(name)
    }
}

/// Index and value of the highest score. Ties go to the lowest index.
pub fn decide(scores: &[i8]) -> Option<(usize, i8)> {
    let mut best: Option<(usize, i8)> = None;
    for (i, &s) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if s <= top => {}
            _ => best = Some((i, s)),
        }
    }
    best
}

fn requantize(acc: i64, multiplier: i32, shift: u8) -> i8 {
    let total = 31 + u32::from(shift);
    let rounding = 1i128 << (total - 1);
    let scaled = (i128::from(acc) * i128::from(multiplier) + rounding) >> total;
    scaled.clamp(i8::MIN as i128, i8::MAX as i128) as i8
}

fn rounded_div(sum: i32, n: i32) -> i32 {
    if sum >= 0 {
        (sum + n / 2) / n
    } else {
        (sum - n / 2) / n
    }
}

#[derive(Debug)]
enum Op {
    AvgPool {
        size: usize,
        input: TensorShape,
    },
    Dense {
        inputs: usize,
        relu: bool,
        multiplier: i32,
        shift: u8,
        weights: Span,
        bias: Box<[i32]>,
    },
}

#[derive(Debug)]
struct Step {
    op: Op,
    src: Span,
    dst: Span,
}

pub struct QuantizedGraph {
    arena: Arena,
    steps: Vec<Step>,
    input_shape: TensorShape,
    input: Span,
    output: Span,
}

impl QuantizedGraph {
    /// Lays the model out in `arena`. Fails if the arena is too small.
    pub fn build(mut arena: Arena, model: &CompiledModel) -> Result<Self, StartupError> {
        let shapes = model.shapes()?;
        let input = arena.alloc(model.input.len())?;
        let mut src = input;
        let mut steps = Vec::with_capacity(model.layers.len());
        for (layer, (in_shape, out_shape)) in model
            .layers
            .iter()
            .zip(shapes.iter().zip(shapes.iter().skip(1)))
        {
            let op = match layer {
                Layer::AvgPool { size } => Op::AvgPool {
                    size: *size as usize,
                    input: *in_shape,
                },
                Layer::Dense {
                    relu,
                    multiplier,
                    shift,
                    weights,
                    bias,
                    ..
                } => Op::Dense {
                    inputs: in_shape.len(),
                    relu: *relu,
                    multiplier: *multiplier,
                    shift: *shift,
                    weights: arena.alloc_copy(weights)?,
                    bias: bias.clone().into_boxed_slice(),
                },
            };
            let dst = arena.alloc(out_shape.len())?;
            steps.push(Step { op, src, dst });
            src = dst;
        }
        debug!(
            used = arena.used(),
            capacity = arena.capacity(),
            layers = steps.len(),
            "classifier graph planned"
        );
        Ok(Self {
            arena,
            steps,
            input_shape: model.input,
            input,
            output: src,
        })
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    fn run_step(arena: &mut Arena, step: &Step) {
        let (below, out) = arena.split_at(step.dst);
        let x = &below[step.src.range()];
        match &step.op {
            Op::AvgPool { size, input } => {
                let k = *size;
                let c = input.channels;
                let out_w = input.width / k;
                let n = (k * k) as i32;
                for (o, slot) in out.iter_mut().enumerate() {
                    let ch = o % c;
                    let ox = (o / c) % out_w;
                    let oy = o / c / out_w;
                    let mut sum = 0i32;
                    for dy in 0..k {
                        let row = (oy * k + dy) * input.width;
                        for dx in 0..k {
                            sum += i32::from(x[(row + ox * k + dx) * c + ch]);
                        }
                    }
                    *slot = rounded_div(sum, n) as i8;
                }
            }
            Op::Dense {
                inputs,
                relu,
                multiplier,
                shift,
                weights,
                bias,
            } => {
                let w = &below[weights.range()];
                for (o, slot) in out.iter_mut().enumerate() {
                    let row = &w[o * inputs..(o + 1) * inputs];
                    let acc = row
                        .iter()
                        .zip(x)
                        .fold(i64::from(bias[o]), |acc, (w, v)| {
                            acc + i64::from(*w) * i64::from(*v)
                        });
                    let q = requantize(acc, *multiplier, *shift);
                    *slot = if *relu { q.max(0) } else { q };
                }
            }
        }
    }
}

impl Classifier for QuantizedGraph {
    fn input_shape(&self) -> TensorShape {
        self.input_shape
    }

    fn input_mut(&mut self) -> &mut [i8] {
        self.arena.get_mut(self.input)
    }

    fn invoke(&mut self) -> Result<(), InferenceError> {
        for step in &self.steps {
            Self::run_step(&mut self.arena, step);
        }
        Ok(())
    }

    fn scores(&self) -> &[i8] {
        self.arena.get(self.output)
    }
}
