//! Autonomous driving loop: capture, preprocess, infer, decide, actuate.
//!
//! Every stage of a cycle runs in order on the calling thread. A cycle that
//! cannot produce a decision leaves the motors exactly as they were.

use crate::classifier::{
    decide, onnx, Arena, Classifier, CompiledModel, DriveClass, QuantizedGraph, TensorShape,
};
use crate::config::{Config, Engine};
use crate::error::StartupError;
use crate::frame::{open_source, Encoding, FrameSource};
use crate::motor::MotorDriver;
use crate::preprocess::Preprocessor;
use crate::state::Direction;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    NoFrame,
    /// The frame could not be read or did not fit the preprocessor.
    FrameRejected,
    InferenceFailed,
    Decided { class: DriveClass, score: i8 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub decisions: u64,
    pub no_frame: u64,
    pub rejected: u64,
    pub inference_failures: u64,
}

pub struct AutonomousPilot<S, C, M> {
    source: S,
    preprocessor: Preprocessor,
    classifier: C,
    motor: M,
    stats: CycleStats,
    last: Option<Direction>,
}

impl<S, C, M> AutonomousPilot<S, C, M>
where
    S: FrameSource,
    C: Classifier,
    M: MotorDriver,
{
    /// Wires the stages together. The preprocessor output must match the
    /// classifier input exactly. Motors start coasting.
    pub fn new(
        source: S,
        preprocessor: Preprocessor,
        classifier: C,
        mut motor: M,
        duty: u8,
    ) -> Result<Self, StartupError> {
        let expected = classifier.input_shape().len();
        if preprocessor.output_len() != expected {
            return Err(StartupError::Preprocess(format!(
                "preprocessor produces {} values, classifier expects {expected}",
                preprocessor.output_len()
            )));
        }
        motor.set_duty(duty);
        motor.drive(Direction::Idle);
        Ok(Self {
            source,
            preprocessor,
            classifier,
            motor,
            stats: CycleStats::default(),
            last: None,
        })
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    pub fn motor(&self) -> &M {
        &self.motor
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Direction applied by the most recent successful cycle.
    pub fn last_direction(&self) -> Option<Direction> {
        self.last
    }

    pub fn cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;
        let frame = match self.source.capture() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.stats.no_frame += 1;
                trace!("no frame this cycle");
                return CycleOutcome::NoFrame;
            }
            Err(e) => {
                self.stats.rejected += 1;
                warn!("capture failed: {e}");
                return CycleOutcome::FrameRejected;
            }
        };
        let sequence = frame.sequence;
        if let Err(e) = self
            .preprocessor
            .apply_frame(&frame, self.classifier.input_mut())
        {
            self.stats.rejected += 1;
            warn!(sequence, "frame rejected: {e}");
            return CycleOutcome::FrameRejected;
        }

        if let Err(e) = self.classifier.invoke() {
            self.stats.inference_failures += 1;
            warn!(sequence, "forward pass failed, holding motors: {e}");
            return CycleOutcome::InferenceFailed;
        }
        let decision = decide(self.classifier.scores())
            .and_then(|(index, score)| DriveClass::from_index(index).map(|c| (c, score)));
        let Some((class, score)) = decision else {
            self.stats.inference_failures += 1;
            warn!(sequence, "classifier produced no usable scores");
            return CycleOutcome::InferenceFailed;
        };

        info!(sequence, %class, score, "prediction");
        let direction = class.direction();
        self.motor.drive(direction);
        self.last = Some(direction);
        self.stats.decisions += 1;
        CycleOutcome::Decided { class, score }
    }

    /// Cycles until `shutdown` is set. There is no pacing: the forward pass
    /// sets the rate.
    pub fn run(&mut self, shutdown: &AtomicBool) -> CycleStats {
        while !shutdown.load(Ordering::Relaxed) {
            self.cycle();
        }
        self.motor.drive(Direction::Idle);
        info!(stats = ?self.stats, "autonomous loop stopped");
        self.stats
    }
}

pub type BoxedPilot<M> = AutonomousPilot<Box<dyn FrameSource>, Box<dyn Classifier>, M>;

/// Brings the autonomous pipeline up in dependency order. The arena comes
/// first; if it cannot be reserved neither the camera nor the model is
/// touched.
pub fn start<M: MotorDriver>(cfg: &Config, motor: M) -> Result<BoxedPilot<M>, StartupError> {
    let shape = TensorShape {
        height: cfg.crop as usize,
        width: cfg.crop as usize,
        channels: cfg.channels,
    };
    let arena = match cfg.engine {
        Engine::Arena => Some(Arena::reserve(cfg.arena_bytes)?),
        Engine::Onnx => None,
    };
    let preprocessor = Preprocessor::new(cfg.frame_width, cfg.frame_height, cfg.crop, cfg.channels)?;
    let source = open_source(cfg, Encoding::Gray8)?;

    let classifier: Box<dyn Classifier> = match arena {
        Some(arena) => {
            let model =
                CompiledModel::read(&cfg.model_path).map_err(|source| StartupError::ModelLoad {
                    path: cfg.model_path.clone(),
                    source,
                })?;
            if model.input != shape {
                return Err(StartupError::Preprocess(format!(
                    "model input {:?} does not match crop {:?}",
                    model.input, shape
                )));
            }
            Box::new(QuantizedGraph::build(arena, &model)?)
        }
        None => {
            let path = onnx::resolve_model(&cfg.onnx_model, cfg.onnx_repo.as_deref())?;
            Box::new(onnx::OnnxClassifier::load(
                &path,
                shape,
                cfg.onnx_output_scale,
            )?)
        }
    };
    info!(engine = ?cfg.engine, "classifier ready");
    AutonomousPilot::new(source, preprocessor, classifier, motor, cfg.default_speed)
}
