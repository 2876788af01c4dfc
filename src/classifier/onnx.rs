//! ONNX execution engine.
//!
//! Runs an exported float model through candle. Inputs are dequantized on the
//! way in and logits quantized on the way out so the control loop sees the
//! same interface as the arena runtime. This engine allocates per pass.

use super::{Classifier, TensorShape, NUM_CLASSES};
use crate::error::{InferenceError, ModelError, StartupError};
use candle_core::{DType, Device, Tensor};
use candle_onnx::{onnx, read_file, simple_eval};
use hf_hub::api::sync::Api;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Scale of the int8 input domain.
const INPUT_SCALE: f32 = 1.0 / 128.0;

pub struct OnnxClassifier {
    model: onnx::ModelProto,
    input_name: String,
    output_name: String,
    shape: TensorShape,
    device: Device,
    input: Vec<i8>,
    scores: [i8; NUM_CLASSES],
    output_scale: f32,
}

/// Finds the model locally, or fetches `filename` from the `repo` model
/// repository on the Hugging Face hub.
pub fn resolve_model(filename: &str, repo: Option<&str>) -> Result<PathBuf, StartupError> {
    if Path::new(filename).exists() {
        return Ok(PathBuf::from(filename));
    }
    let Some(repo) = repo else {
        return Err(StartupError::ModelLoad {
            path: PathBuf::from(filename),
            source: ModelError::Engine("file not found and no repository configured".into()),
        });
    };
    info!(repo, filename, "downloading model");
    Api::new()
        .and_then(|api| api.model(repo.to_string()).get(filename))
        .map_err(|e| StartupError::ModelLoad {
            path: PathBuf::from(filename),
            source: ModelError::Engine(e.to_string()),
        })
}

fn load_error(path: &Path, msg: impl Into<String>) -> StartupError {
    StartupError::ModelLoad {
        path: path.to_path_buf(),
        source: ModelError::Engine(msg.into()),
    }
}

impl OnnxClassifier {
    /// Loads a model taking an NCHW float input of `shape` and returning
    /// [`NUM_CLASSES`] logits. Logits are divided by `output_scale` before
    /// being quantized.
    pub fn load(path: &Path, shape: TensorShape, output_scale: f32) -> Result<Self, StartupError> {
        let model = read_file(path).map_err(|e| load_error(path, e.to_string()))?;
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| load_error(path, "model graph missing"))?;
        let input_name = graph
            .input
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| load_error(path, "model has no inputs"))?;
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| load_error(path, "model has no outputs"))?;
        if output_scale.is_nan() || output_scale <= 0.0 {
            return Err(load_error(path, "output scale must be positive"));
        }
        debug!(%input_name, %output_name, "onnx model loaded");
        Ok(Self {
            model,
            input_name,
            output_name,
            shape,
            device: Device::Cpu,
            input: vec![0; shape.len()],
            scores: [0; NUM_CLASSES],
            output_scale,
        })
    }

    fn forward(&self) -> candle_core::Result<Vec<f32>> {
        let data: Vec<f32> = self.input.iter().map(|v| *v as f32 * INPUT_SCALE).collect();
        let tensor = Tensor::from_vec(
            data,
            (self.shape.height, self.shape.width, self.shape.channels),
            &self.device,
        )?
        .permute((2, 0, 1))?
        .unsqueeze(0)?;
        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), tensor);
        let mut outputs = simple_eval(&self.model, inputs)?;
        let output = outputs
            .remove(&self.output_name)
            .ok_or_else(|| candle_core::Error::Msg("model output missing".into()))?;
        output.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()
    }
}

/// Maps a logit onto the int8 score domain.
pub fn quantize_logit(value: f32, scale: f32) -> i8 {
    (value / scale).round().clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

impl Classifier for OnnxClassifier {
    fn input_shape(&self) -> TensorShape {
        self.shape
    }

    fn input_mut(&mut self) -> &mut [i8] {
        &mut self.input
    }

    fn invoke(&mut self) -> Result<(), InferenceError> {
        let logits = self
            .forward()
            .map_err(|e| InferenceError::Engine(e.to_string()))?;
        if logits.len() != NUM_CLASSES {
            return Err(InferenceError::Engine(format!(
                "model produced {} scores, expected {NUM_CLASSES}",
                logits.len()
            )));
        }
        for (slot, logit) in self.scores.iter_mut().zip(&logits) {
            *slot = quantize_logit(*logit, self.output_scale);
        }
        Ok(())
    }

    fn scores(&self) -> &[i8] {
        &self.scores
    }
}
